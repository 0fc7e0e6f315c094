//! Fee-ordered transaction pool consumed by block assembly.

use std::collections::HashMap;

use cinderd_consensus::AmountBig;
use cinderd_primitives::hash::sha256;
use cinderd_primitives::{encoding, Transaction};
use cinderd_consensus::Hash256;

/// Profit ordering: highest fee first, then smallest serialized size, then
/// the pool key for a total order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ProfitKey {
    fee: AmountBig,
    size: usize,
    id: Hash256,
}

impl Ord for ProfitKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .fee
            .cmp(&self.fee)
            .then(self.size.cmp(&other.size))
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for ProfitKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct PoolEntry {
    pub tx: Transaction,
    pub fee: AmountBig,
    pub size: usize,
}

/// Iteration is over a snapshot of the ordering, so deleting the current
/// entry (or any other) mid-walk is safe.
#[derive(Default)]
pub struct TxPool {
    ordered: std::collections::BTreeMap<ProfitKey, ()>,
    entries: HashMap<Hash256, (ProfitKey, PoolEntry)>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Admit a transaction; the pool key is the digest of its canonical
    /// encoding. Returns the key, or None if it is already pooled.
    pub fn insert(&mut self, tx: Transaction) -> Option<Hash256> {
        let bytes = encoding::encode(&tx);
        let id = sha256(&bytes);
        if self.entries.contains_key(&id) {
            return None;
        }
        let key = ProfitKey {
            fee: tx.fee(),
            size: bytes.len(),
            id,
        };
        let entry = PoolEntry {
            fee: key.fee,
            size: key.size,
            tx,
        };
        self.ordered.insert(key, ());
        self.entries.insert(id, (key, entry));
        Some(id)
    }

    pub fn get(&self, id: &Hash256) -> Option<&PoolEntry> {
        self.entries.get(id).map(|(_, entry)| entry)
    }

    pub fn delete(&mut self, id: &Hash256) -> bool {
        let Some((key, _)) = self.entries.remove(id) else {
            return false;
        };
        self.ordered.remove(&key);
        true
    }

    /// Snapshot of the pool keys in profit order.
    pub fn ordered_ids(&self) -> Vec<Hash256> {
        self.ordered.keys().map(|key| key.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinderd_primitives::{KernelSignature, Point, Scalar, TxKernel};

    fn tx_with_fee(tag: u8, fee: u64) -> Transaction {
        let mut tx = Transaction::default();
        tx.vectors.kernels_out.push(TxKernel {
            excess: Point::from_digest(&sha256(&[tag])),
            fee,
            height_min: 1,
            height_max: u64::MAX,
            signature: KernelSignature {
                nonce: Point::from_digest(&sha256(&[tag, 1])),
                k: Scalar::from_digest(&sha256(&[tag, 2])),
            },
        });
        tx
    }

    #[test]
    fn iteration_is_fee_descending() {
        let mut pool = TxPool::new();
        let low = pool.insert(tx_with_fee(1, 10)).unwrap();
        let high = pool.insert(tx_with_fee(2, 500)).unwrap();
        let mid = pool.insert(tx_with_fee(3, 90)).unwrap();

        assert_eq!(pool.ordered_ids(), vec![high, mid, low]);
    }

    #[test]
    fn delete_during_iteration_is_safe() {
        let mut pool = TxPool::new();
        for tag in 0..6u8 {
            pool.insert(tx_with_fee(tag, 100 + tag as u64));
        }
        for id in pool.ordered_ids() {
            assert!(pool.delete(&id));
        }
        assert!(pool.is_empty());
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut pool = TxPool::new();
        assert!(pool.insert(tx_with_fee(7, 5)).is_some());
        assert!(pool.insert(tx_with_fee(7, 5)).is_none());
        assert_eq!(pool.len(), 1);
    }
}
