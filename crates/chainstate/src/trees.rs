//! In-memory authenticated indexes over the live ledger state.
//!
//! Both trees are rebuilt from blocks on startup and never persisted;
//! their roots feed the chain definition, so mutation order must be
//! exactly the apply/revert order and nothing else.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use cinderd_consensus::Hash256;
use cinderd_primitives::hash::sha256;
use cinderd_primitives::merkle::root_over_leaves;
use cinderd_primitives::Point;

pub const UTXO_KEY_LEN: usize = 41;

/// Commitment then big-endian maturity, so a lexicographic range walks one
/// commitment's leaves in maturity order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct UtxoKey([u8; UTXO_KEY_LEN]);

impl UtxoKey {
    pub fn new(commitment: &Point, maturity: u64) -> Self {
        let mut bytes = [0u8; UTXO_KEY_LEN];
        bytes[..33].copy_from_slice(&commitment.0);
        bytes[33..].copy_from_slice(&maturity.to_be_bytes());
        Self(bytes)
    }

    pub fn maturity(&self) -> u64 {
        u64::from_be_bytes(self.0[33..].try_into().expect("key length"))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Authenticated UTXO index: reference-counted leaves keyed by
/// (commitment, maturity). Counts are always positive; a decrement to
/// zero removes the leaf.
#[derive(Default)]
pub struct UtxoTree {
    leaves: BTreeMap<UtxoKey, u32>,
    cached_root: Option<Hash256>,
}

impl UtxoTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn clear(&mut self) {
        self.leaves.clear();
        self.cached_root = None;
    }

    pub fn count(&self, key: &UtxoKey) -> Option<u32> {
        self.leaves.get(key).copied()
    }

    /// Visit leaves in `[min, max]` in key order until the visitor returns
    /// `false`. Returns true when the traversal ran to completion, i.e.
    /// nothing stopped it.
    pub fn traverse<F>(&self, min: &UtxoKey, max: &UtxoKey, mut on_leaf: F) -> bool
    where
        F: FnMut(&UtxoKey, u32) -> bool,
    {
        for (key, count) in self
            .leaves
            .range((Bound::Included(*min), Bound::Included(*max)))
        {
            if !on_leaf(key, *count) {
                return false;
            }
        }
        true
    }

    /// Create the leaf or bump its count; false on count overflow.
    pub fn increment(&mut self, key: &UtxoKey) -> bool {
        let slot = self.leaves.entry(*key).or_insert(0);
        let Some(next) = slot.checked_add(1) else {
            if *slot == 0 {
                self.leaves.remove(key);
            }
            return false;
        };
        *slot = next;
        self.cached_root = None;
        true
    }

    /// Drop one reference; false if the leaf is absent.
    pub fn decrement(&mut self, key: &UtxoKey) -> bool {
        let Some(slot) = self.leaves.get_mut(key) else {
            return false;
        };
        debug_assert!(*slot > 0);
        *slot -= 1;
        if *slot == 0 {
            self.leaves.remove(key);
        }
        self.cached_root = None;
        true
    }

    pub fn root(&mut self) -> Hash256 {
        if let Some(root) = self.cached_root {
            return root;
        }
        let leaves: Vec<Hash256> = self
            .leaves
            .iter()
            .map(|(key, count)| {
                let mut data = Vec::with_capacity(UTXO_KEY_LEN + 4);
                data.extend_from_slice(key.as_bytes());
                data.extend_from_slice(&count.to_le_bytes());
                sha256(&data)
            })
            .collect();
        let root = root_over_leaves(&leaves);
        self.cached_root = Some(root);
        root
    }
}

/// Authenticated kernel index: presence-only leaves keyed by kernel id.
/// The all-zero id doubles as the subsidy-era sentinel.
#[derive(Default)]
pub struct KernelTree {
    leaves: BTreeSet<Hash256>,
    cached_root: Option<Hash256>,
}

impl KernelTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn clear(&mut self) {
        self.leaves.clear();
        self.cached_root = None;
    }

    pub fn contains(&self, id: &Hash256) -> bool {
        self.leaves.contains(id)
    }

    /// False if the id is already present: kernels are unique forever.
    pub fn insert(&mut self, id: Hash256) -> bool {
        if !self.leaves.insert(id) {
            return false;
        }
        self.cached_root = None;
        true
    }

    /// False if the id is absent.
    pub fn remove(&mut self, id: &Hash256) -> bool {
        if !self.leaves.remove(id) {
            return false;
        }
        self.cached_root = None;
        true
    }

    pub fn root(&mut self) -> Hash256 {
        if let Some(root) = self.cached_root {
            return root;
        }
        let leaves: Vec<Hash256> = self.leaves.iter().copied().collect();
        let root = root_over_leaves(&leaves);
        self.cached_root = Some(root);
        root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(tag: u8, maturity: u64) -> UtxoKey {
        UtxoKey::new(&Point::from_digest(&sha256(&[tag])), maturity)
    }

    #[test]
    fn maturity_ordering_within_commitment() {
        let mut tree = UtxoTree::new();
        assert!(tree.increment(&key(1, 30)));
        assert!(tree.increment(&key(1, 10)));
        assert!(tree.increment(&key(1, 20)));

        let mut seen = Vec::new();
        let completed = tree.traverse(&key(1, 0), &key(1, u64::MAX), |k, _| {
            seen.push(k.maturity());
            true
        });
        assert!(completed);
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn traverse_stops_on_first_when_asked() {
        let mut tree = UtxoTree::new();
        tree.increment(&key(1, 10));
        tree.increment(&key(1, 20));

        let mut first = None;
        let completed = tree.traverse(&key(1, 0), &key(1, 15), |k, _| {
            first = Some(*k);
            false
        });
        assert!(!completed);
        assert_eq!(first, Some(key(1, 10)));

        // Nothing in range: traversal completes without visiting.
        let completed = tree.traverse(&key(1, 11), &key(1, 15), |_, _| false);
        assert!(completed);
    }

    #[test]
    fn refcounts_round_trip_the_root() {
        let mut tree = UtxoTree::new();
        let before = tree.root();

        tree.increment(&key(3, 7));
        tree.increment(&key(3, 7));
        assert_eq!(tree.count(&key(3, 7)), Some(2));
        let doubled = tree.root();

        tree.decrement(&key(3, 7));
        assert_eq!(tree.count(&key(3, 7)), Some(1));
        assert_ne!(tree.root(), doubled);

        tree.decrement(&key(3, 7));
        assert_eq!(tree.count(&key(3, 7)), None);
        assert_eq!(tree.root(), before);
    }

    #[test]
    fn decrement_missing_leaf_fails() {
        let mut tree = UtxoTree::new();
        assert!(!tree.decrement(&key(5, 1)));
    }

    #[test]
    fn kernel_ids_are_unique() {
        let mut tree = KernelTree::new();
        let id = sha256(b"kernel");
        assert!(tree.insert(id));
        assert!(!tree.insert(id));
        assert!(tree.contains(&id));
        assert!(tree.remove(&id));
        assert!(!tree.remove(&id));
    }

    #[test]
    fn kernel_root_tracks_membership() {
        let mut tree = KernelTree::new();
        let empty = tree.root();
        tree.insert(sha256(b"a"));
        tree.insert(sha256(b"b"));
        let full = tree.root();
        assert_ne!(empty, full);

        tree.remove(&sha256(b"b"));
        tree.remove(&sha256(b"a"));
        assert_eq!(tree.root(), empty);
    }
}
