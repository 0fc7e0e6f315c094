//! Authenticated digest plumbing: the order-significant pair combiner and
//! the compact Merkle Mountain Range over past header hashes.

use cinderd_consensus::{Hash256, ZERO_HASH};
use sha2::{Digest, Sha256};

use crate::encoding::{DecodeError, Decoder, Encoder};

/// Combine two digests. `on_right` places `other` on the right of `hash`;
/// the flag makes the combiner order-significant, so swapped operands (or a
/// swapped flag) yield a different parent.
pub fn interpret(hash: &Hash256, other: &Hash256, on_right: bool) -> Hash256 {
    let mut hasher = Sha256::new();
    if on_right {
        hasher.update(hash);
        hasher.update(other);
    } else {
        hasher.update(other);
        hasher.update(hash);
    }
    hasher.finalize().into()
}

/// Root over already-digested leaves. The split point is the largest power
/// of two strictly below the length, so a given leaf sequence has exactly
/// one root.
pub fn root_over_leaves(leaves: &[Hash256]) -> Hash256 {
    match leaves.len() {
        0 => ZERO_HASH,
        1 => leaves[0],
        len => {
            let split = largest_power_below(len);
            let left = root_over_leaves(&leaves[..split]);
            let right = root_over_leaves(&leaves[split..]);
            interpret(&left, &right, true)
        }
    }
}

fn largest_power_below(len: usize) -> usize {
    debug_assert!(len >= 2);
    let mut power = 1usize;
    while power * 2 < len {
        power *= 2;
    }
    power
}

/// Merkle Mountain Range keeping only the peaks. Peak `i` covers a perfect
/// subtree of `2^i` leaves; a peak is present exactly where bit `i` of the
/// leaf count is set, which is what makes the structure serializable from
/// the count plus the present peaks alone.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct CompactMmr {
    count: u64,
    peaks: Vec<Option<Hash256>>,
}

impl CompactMmr {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn append(&mut self, leaf: &Hash256) {
        let mut carry = *leaf;
        let mut level = 0usize;
        loop {
            if level == self.peaks.len() {
                self.peaks.push(None);
            }
            match self.peaks[level].take() {
                None => {
                    self.peaks[level] = Some(carry);
                    break;
                }
                Some(existing) => {
                    carry = interpret(&existing, &carry, true);
                    level += 1;
                }
            }
        }
        self.count += 1;
    }

    /// Bag the peaks, smallest subtree first, earlier peaks on the left.
    pub fn root(&self) -> Hash256 {
        let mut acc: Option<Hash256> = None;
        for peak in self.peaks.iter().flatten() {
            acc = Some(match acc {
                None => *peak,
                Some(right) => interpret(peak, &right, true),
            });
        }
        acc.unwrap_or(ZERO_HASH)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_u64_le(self.count);
        for peak in self.peaks.iter().flatten() {
            encoder.write_hash(peak);
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let count = decoder.read_u64_le()?;
        let levels = 64 - count.leading_zeros() as usize;
        let mut peaks = Vec::with_capacity(levels);
        for level in 0..levels {
            if count & (1u64 << level) != 0 {
                peaks.push(Some(decoder.read_hash()?));
            } else {
                peaks.push(None);
            }
        }
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self { count, peaks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: u8) -> Hash256 {
        [tag; 32]
    }

    #[test]
    fn interpret_is_order_significant() {
        let a = leaf(1);
        let b = leaf(2);
        assert_ne!(interpret(&a, &b, true), interpret(&a, &b, false));
        assert_eq!(interpret(&a, &b, true), interpret(&b, &a, false));
    }

    #[test]
    fn empty_root_is_zero() {
        assert_eq!(CompactMmr::new().root(), ZERO_HASH);
        assert_eq!(root_over_leaves(&[]), ZERO_HASH);
    }

    #[test]
    fn append_changes_root_every_time() {
        let mut mmr = CompactMmr::new();
        let mut seen = Vec::new();
        for tag in 0..20u8 {
            mmr.append(&leaf(tag));
            let root = mmr.root();
            assert!(!seen.contains(&root));
            seen.push(root);
        }
        assert_eq!(mmr.count(), 20);
    }

    #[test]
    fn encode_decode_preserves_structure() {
        let mut mmr = CompactMmr::new();
        for tag in 0..13u8 {
            mmr.append(&leaf(tag));
        }
        let restored = CompactMmr::decode(&mmr.encode()).expect("decode");
        assert_eq!(restored, mmr);
        assert_eq!(restored.root(), mmr.root());

        // Appending to the restored copy tracks the original.
        let mut original = mmr;
        let mut copy = restored;
        original.append(&leaf(0xaa));
        copy.append(&leaf(0xaa));
        assert_eq!(original.root(), copy.root());
    }
}
