//! Difficulty and compact target utilities.

use cinderd_consensus::{Hash256, Rules};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let negative = (bits & 0x0080_0000) != 0;

    if negative {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        let shift = 8 * (3 - size);
        word >>= shift;
        U256::from(word)
    } else {
        let shift = 8 * (size - 3);
        U256::from(word) << shift
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32;

    if size <= 3 {
        compact = value.low_u32() << (8 * (3 - size));
    } else {
        let shift = 8 * (size - 3);
        compact = (value >> shift).low_u32();
    }

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

/// Work contributed by one block at the given compact difficulty:
/// `floor(2^256 / (target + 1))`, computed without 512-bit arithmetic.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// True when the header hash (interpreted little-endian) meets the target.
pub fn hash_meets_difficulty(hash: &Hash256, bits: u32) -> Result<bool, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(false);
    }
    Ok(U256::from_little_endian(hash) <= target)
}

/// Retarget at a review boundary: scale the current target by the actual
/// time one full cycle took, clamped to [expected/2, expected*2], and never
/// easier than the start difficulty.
pub fn adjust_difficulty(rules: &Rules, current_bits: u32, ts_past: u64, ts_now: u64) -> u32 {
    let expected = rules.difficulty_review_cycle.saturating_mul(rules.target_spacing_s);
    if expected == 0 {
        return current_bits;
    }

    let actual = ts_now.saturating_sub(ts_past);
    let actual = actual.clamp(expected / 2, expected.saturating_mul(2));

    let Ok(target) = compact_to_u256(current_bits) else {
        return current_bits;
    };
    let Ok(limit) = compact_to_u256(rules.start_difficulty) else {
        return current_bits;
    };

    let scaled = match target.checked_mul(U256::from(actual)) {
        Some(product) => product / U256::from(expected),
        None => limit,
    };
    let next = if scaled > limit { limit } else { scaled };

    u256_to_compact(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinderd_consensus::{rules, Network};

    #[test]
    fn compact_round_trip() {
        for bits in [0x1d00_ffffu32, 0x207f_ffff, 0x1b04_864c, 0x0212_3400] {
            let value = compact_to_u256(bits).expect("decode");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn negative_compact_rejected() {
        assert_eq!(compact_to_u256(0x0480_0001), Err(CompactError::Negative));
    }

    #[test]
    fn proof_is_monotone_in_difficulty() {
        let easy = block_proof(0x207f_ffff).expect("easy");
        let hard = block_proof(0x1d00_ffff).expect("hard");
        assert!(hard > easy);
        assert!(easy >= U256::from(1u64));
    }

    #[test]
    fn retarget_slows_down_fast_chains() {
        let rules = rules(Network::Mainnet);
        let expected = rules.difficulty_review_cycle * rules.target_spacing_s;

        // Blocks twice as fast as intended: target halves, difficulty rises.
        let faster = adjust_difficulty(&rules, 0x1d00_ffff, 1_000, 1_000 + expected / 2);
        let base = compact_to_u256(0x1d00_ffff).unwrap();
        assert!(compact_to_u256(faster).unwrap() < base);

        // Blocks on schedule: unchanged.
        let steady = adjust_difficulty(&rules, 0x1d00_ffff, 1_000, 1_000 + expected);
        assert_eq!(steady, 0x1d00_ffff);
    }

    #[test]
    fn retarget_never_easier_than_start() {
        let rules = rules(Network::Mainnet);
        let expected = rules.difficulty_review_cycle * rules.target_spacing_s;
        let relaxed = adjust_difficulty(
            &rules,
            rules.start_difficulty,
            1_000,
            1_000 + expected * 10,
        );
        assert_eq!(relaxed, rules.start_difficulty);
    }
}
