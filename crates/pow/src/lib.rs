//! Compact difficulty encoding, work accounting, and retargeting.

pub mod difficulty;

pub use difficulty::{
    adjust_difficulty, block_proof, compact_to_u256, hash_meets_difficulty, u256_to_compact,
    CompactError,
};
