//! Network-rule constants shared across validation.

/// Height of the first real block. Height 0 is the pre-genesis sentinel.
pub const HEIGHT_GENESIS: u64 = 1;

/// Timestamps this far ahead of local time are rejected outright.
pub const TIMESTAMP_AHEAD_THRESHOLD_S: u64 = 2 * 60 * 60;

/// The maximum allowed size for a serialized block body, in bytes.
pub const MAX_BODY_SIZE: usize = 0x100000;
