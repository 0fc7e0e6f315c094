//! Consensus constants, monetary types, and chain rules.

pub mod constants;
pub mod money;
pub mod params;

pub use money::{Amount, AmountBig, COIN};
pub use params::{rules, Network, Rules};

/// 32-byte digest used for header ids, kernel ids, and tree roots.
pub type Hash256 = [u8; 32];

pub const ZERO_HASH: Hash256 = [0u8; 32];
