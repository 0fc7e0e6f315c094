//! Chain rule definitions.
//!
//! `Rules` is immutable after startup and is passed explicitly to the
//! processor; two stores created under different rules refuse to open each
//! other's data via the checksum.

use sha2::{Digest, Sha256};

use crate::constants::{HEIGHT_GENESIS, MAX_BODY_SIZE, TIMESTAMP_AHEAD_THRESHOLD_S};
use crate::money::{Amount, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

#[derive(Clone, Debug)]
pub struct Rules {
    pub network: Network,
    /// Reward minted by every block while the subsidy era is open.
    pub coinbase_emission: Amount,
    /// Blocks before a coinbase output may be spent.
    pub maturity_coinbase: u64,
    /// Blocks before a regular output may be spent.
    pub maturity_standard: u64,
    pub max_body_size: usize,
    /// Deepest reorganization the node will ever perform.
    pub max_rollback_height: u64,
    /// Difficulty is reviewed every this many blocks.
    pub difficulty_review_cycle: u64,
    /// Intended seconds between blocks, the retarget baseline.
    pub target_spacing_s: u64,
    /// Number of trailing timestamps feeding the moving median.
    pub window_for_median: usize,
    pub timestamp_ahead_threshold_s: u64,
    /// Compact difficulty of the first block.
    pub start_difficulty: u32,
}

impl Rules {
    pub fn height_genesis(&self) -> u64 {
        HEIGHT_GENESIS
    }

    /// Digest of every consensus-relevant parameter. Stored in the node
    /// database on first open and compared on every later open.
    pub fn checksum(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(b"cinder.rules.v1");
        hasher.update((self.network as u8).to_le_bytes());
        hasher.update(self.coinbase_emission.to_le_bytes());
        hasher.update(self.maturity_coinbase.to_le_bytes());
        hasher.update(self.maturity_standard.to_le_bytes());
        hasher.update((self.max_body_size as u64).to_le_bytes());
        hasher.update(self.max_rollback_height.to_le_bytes());
        hasher.update(self.difficulty_review_cycle.to_le_bytes());
        hasher.update(self.target_spacing_s.to_le_bytes());
        hasher.update((self.window_for_median as u64).to_le_bytes());
        hasher.update(self.timestamp_ahead_threshold_s.to_le_bytes());
        hasher.update(self.start_difficulty.to_le_bytes());
        hasher.finalize().into()
    }
}

pub fn rules(network: Network) -> Rules {
    match network {
        Network::Mainnet => mainnet_rules(),
        Network::Testnet => testnet_rules(),
        Network::Regtest => regtest_rules(),
    }
}

fn mainnet_rules() -> Rules {
    Rules {
        network: Network::Mainnet,
        coinbase_emission: 80 * COIN,
        maturity_coinbase: 60,
        maturity_standard: 0,
        max_body_size: MAX_BODY_SIZE,
        max_rollback_height: 90,
        difficulty_review_cycle: 1440,
        target_spacing_s: 60,
        window_for_median: 25,
        timestamp_ahead_threshold_s: TIMESTAMP_AHEAD_THRESHOLD_S,
        start_difficulty: 0x1d00_ffff,
    }
}

fn testnet_rules() -> Rules {
    Rules {
        network: Network::Testnet,
        ..mainnet_rules()
    }
}

fn regtest_rules() -> Rules {
    Rules {
        network: Network::Regtest,
        maturity_coinbase: 4,
        max_rollback_height: 30,
        difficulty_review_cycle: 16,
        // Effectively no work: any header hash meets the target.
        start_difficulty: 0x207f_ffff,
        ..mainnet_rules()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_tracks_parameters() {
        let base = rules(Network::Regtest);
        let mut tweaked = base.clone();
        assert_eq!(base.checksum(), tweaked.checksum());

        tweaked.coinbase_emission += 1;
        assert_ne!(base.checksum(), tweaked.checksum());
    }

    #[test]
    fn networks_differ() {
        assert_ne!(
            rules(Network::Mainnet).checksum(),
            rules(Network::Regtest).checksum()
        );
    }
}
