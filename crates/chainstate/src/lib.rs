//! Chain state processing: canonical ledger view, best-chain selection,
//! block apply/revert, pruning, block assembly, and macroblock archives.

pub mod macroblock;
pub mod mempool;
pub mod nodedb;
pub mod processor;
pub mod rollback;
pub mod trees;

pub use mempool::TxPool;
pub use nodedb::{NodeDb, PeerId, StateId};
pub use processor::{BlockContext, Cursor, DataStatus, Extra, Horizon, NodeHooks, Processor};

use cinderd_storage::StoreError;

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    /// Invariant violation that should be impossible; the caller must
    /// halt, on-disk state is not trustworthy past this point.
    Corrupt(&'static str),
    /// Store belongs to a different rule set.
    Incompatible(String),
}

impl std::fmt::Display for ChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainError::Store(err) => write!(f, "{err}"),
            ChainError::Corrupt(message) => write!(f, "node data corrupted: {message}"),
            ChainError::Incompatible(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<StoreError> for ChainError {
    fn from(err: StoreError) -> Self {
        ChainError::Store(err)
    }
}

pub(crate) fn corrupted(reason: &'static str) -> ChainError {
    cinderd_log::log_error!("node data corrupted: {reason}");
    ChainError::Corrupt(reason)
}
