//! Core chain types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod transaction;

pub use block::{BlockHeader, Body, HeaderElement, HeaderId, HeightRange, MacroBlock};
pub use hash::{sha256, sha256d};
pub use merkle::{interpret, CompactMmr};
pub use transaction::{
    Input, KernelSignature, Output, Point, Scalar, Transaction, TxKernel, TxVectors,
};
