//! Per-block rollback blobs: the input maturities needed to undo a block.

use cinderd_primitives::TxVectors;

use crate::{corrupted, ChainError};

/// Packed little-endian maturities of the block's inputs, in declaration
/// order. A block with no inputs stores a single zero byte, so an applied
/// block is always distinguishable from one that was never applied (whose
/// blob is absent/empty). The convention is on-disk format; do not change
/// it.
#[derive(Clone, Debug, Default)]
pub struct RollbackData {
    pub buf: Vec<u8>,
}

impl RollbackData {
    pub fn from_blob(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// True once the owning block has been applied at least once.
    pub fn is_applied(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Capture the resolved maturities out of an applied block.
    pub fn import(txv: &TxVectors) -> Self {
        if txv.inputs.is_empty() {
            return Self { buf: vec![0u8] };
        }
        let mut buf = Vec::with_capacity(txv.inputs.len() * 8);
        for input in &txv.inputs {
            buf.extend_from_slice(&input.maturity.to_le_bytes());
        }
        Self { buf }
    }

    /// Restore maturities into the block's inputs ahead of a reverse
    /// apply. A size mismatch means the stored blob does not belong to
    /// this body.
    pub fn export_into(&self, txv: &mut TxVectors) -> Result<(), ChainError> {
        if txv.inputs.is_empty() {
            return Ok(());
        }
        if self.buf.len() != txv.inputs.len() * 8 {
            return Err(corrupted("rollback blob size mismatch"));
        }
        for (input, chunk) in txv.inputs.iter_mut().zip(self.buf.chunks_exact(8)) {
            input.maturity = u64::from_le_bytes(chunk.try_into().expect("chunk size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinderd_primitives::hash::sha256;
    use cinderd_primitives::{Input, Point};

    fn input(tag: u8, maturity: u64) -> Input {
        Input {
            commitment: Point::from_digest(&sha256(&[tag])),
            maturity,
        }
    }

    #[test]
    fn no_inputs_uses_sentinel_byte() {
        let txv = TxVectors::default();
        let data = RollbackData::import(&txv);
        assert_eq!(data.buf, vec![0u8]);
        assert!(data.is_applied());
    }

    #[test]
    fn maturities_round_trip() {
        let mut txv = TxVectors::default();
        txv.inputs.push(input(1, 17));
        txv.inputs.push(input(2, 0x1_0000_0001));

        let data = RollbackData::import(&txv);
        assert_eq!(data.buf.len(), 16);

        let mut stripped = txv.clone();
        for entry in &mut stripped.inputs {
            entry.maturity = 0;
        }
        data.export_into(&mut stripped).expect("export");
        assert_eq!(stripped, txv);
    }

    #[test]
    fn size_mismatch_is_corruption() {
        let mut txv = TxVectors::default();
        txv.inputs.push(input(1, 17));
        let data = RollbackData::from_blob(vec![0u8]);
        assert!(matches!(
            data.export_into(&mut txv),
            Err(ChainError::Corrupt(_))
        ));
    }

    #[test]
    fn empty_blob_means_never_applied() {
        assert!(!RollbackData::default().is_applied());
    }
}
