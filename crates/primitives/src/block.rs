//! Block header and body types.

use cinderd_consensus::{AmountBig, Hash256, ZERO_HASH};
use cinderd_consensus::constants::HEIGHT_GENESIS;
use cinderd_pow::{block_proof, CompactError};
use primitive_types::U256;
use rayon::prelude::*;

use crate::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use crate::hash::sha256d;
use crate::transaction::{Scalar, TxVectors};

/// Full block header ("system state"). `definition` commits to the live
/// UTXO/kernel roots and the history MMR; `chain_work` is the accumulated
/// fork-choice quantity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub height: u64,
    pub prev: Hash256,
    pub chain_work: U256,
    pub definition: Hash256,
    pub time: u64,
    pub bits: u32,
    pub nonce: u64,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        sha256d(&crate::encoding::encode(self))
    }

    pub fn id(&self) -> HeaderId {
        HeaderId {
            height: self.height,
            hash: self.hash(),
        }
    }

    pub fn is_sane(&self) -> bool {
        if self.height < HEIGHT_GENESIS {
            return false;
        }
        if (self.height == HEIGHT_GENESIS) != (self.prev == ZERO_HASH) {
            return false;
        }
        !self.chain_work.is_zero()
    }
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            height: 0,
            prev: ZERO_HASH,
            chain_work: U256::zero(),
            definition: ZERO_HASH,
            time: 0,
            bits: 0,
            nonce: 0,
        }
    }
}

impl Encodable for BlockHeader {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.height);
        encoder.write_hash(&self.prev);
        encoder.write_u256_le(&self.chain_work);
        encoder.write_hash(&self.definition);
        encoder.write_u64_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u64_le(self.nonce);
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            height: decoder.read_u64_le()?,
            prev: decoder.read_hash()?,
            chain_work: decoder.read_u256_le()?,
            definition: decoder.read_hash()?,
            time: decoder.read_u64_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u64_le()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct HeaderId {
    pub height: u64,
    pub hash: Hash256,
}

impl std::fmt::Display for HeaderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@", self.height)?;
        for byte in &self.hash[..8] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HeightRange {
    pub min: u64,
    pub max: u64,
}

impl HeightRange {
    pub fn new(min: u64, max: u64) -> Self {
        Self { min, max }
    }

    pub fn single(h: u64) -> Self {
        Self { min: h, max: h }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VerifyError {
    NotNormalized,
    Input(&'static str),
    Output(&'static str),
    Kernel(&'static str),
    SubsidyClosed,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::NotNormalized => write!(f, "body is not in canonical order"),
            VerifyError::Input(message) => write!(f, "bad input: {message}"),
            VerifyError::Output(message) => write!(f, "bad output: {message}"),
            VerifyError::Kernel(message) => write!(f, "bad kernel: {message}"),
            VerifyError::SubsidyClosed => write!(f, "subsidy closing while era already closed"),
        }
    }
}

impl std::error::Error for VerifyError {}

/// Block body: the transaction vectors plus the per-block scalar offset,
/// minted subsidy, and the one-shot era-closing flag.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Body {
    pub txv: TxVectors,
    pub offset: Scalar,
    pub subsidy: AmountBig,
    pub subsidy_closing: bool,
}

impl Body {
    pub fn normalize(&mut self) -> usize {
        self.txv.normalize()
    }

    pub fn serialized_size(&self) -> usize {
        crate::encoding::encoded_size(self)
    }

    /// Context-free validity: canonical ordering, structural element
    /// checks, kernel height ranges against the span the body claims to
    /// cover, and the subsidy-closing gate. Consults no chain state.
    pub fn verify(&self, hr: HeightRange, subsidy_open: bool) -> Result<(), VerifyError> {
        if hr.min > hr.max {
            return Err(VerifyError::Kernel("inverted height range"));
        }
        if self.subsidy_closing && !subsidy_open {
            return Err(VerifyError::SubsidyClosed);
        }
        if !self.txv.is_sorted() {
            return Err(VerifyError::NotNormalized);
        }

        if !self.txv.inputs.iter().all(|v| v.commitment.is_valid()) {
            return Err(VerifyError::Input("malformed commitment"));
        }

        // Range proofs dominate verification cost; sweep them in parallel.
        if !self
            .txv
            .outputs
            .par_iter()
            .all(|v| v.is_structurally_valid())
        {
            return Err(VerifyError::Output("malformed commitment or proof"));
        }

        for kernel in self.txv.kernels_in.iter().chain(&self.txv.kernels_out) {
            if !kernel.is_structurally_valid() {
                return Err(VerifyError::Kernel("malformed kernel"));
            }
            if kernel.height_min > hr.max || kernel.height_max < hr.min {
                return Err(VerifyError::Kernel("height range outside block span"));
            }
        }

        Ok(())
    }

    /// Squash two adjacent spans into one: the union of their vectors with
    /// cut-through applied, summed subsidy and offset. `earlier` must
    /// cover the lower heights.
    pub fn combine(earlier: &Body, later: &Body) -> Body {
        let mut txv = earlier.txv.clone();
        txv.append(&later.txv);
        let mut merged = Body {
            txv,
            offset: earlier.offset.add(&later.offset),
            subsidy: {
                let mut subsidy = earlier.subsidy;
                subsidy.add(later.subsidy);
                subsidy
            },
            subsidy_closing: earlier.subsidy_closing || later.subsidy_closing,
        };
        merged.normalize();
        merged
    }
}

impl Encodable for Body {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.txv.consensus_encode(encoder);
        self.offset.consensus_encode(encoder);
        encoder.write_u64_le(self.subsidy.hi);
        encoder.write_u64_le(self.subsidy.lo);
        encoder.write_u8(u8::from(self.subsidy_closing));
    }
}

impl Decodable for Body {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let txv = TxVectors::consensus_decode(decoder)?;
        let offset = Scalar::consensus_decode(decoder)?;
        let hi = decoder.read_u64_le()?;
        let lo = decoder.read_u64_le()?;
        let subsidy_closing = decoder.read_bool()?;
        Ok(Self {
            txv,
            offset,
            subsidy: AmountBig { hi, lo },
            subsidy_closing,
        })
    }
}

/// One header of a macroblock sequence; height, prev, and chain work are
/// implied by the position after the prefix.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HeaderElement {
    pub definition: Hash256,
    pub time: u64,
    pub bits: u32,
    pub nonce: u64,
}

impl Encodable for HeaderElement {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_hash(&self.definition);
        encoder.write_u64_le(self.time);
        encoder.write_u32_le(self.bits);
        encoder.write_u64_le(self.nonce);
    }
}

impl Decodable for HeaderElement {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            definition: decoder.read_hash()?,
            time: decoder.read_u64_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u64_le()?,
        })
    }
}

/// Compacted archive of a height range: the first header's prefix, one
/// element per height, and a single squashed body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MacroBlock {
    pub start_height: u64,
    pub start_prev: Hash256,
    pub start_chain_work: U256,
    pub elements: Vec<HeaderElement>,
    pub body: Body,
}

impl MacroBlock {
    pub fn height_range(&self) -> HeightRange {
        HeightRange {
            min: self.start_height,
            max: self.start_height + self.elements.len().saturating_sub(1) as u64,
        }
    }

    /// Rebuild the full header sequence. The first header takes the
    /// declared prefix chain work; later ones accumulate their own proof
    /// on top, and each links to the hash of its predecessor.
    pub fn reconstruct_headers(&self) -> Result<Vec<BlockHeader>, CompactError> {
        let mut headers = Vec::with_capacity(self.elements.len());
        let mut prev = self.start_prev;
        let mut chain_work = self.start_chain_work;
        for (index, element) in self.elements.iter().enumerate() {
            if index > 0 {
                chain_work = chain_work + block_proof(element.bits)?;
            }
            let header = BlockHeader {
                height: self.start_height + index as u64,
                prev,
                chain_work,
                definition: element.definition,
                time: element.time,
                bits: element.bits,
                nonce: element.nonce,
            };
            prev = header.hash();
            headers.push(header);
        }
        Ok(headers)
    }
}

impl Encodable for MacroBlock {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u64_le(self.start_height);
        encoder.write_hash(&self.start_prev);
        encoder.write_u256_le(&self.start_chain_work);
        encoder.write_varint(self.elements.len() as u64);
        for element in &self.elements {
            element.consensus_encode(encoder);
        }
        self.body.consensus_encode(encoder);
    }
}

impl Decodable for MacroBlock {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let start_height = decoder.read_u64_le()?;
        let start_prev = decoder.read_hash()?;
        let start_chain_work = decoder.read_u256_le()?;
        let count = decoder.read_varint()? as usize;
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            elements.push(HeaderElement::consensus_decode(decoder)?);
        }
        let body = Body::consensus_decode(decoder)?;
        Ok(Self {
            start_height,
            start_prev,
            start_chain_work,
            elements,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::{decode, encode};
    use crate::hash::sha256;
    use crate::transaction::{Input, KernelSignature, Output, Point, TxKernel, MIN_PROOF_SIZE};

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            prev: if height == HEIGHT_GENESIS {
                ZERO_HASH
            } else {
                sha256(&height.to_le_bytes())
            },
            chain_work: U256::from(height),
            definition: sha256(b"def"),
            time: 1_700_000_000 + height,
            bits: 0x207f_ffff,
            nonce: height,
        }
    }

    fn kernel(tag: u8, min: u64, max: u64) -> TxKernel {
        TxKernel {
            excess: Point::from_digest(&sha256(&[tag])),
            fee: 1,
            height_min: min,
            height_max: max,
            signature: KernelSignature {
                nonce: Point::from_digest(&sha256(&[tag, 2])),
                k: Scalar::from_digest(&sha256(&[tag, 3])),
            },
        }
    }

    #[test]
    fn header_round_trip_and_hash_stability() {
        let h = header(5);
        let bytes = encode(&h);
        let decoded: BlockHeader = decode(&bytes).expect("decode");
        assert_eq!(decoded, h);
        assert_eq!(decoded.hash(), h.hash());
    }

    #[test]
    fn sanity_rules() {
        assert!(header(HEIGHT_GENESIS).is_sane());
        assert!(header(10).is_sane());

        let mut bad = header(10);
        bad.prev = ZERO_HASH;
        assert!(!bad.is_sane());

        let mut bad = header(HEIGHT_GENESIS);
        bad.prev = sha256(b"x");
        assert!(!bad.is_sane());
    }

    #[test]
    fn verify_rejects_unsorted_body() {
        let a = Input {
            commitment: Point::from_digest(&sha256(&[9])),
            maturity: 2,
        };
        let b = Input {
            commitment: Point::from_digest(&sha256(&[1])),
            maturity: 1,
        };
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut body = Body::default();
        body.txv.inputs.push(hi);
        body.txv.inputs.push(lo);
        assert_eq!(
            body.verify(HeightRange::single(5), true),
            Err(VerifyError::NotNormalized)
        );
        body.normalize();
        assert_eq!(body.verify(HeightRange::single(5), true), Ok(()));
    }

    #[test]
    fn verify_enforces_kernel_span() {
        let mut body = Body::default();
        body.txv.kernels_out.push(kernel(1, 10, 20));
        assert!(body.verify(HeightRange::single(15), true).is_ok());
        assert!(body.verify(HeightRange::single(9), true).is_err());
        assert!(body.verify(HeightRange::new(5, 12), true).is_ok());
        assert!(body.verify(HeightRange::new(21, 30), true).is_err());
    }

    #[test]
    fn verify_subsidy_gate() {
        let mut body = Body::default();
        body.subsidy_closing = true;
        assert_eq!(
            body.verify(HeightRange::single(1), false),
            Err(VerifyError::SubsidyClosed)
        );
        assert!(body.verify(HeightRange::single(1), true).is_ok());
    }

    #[test]
    fn combine_cuts_through_spent_outputs() {
        let commitment = Point::from_digest(&sha256(b"mid"));
        let mut earlier = Body::default();
        earlier.txv.outputs.push(Output {
            commitment,
            coinbase: false,
            incubation: 0,
            maturity: 12,
            proof: vec![1; MIN_PROOF_SIZE],
        });
        earlier.subsidy.add_amount(50);
        let mut later = Body::default();
        later.txv.inputs.push(Input {
            commitment,
            maturity: 12,
        });
        later.subsidy.add_amount(50);

        let combined = Body::combine(&earlier, &later);
        assert!(combined.txv.inputs.is_empty());
        assert!(combined.txv.outputs.is_empty());
        assert_eq!(combined.subsidy.lo, 100);
    }

    #[test]
    fn macroblock_header_reconstruction_links_hashes() {
        let elements: Vec<HeaderElement> = (0..4)
            .map(|i| HeaderElement {
                definition: sha256(&[i]),
                time: 1_700_000_000 + i as u64,
                bits: 0x207f_ffff,
                nonce: i as u64,
            })
            .collect();
        let mb = MacroBlock {
            start_height: HEIGHT_GENESIS,
            start_prev: ZERO_HASH,
            start_chain_work: block_proof(0x207f_ffff).expect("work"),
            elements,
            body: Body::default(),
        };

        let headers = mb.reconstruct_headers().expect("headers");
        assert_eq!(headers.len(), 4);
        for pair in headers.windows(2) {
            assert_eq!(pair[1].prev, pair[0].hash());
            assert!(pair[1].chain_work > pair[0].chain_work);
            assert_eq!(pair[1].height, pair[0].height + 1);
        }

        let restored: MacroBlock = decode(&encode(&mb)).expect("round trip");
        assert_eq!(restored, mb);
    }
}
