//! Transaction elements: inputs, outputs, kernels, and the blinding
//! offset. Curve points, range proofs, and signatures are carried as
//! opaque bytes; only their structure is checked here.

use cinderd_consensus::{Amount, AmountBig, Hash256, Rules, ZERO_HASH};
use primitive_types::{U256, U512};
use sha2::{Digest, Sha256};

use crate::encoding::{
    encoded_size, Decodable, DecodeError, Decoder, Encodable, Encoder,
};

/// Compressed curve point: one parity byte then the x coordinate.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Point(pub [u8; 33]);

impl Point {
    pub const ZERO: Point = Point([0u8; 33]);

    /// Deterministic point derivation from a digest; the contents are
    /// opaque to consensus, only the encoding shape matters.
    pub fn from_digest(digest: &Hash256) -> Self {
        let mut bytes = [0u8; 33];
        bytes[0] = 0x02 | (digest[31] & 1);
        bytes[1..].copy_from_slice(digest);
        Self(bytes)
    }

    pub fn is_valid(&self) -> bool {
        matches!(self.0[0], 0x02 | 0x03)
    }
}

impl Encodable for Point {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.0);
    }
}

impl Decodable for Point {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self(decoder.read_fixed::<33>()?))
    }
}

// secp256k1 group order, little-endian words.
const ORDER_WORDS: [u64; 4] = [
    0xbfd2_5e8c_d036_4141,
    0xbaae_dce6_af48_a03b,
    0xffff_ffff_ffff_fffe,
    0xffff_ffff_ffff_ffff,
];

fn order() -> U256 {
    U256(ORDER_WORDS)
}

/// Scalar modulo the curve order, stored little-endian. Supports exactly
/// the arithmetic the ledger needs: accumulation and negation of blinding
/// offsets, which must round-trip bit-exactly across apply/revert.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
pub struct Scalar(pub [u8; 32]);

impl Scalar {
    pub const ZERO: Scalar = Scalar([0u8; 32]);

    pub fn from_digest(digest: &Hash256) -> Self {
        let reduced = U256::from_little_endian(digest) % order();
        Self(reduced.to_little_endian())
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    fn to_u256(self) -> U256 {
        U256::from_little_endian(&self.0)
    }

    pub fn add(&self, other: &Scalar) -> Scalar {
        let wide = U512::from(self.to_u256()) + U512::from(other.to_u256());
        let reduced = wide % U512::from(order());
        let bytes = reduced.to_little_endian();
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes[..32]);
        Scalar(out)
    }

    pub fn negate(&self) -> Scalar {
        if self.is_zero() {
            return *self;
        }
        let reduced = order() - (self.to_u256() % order());
        Scalar(reduced.to_little_endian())
    }
}

impl Encodable for Scalar {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_bytes(&self.0);
    }
}

impl Decodable for Scalar {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self(decoder.read_fixed::<32>()?))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Input {
    pub commitment: Point,
    /// Maturity of the consumed leaf. Zero until resolved by forward
    /// apply (or restored from rollback data / carried in a macroblock).
    pub maturity: u64,
}

impl Encodable for Input {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.commitment.consensus_encode(encoder);
        encoder.write_u64_le(self.maturity);
    }
}

impl Decodable for Input {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            commitment: Point::consensus_decode(decoder)?,
            maturity: decoder.read_u64_le()?,
        })
    }
}

pub const MIN_PROOF_SIZE: usize = 64;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Output {
    pub commitment: Point,
    pub coinbase: bool,
    /// Extra blocks past the standard lockup before the output may be
    /// spent.
    pub incubation: u64,
    /// Explicit maturity; zero means unset. Only macroblocks may carry a
    /// non-zero value, and it may only raise the effective maturity.
    pub maturity: u64,
    pub proof: Vec<u8>,
}

impl Output {
    pub fn min_maturity(&self, h: u64, rules: &Rules) -> u64 {
        let lockup = if self.coinbase {
            rules.maturity_coinbase
        } else {
            rules.maturity_standard
        };
        h.saturating_add(lockup).saturating_add(self.incubation)
    }

    pub fn is_structurally_valid(&self) -> bool {
        self.commitment.is_valid() && self.proof.len() >= MIN_PROOF_SIZE
    }

    fn sort_key(&self) -> (Point, u64) {
        (self.commitment, self.maturity)
    }
}

impl Encodable for Output {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.commitment.consensus_encode(encoder);
        let mut flags = 0u8;
        if self.coinbase {
            flags |= 1;
        }
        if self.maturity != 0 {
            flags |= 2;
        }
        encoder.write_u8(flags);
        encoder.write_u64_le(self.incubation);
        if self.maturity != 0 {
            encoder.write_u64_le(self.maturity);
        }
        encoder.write_var_bytes(&self.proof);
    }
}

impl Decodable for Output {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let commitment = Point::consensus_decode(decoder)?;
        let flags = decoder.read_u8()?;
        if flags & !3 != 0 {
            return Err(DecodeError::InvalidData("unknown output flags"));
        }
        let incubation = decoder.read_u64_le()?;
        let maturity = if flags & 2 != 0 {
            let maturity = decoder.read_u64_le()?;
            if maturity == 0 {
                return Err(DecodeError::InvalidData("explicit zero maturity"));
            }
            maturity
        } else {
            0
        };
        let proof = decoder.read_var_bytes()?;
        Ok(Self {
            commitment,
            coinbase: flags & 1 != 0,
            incubation,
            maturity,
            proof,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct KernelSignature {
    pub nonce: Point,
    pub k: Scalar,
}

impl KernelSignature {
    pub fn is_structurally_valid(&self) -> bool {
        self.nonce.is_valid()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxKernel {
    pub excess: Point,
    pub fee: Amount,
    pub height_min: u64,
    pub height_max: u64,
    pub signature: KernelSignature,
}

impl TxKernel {
    /// Kernel identity: everything but the signature. The all-zero id is
    /// reserved for the subsidy sentinel leaf and never appears on a real
    /// kernel.
    pub fn id(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.excess.0);
        hasher.update(self.fee.to_le_bytes());
        hasher.update(self.height_min.to_le_bytes());
        hasher.update(self.height_max.to_le_bytes());
        hasher.finalize().into()
    }

    pub fn is_in_range(&self, h: u64) -> bool {
        self.height_min <= h && h <= self.height_max
    }

    pub fn is_structurally_valid(&self) -> bool {
        self.excess.is_valid()
            && self.height_min <= self.height_max
            && self.signature.is_structurally_valid()
            && self.id() != ZERO_HASH
    }
}

impl Encodable for TxKernel {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.excess.consensus_encode(encoder);
        encoder.write_u64_le(self.fee);
        encoder.write_u64_le(self.height_min);
        encoder.write_u64_le(self.height_max);
        self.signature.nonce.consensus_encode(encoder);
        self.signature.k.consensus_encode(encoder);
    }
}

impl Decodable for TxKernel {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            excess: Point::consensus_decode(decoder)?,
            fee: decoder.read_u64_le()?,
            height_min: decoder.read_u64_le()?,
            height_max: decoder.read_u64_le()?,
            signature: KernelSignature {
                nonce: Point::consensus_decode(decoder)?,
                k: Scalar::consensus_decode(decoder)?,
            },
        })
    }
}

/// The four element streams every transaction-like object carries, in
/// canonical order: inputs and outputs sorted by (commitment, maturity),
/// kernels sorted by id.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxVectors {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub kernels_in: Vec<TxKernel>,
    pub kernels_out: Vec<TxKernel>,
}

impl TxVectors {
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
            && self.outputs.is_empty()
            && self.kernels_in.is_empty()
            && self.kernels_out.is_empty()
    }

    pub fn sort(&mut self) {
        self.inputs.sort();
        self.outputs.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        self.kernels_in.sort_by_key(TxKernel::id);
        self.kernels_out.sort_by_key(TxKernel::id);
    }

    pub fn is_sorted(&self) -> bool {
        self.inputs.windows(2).all(|w| w[0] <= w[1])
            && self
                .outputs
                .windows(2)
                .all(|w| w[0].sort_key() <= w[1].sort_key())
            && self.kernels_in.windows(2).all(|w| w[0].id() <= w[1].id())
            && self.kernels_out.windows(2).all(|w| w[0].id() <= w[1].id())
    }

    pub fn append(&mut self, other: &TxVectors) {
        self.inputs.extend_from_slice(&other.inputs);
        self.outputs.extend(other.outputs.iter().cloned());
        self.kernels_in.extend(other.kernels_in.iter().cloned());
        self.kernels_out.extend(other.kernels_out.iter().cloned());
    }

    /// Sort and cut through: an output consumed by an input with the same
    /// (commitment, maturity) cancels against it, as does a kernel created
    /// and deleted under the same id. Returns the number of cancelled
    /// pairs.
    pub fn normalize(&mut self) -> usize {
        self.sort();
        let mut cancelled = 0;

        let inputs = std::mem::take(&mut self.inputs);
        let outputs = std::mem::take(&mut self.outputs);
        let (inputs, outputs) = cancel_pairs(
            inputs,
            outputs,
            |input| (input.commitment, input.maturity),
            Output::sort_key,
            &mut cancelled,
        );
        self.inputs = inputs;
        self.outputs = outputs;

        let kernels_in = std::mem::take(&mut self.kernels_in);
        let kernels_out = std::mem::take(&mut self.kernels_out);
        let (kernels_in, kernels_out) = cancel_pairs(
            kernels_in,
            kernels_out,
            TxKernel::id,
            TxKernel::id,
            &mut cancelled,
        );
        self.kernels_in = kernels_in;
        self.kernels_out = kernels_out;

        cancelled
    }
}

fn cancel_pairs<A, B, K: Ord>(
    lhs: Vec<A>,
    rhs: Vec<B>,
    lhs_key: impl Fn(&A) -> K,
    rhs_key: impl Fn(&B) -> K,
    cancelled: &mut usize,
) -> (Vec<A>, Vec<B>) {
    let mut kept_lhs = Vec::with_capacity(lhs.len());
    let mut kept_rhs = Vec::with_capacity(rhs.len());
    let mut rhs_iter = rhs.into_iter().peekable();

    for item in lhs {
        let key = lhs_key(&item);
        let mut matched = false;
        while let Some(candidate) = rhs_iter.peek() {
            match rhs_key(candidate).cmp(&key) {
                std::cmp::Ordering::Less => {
                    kept_rhs.push(rhs_iter.next().expect("peeked"));
                }
                std::cmp::Ordering::Equal => {
                    rhs_iter.next();
                    *cancelled += 1;
                    matched = true;
                    break;
                }
                std::cmp::Ordering::Greater => break,
            }
        }
        if !matched {
            kept_lhs.push(item);
        }
    }
    kept_rhs.extend(rhs_iter);
    (kept_lhs, kept_rhs)
}

impl Encodable for TxVectors {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.consensus_encode(encoder);
        }
        encoder.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.consensus_encode(encoder);
        }
        encoder.write_varint(self.kernels_in.len() as u64);
        for kernel in &self.kernels_in {
            kernel.consensus_encode(encoder);
        }
        encoder.write_varint(self.kernels_out.len() as u64);
        for kernel in &self.kernels_out {
            kernel.consensus_encode(encoder);
        }
    }
}

impl Decodable for TxVectors {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        let mut vectors = TxVectors::default();
        let n_inputs = decoder.read_varint()? as usize;
        vectors.inputs.reserve(n_inputs);
        for _ in 0..n_inputs {
            vectors.inputs.push(Input::consensus_decode(decoder)?);
        }
        let n_outputs = decoder.read_varint()? as usize;
        vectors.outputs.reserve(n_outputs);
        for _ in 0..n_outputs {
            vectors.outputs.push(Output::consensus_decode(decoder)?);
        }
        let n_kernels_in = decoder.read_varint()? as usize;
        vectors.kernels_in.reserve(n_kernels_in);
        for _ in 0..n_kernels_in {
            vectors.kernels_in.push(TxKernel::consensus_decode(decoder)?);
        }
        let n_kernels_out = decoder.read_varint()? as usize;
        vectors.kernels_out.reserve(n_kernels_out);
        for _ in 0..n_kernels_out {
            vectors
                .kernels_out
                .push(TxKernel::consensus_decode(decoder)?);
        }
        Ok(vectors)
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Transaction {
    pub vectors: TxVectors,
    pub offset: Scalar,
}

impl Transaction {
    /// Pooled fee: the sum of the declared kernel fees, wide so a hostile
    /// transaction cannot hide an overflow.
    pub fn fee(&self) -> AmountBig {
        let mut fee = AmountBig::ZERO;
        for kernel in &self.vectors.kernels_out {
            fee.add_amount(kernel.fee);
        }
        fee
    }

    pub fn serialized_size(&self) -> usize {
        encoded_size(self)
    }
}

impl Encodable for Transaction {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.vectors.consensus_encode(encoder);
        self.offset.consensus_encode(encoder);
    }
}

impl Decodable for Transaction {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            vectors: TxVectors::consensus_decode(decoder)?,
            offset: Scalar::consensus_decode(decoder)?,
        })
    }
}
