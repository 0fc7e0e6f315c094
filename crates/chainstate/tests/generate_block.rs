use std::sync::Arc;

use cinderd_chainstate::{BlockContext, DataStatus, Processor, TxPool};
use cinderd_consensus::constants::HEIGHT_GENESIS;
use cinderd_consensus::{rules, Network, ZERO_HASH};
use cinderd_pow::hash_meets_difficulty;
use cinderd_primitives::encoding;
use cinderd_primitives::hash::sha256;
use cinderd_primitives::{
    Body, Input, KernelSignature, Output, Point, Scalar, Transaction, TxKernel,
};
use cinderd_storage::memory::MemoryStore;

const PEER: [u8; 32] = [7u8; 32];

fn new_node() -> Processor<MemoryStore> {
    let mut p = Processor::new(Arc::new(MemoryStore::new()), rules(Network::Regtest));
    p.initialize(false).expect("initialize");
    p
}

fn mine(p: &mut Processor<MemoryStore>, pool: &mut TxPool, seed: [u8; 32]) -> cinderd_primitives::BlockHeader {
    let mut bc = BlockContext::new(pool, seed);
    assert!(p.generate_new_block(&mut bc).expect("generate"));
    let mut header = bc.header;
    let body = bc.body_bytes;
    while !hash_meets_difficulty(&header.hash(), header.bits).expect("bits") {
        header.nonce += 1;
    }
    assert_eq!(p.on_state(&header, &PEER).expect("state"), DataStatus::Accepted);
    assert_eq!(
        p.on_block(&header.id(), &body, &PEER).expect("block"),
        DataStatus::Accepted
    );
    header
}

fn spend_tx(commitment: Point, fee: u64, tag: u8) -> Transaction {
    let mut tx = Transaction {
        offset: Scalar::from_digest(&sha256(&[tag, 0xf0])),
        ..Transaction::default()
    };
    tx.vectors.inputs.push(Input {
        commitment,
        maturity: 0,
    });
    tx.vectors.outputs.push(Output {
        commitment: Point::from_digest(&sha256(&[tag, 0xf1])),
        coinbase: false,
        incubation: 0,
        maturity: 0,
        proof: vec![0x11; 64],
    });
    tx.vectors.kernels_out.push(TxKernel {
        excess: Point::from_digest(&sha256(&[tag, 0xf2])),
        fee,
        height_min: 1,
        height_max: u64::MAX,
        signature: KernelSignature {
            nonce: Point::from_digest(&sha256(&[tag, 0xf3])),
            k: Scalar::from_digest(&sha256(&[tag, 0xf4])),
        },
    });
    tx.vectors.sort();
    tx
}

fn coinbase_commitment(p: &Processor<MemoryStore>, header: &cinderd_primitives::BlockHeader) -> Point {
    let row = p
        .db()
        .state_find(&header.id())
        .expect("find")
        .expect("row");
    let (body_bytes, _) = p.db().get_state_block(row).expect("block");
    let body: Body = encoding::decode(&body_bytes.expect("body")).expect("decode");
    let coinbase = body
        .txv
        .outputs
        .iter()
        .find(|o| o.coinbase)
        .expect("coinbase output");
    coinbase.commitment
}

#[test]
fn empty_genesis_template() {
    let mut p = new_node();
    assert_eq!(p.cursor().sid.row, 0);

    let mut pool = TxPool::new();
    let mut bc = BlockContext::new(&mut pool, [1u8; 32]);
    assert!(p.generate_new_block(&mut bc).expect("generate"));

    let body: Body = encoding::decode(&bc.body_bytes).expect("decode");
    assert!(body.txv.inputs.is_empty());
    assert!(body.txv.kernels_in.is_empty());
    assert_eq!(body.txv.outputs.len(), 1);
    assert!(body.txv.outputs[0].coinbase);
    assert_eq!(body.txv.kernels_out.len(), 1);
    assert_eq!(body.subsidy.lo, p.rules().coinbase_emission);
    assert!(body.subsidy_closing);

    assert_eq!(bc.header.height, HEIGHT_GENESIS);
    assert_eq!(bc.header.prev, ZERO_HASH);
    assert_eq!(bc.header.bits, p.rules().start_difficulty);
    assert_eq!(bc.fees, 0);

    // The template did not move the chain.
    assert_eq!(p.cursor().sid.row, 0);
    assert!(p.extra().subsidy_open);
}

#[test]
fn fee_paying_transaction_gets_commission_output() {
    let mut p = new_node();
    let seed = [2u8; 32];
    let mut pool = TxPool::new();

    let first = mine(&mut p, &mut pool, seed);
    // Blocks until the coinbase lockup (4 on regtest) has passed.
    for _ in 0..5 {
        mine(&mut p, &mut pool, seed);
    }

    let tx = spend_tx(coinbase_commitment(&p, &first), 1_000, 3);
    assert!(p.validate_tx_context(&tx).expect("context"));
    pool.insert(tx).expect("pooled");

    let mut bc = BlockContext::new(&mut pool, seed);
    assert!(p.generate_new_block(&mut bc).expect("generate"));
    assert_eq!(bc.fees, 1_000);

    let body: Body = encoding::decode(&bc.body_bytes).expect("decode");
    assert_eq!(body.txv.inputs.len(), 1);
    // Coinbase, commission, and the transaction's own output.
    assert_eq!(body.txv.outputs.len(), 3);
    assert_eq!(body.txv.kernels_out.len(), 2);

    // The assembled block is valid: apply it.
    let mut header = bc.header;
    let bytes = bc.body_bytes;
    while !hash_meets_difficulty(&header.hash(), header.bits).expect("bits") {
        header.nonce += 1;
    }
    assert_eq!(p.on_state(&header, &PEER).expect("state"), DataStatus::Accepted);
    assert_eq!(
        p.on_block(&header.id(), &bytes, &PEER).expect("block"),
        DataStatus::Accepted
    );
    assert_eq!(p.cursor().id.hash, header.hash());
    // Inclusion does not evict; the pool still holds the transaction.
    assert_eq!(pool.len(), 1);
}

#[test]
fn oversized_transaction_is_evicted_fitting_one_is_kept() {
    let mut p = new_node();
    let seed = [3u8; 32];
    let mut pool = TxPool::new();

    let first = mine(&mut p, &mut pool, seed);
    let second = mine(&mut p, &mut pool, seed);
    for _ in 0..5 {
        mine(&mut p, &mut pool, seed);
    }

    // A transaction that cannot fit even an empty block; the high fee
    // puts it first in line, where the bare-block eviction rule applies.
    let mut huge = spend_tx(coinbase_commitment(&p, &first), 1_000_000, 4);
    huge.vectors.outputs[0].proof = vec![0x22; p.rules().max_body_size];
    pool.insert(huge).expect("pooled");

    // And a normal paying one.
    pool.insert(spend_tx(coinbase_commitment(&p, &second), 25, 5))
        .expect("pooled");
    assert_eq!(pool.len(), 2);

    let mut bc = BlockContext::new(&mut pool, seed);
    assert!(p.generate_new_block(&mut bc).expect("generate"));
    assert_eq!(bc.fees, 25);
    // The oversized transaction is gone; the included one stays pooled.
    assert_eq!(bc.pool.len(), 1);
}

#[test]
fn overflowing_fees_are_evicted() {
    let mut p = new_node();
    let seed = [4u8; 32];
    let mut pool = TxPool::new();

    let first = mine(&mut p, &mut pool, seed);
    for _ in 0..5 {
        mine(&mut p, &mut pool, seed);
    }

    // Two max-fee kernels push the wide fee's high word past zero.
    let mut greedy = spend_tx(coinbase_commitment(&p, &first), u64::MAX, 6);
    let mut second_kernel = greedy.vectors.kernels_out[0].clone();
    second_kernel.fee = u64::MAX;
    second_kernel.excess = Point::from_digest(&sha256(b"second excess"));
    greedy.vectors.kernels_out.push(second_kernel);
    greedy.vectors.sort();
    assert_eq!(greedy.fee().hi, 1);
    pool.insert(greedy).expect("pooled");

    let mut bc = BlockContext::new(&mut pool, seed);
    assert!(p.generate_new_block(&mut bc).expect("generate"));
    assert_eq!(bc.fees, 0);
    assert!(bc.pool.is_empty());

    let body: Body = encoding::decode(&bc.body_bytes).expect("decode");
    assert_eq!(body.txv.outputs.len(), 1);
}
