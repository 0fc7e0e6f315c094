use std::sync::Arc;

use cinderd_chainstate::{BlockContext, DataStatus, Horizon, Processor, TxPool};
use cinderd_consensus::{rules, Network};
use cinderd_pow::{block_proof, hash_meets_difficulty};
use cinderd_primitives::hash::sha256;
use cinderd_primitives::BlockHeader;
use cinderd_storage::memory::MemoryStore;

const PEER: [u8; 32] = [2u8; 32];

fn mine(p: &mut Processor<MemoryStore>, seed: [u8; 32]) -> BlockHeader {
    let mut pool = TxPool::new();
    let mut bc = BlockContext::new(&mut pool, seed);
    assert!(p.generate_new_block(&mut bc).expect("generate"));
    let mut header = bc.header;
    while !hash_meets_difficulty(&header.hash(), header.bits).expect("bits") {
        header.nonce += 1;
    }
    let body = bc.body_bytes;
    assert_eq!(p.on_state(&header, &PEER).expect("state"), DataStatus::Accepted);
    assert_eq!(
        p.on_block(&header.id(), &body, &PEER).expect("block"),
        DataStatus::Accepted
    );
    header
}

#[test]
fn schwarzschild_horizon_fossilizes_old_bodies() {
    let mut net_rules = rules(Network::Regtest);
    net_rules.max_rollback_height = 5;

    let mut p = Processor::new(Arc::new(MemoryStore::new()), net_rules);
    p.horizon = Horizon {
        branching: 4,
        schwarzschild: 10,
    };
    p.initialize(false).expect("initialize");

    let mut headers = Vec::new();
    // Genesis plus 20 blocks past it.
    for _ in 0..21 {
        headers.push(mine(&mut p, [0x66; 32]));
    }
    assert_eq!(p.cursor().sid.height, 21);

    // The rollback ceiling pinned the low horizon while block 21 was
    // being applied (the cursor still sat on its parent).
    assert_eq!(p.cursor().lo_horizon, 20 - 5);

    let db = p.db();
    let fossil = db
        .param_get_u64(cinderd_chainstate::nodedb::param::FOSSIL_HEIGHT)
        .expect("param")
        .expect("set");
    assert_eq!(fossil, 10);

    // Heights 1..=10: headers retained, bodies gone. Above: bodies kept.
    for header in &headers {
        let row = db.state_find(&header.id()).expect("find").expect("header kept");
        let (body, rollback) = db.get_state_block(row).expect("blocks");
        if header.height <= 10 {
            assert!(body.is_none(), "height {} should be fossil", header.height);
            assert!(rollback.is_none());
        } else {
            assert!(body.is_some(), "height {} should keep its body", header.height);
        }
    }
}

#[test]
fn branching_horizon_deletes_stale_forks() {
    let mut p = Processor::new(Arc::new(MemoryStore::new()), rules(Network::Regtest));
    p.horizon = Horizon {
        branching: 4,
        schwarzschild: u64::MAX,
    };
    p.initialize(false).expect("initialize");

    let a1 = mine(&mut p, [0x11; 32]);

    // A competing header at height 2 that never gets a body.
    let fork = {
        let mut header = BlockHeader {
            height: 2,
            prev: a1.hash(),
            chain_work: a1.chain_work + block_proof(p.cursor().difficulty_next).expect("work"),
            definition: sha256(b"fork definition"),
            time: a1.time + 30,
            bits: p.cursor().difficulty_next,
            nonce: 0,
        };
        while !hash_meets_difficulty(&header.hash(), header.bits).expect("bits") {
            header.nonce += 1;
        }
        header
    };
    assert_eq!(p.on_state(&fork, &PEER).expect("state"), DataStatus::Accepted);

    for _ in 0..12 {
        mine(&mut p, [0x11; 32]);
    }
    assert_eq!(p.cursor().sid.height, 13);

    // The orphan tip fell below the branching horizon and was deleted;
    // the active chain is intact.
    assert!(p.db().state_find(&fork.id()).expect("find").is_none());
    assert!(p.db().state_find(&a1.id()).expect("find").is_some());
}
