use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use cinderd_chainstate::{BlockContext, DataStatus, NodeHooks, Processor, TxPool};
use cinderd_consensus::{rules, Network};
use cinderd_pow::{block_proof, hash_meets_difficulty};
use cinderd_primitives::encoding;
use cinderd_primitives::hash::sha256;
use cinderd_primitives::{BlockHeader, Body, Output, Point};
use cinderd_storage::memory::MemoryStore;

const PEER: [u8; 32] = [3u8; 32];
const OTHER_PEER: [u8; 32] = [4u8; 32];

#[derive(Default)]
struct Blamed(AtomicUsize);

struct BlameHooks(Arc<Blamed>);

impl NodeHooks for BlameHooks {
    fn on_peer_insane(&mut self, _peer: &[u8; 32]) {
        self.0 .0.fetch_add(1, Ordering::Relaxed);
    }
}

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
fn reusing_a_kernel_is_invalid_in_context_and_leaves_state_intact() {
    let blamed = Arc::new(Blamed::default());
    let mut p = Processor::with_hooks(
        Arc::new(MemoryStore::new()),
        rules(Network::Regtest),
        Box::new(BlameHooks(Arc::clone(&blamed))),
    );
    p.initialize(false).expect("initialize");

    let _a1 = mine(&mut p, [0x5a; 32]);
    let a2 = mine(&mut p, [0x5a; 32]);

    // Pull the kernel out of the applied block at height 2.
    let a2_row = p.db().state_find(&a2.id()).expect("find").expect("row");
    let (a2_body, _) = p.db().get_state_block(a2_row).expect("bodies");
    let a2_body: Body = encoding::decode(&a2_body.expect("present")).expect("decode");
    let reused_kernel = a2_body.txv.kernels_out[0].clone();

    // Craft a structurally valid successor block that replays it.
    let mut body = Body::default();
    body.subsidy.add_amount(p.rules().coinbase_emission);
    body.txv.outputs.push(Output {
        commitment: Point::from_digest(&sha256(b"rogue coinbase")),
        coinbase: true,
        incubation: 0,
        maturity: 0,
        proof: vec![0x77; 64],
    });
    body.txv.kernels_out.push(reused_kernel);
    body.normalize();
    let body_bytes = encoding::encode(&body);

    let mut header = BlockHeader {
        height: 3,
        prev: a2.hash(),
        chain_work: a2.chain_work + block_proof(p.cursor().difficulty_next).expect("work"),
        definition: sha256(b"never checked"),
        time: a2.time + 60,
        bits: p.cursor().difficulty_next,
        nonce: 0,
    };
    while !hash_meets_difficulty(&header.hash(), header.bits).expect("bits") {
        header.nonce += 1;
    }

    let utxo_before = p.utxo_root();
    let kernel_before = p.kernel_root();

    assert_eq!(
        p.on_state(&header, &OTHER_PEER).expect("state"),
        DataStatus::Accepted
    );
    assert_eq!(
        p.on_block(&header.id(), &body_bytes, &OTHER_PEER)
            .expect("block"),
        DataStatus::Accepted
    );

    // The apply failed in context: cursor unchanged, trees untouched, the
    // offending peer blamed, the state stripped of its body.
    assert_eq!(p.cursor().id.hash, a2.hash());
    assert_eq!(p.utxo_root(), utxo_before);
    assert_eq!(p.kernel_root(), kernel_before);
    assert_eq!(blamed.0.load(Ordering::Relaxed), 1);

    let rogue_row = p.db().state_find(&header.id()).expect("find").expect("row");
    let (rogue_body, _) = p.db().get_state_block(rogue_row).expect("bodies");
    assert!(rogue_body.is_none());
}
