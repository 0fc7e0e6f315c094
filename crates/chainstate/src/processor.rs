//! The chain state processor: canonical ledger view, fork choice by
//! accumulated work, block apply/revert, pruning, and block assembly.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use cinderd_consensus::constants::HEIGHT_GENESIS;
use cinderd_consensus::{Amount, AmountBig, Hash256, Rules, ZERO_HASH};
use cinderd_log::{log_info, log_warn};
use cinderd_pow::{block_proof, hash_meets_difficulty};
use cinderd_primitives::encoding;
use cinderd_primitives::hash::sha256;
use cinderd_primitives::merkle::interpret;
use cinderd_primitives::{
    BlockHeader, Body, HeaderId, HeightRange, Input, KernelSignature, MacroBlock, Output, Point,
    Scalar, Transaction, TxKernel, TxVectors,
};
use cinderd_storage::KeyValueStore;
use primitive_types::U256;

use crate::mempool::TxPool;
use crate::nodedb::{param, NodeDb, PeerId, StateId, FLAG_ACTIVE, FLAG_FUNCTIONAL, FLAG_REACHABLE};
use crate::rollback::RollbackData;
use crate::trees::{KernelTree, UtxoKey, UtxoTree};
use crate::{corrupted, ChainError};

/// Outcome reported to ingest callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DataStatus {
    Accepted,
    Invalid,
    Rejected,
    Unreachable,
}

/// Overridable notification and policy hooks. Defaults do nothing and
/// approve everything.
pub trait NodeHooks {
    fn request_data(&mut self, _id: &HeaderId, _is_block: bool, _peer: Option<&PeerId>) {}
    fn on_peer_insane(&mut self, _peer: &PeerId) {}
    fn on_new_state(&mut self) {}
    fn on_rolled_back(&mut self) {}
    fn on_state_data(&mut self) {}
    fn on_block_data(&mut self) {}
    fn approve_state(&mut self, _id: &HeaderId) -> bool {
        true
    }
    fn adjust_fossil_end(&mut self, h: u64) -> u64 {
        h
    }
    fn open_macroblock(&mut self, _height: u64) -> Option<MacroBlock> {
        None
    }
}

struct NullHooks;

impl NodeHooks for NullHooks {}

/// Snapshot of the current chain tip.
#[derive(Clone, Debug)]
pub struct Cursor {
    pub sid: StateId,
    pub full: BlockHeader,
    pub id: HeaderId,
    /// History MMR hash over states strictly before the cursor.
    pub history: Hash256,
    /// History MMR hash including the cursor state; the value the next
    /// block's definition binds.
    pub history_next: Hash256,
    pub difficulty_next: u32,
    pub lo_horizon: u64,
}

impl Default for Cursor {
    fn default() -> Self {
        Self {
            sid: StateId::default(),
            full: BlockHeader::default(),
            id: HeaderId {
                height: 0,
                hash: ZERO_HASH,
            },
            history: ZERO_HASH,
            history_next: ZERO_HASH,
            difficulty_next: 0,
            lo_horizon: 0,
        }
    }
}

/// Cumulative quantities that exist outside the trees.
#[derive(Clone, Debug)]
pub struct Extra {
    pub subsidy: AmountBig,
    pub offset: Scalar,
    pub subsidy_open: bool,
}

impl Default for Extra {
    fn default() -> Self {
        Self {
            subsidy: AmountBig::ZERO,
            offset: Scalar::ZERO,
            subsidy_open: true,
        }
    }
}

/// Pruning depths. Unset (`u64::MAX`) means keep everything.
#[derive(Clone, Copy, Debug)]
pub struct Horizon {
    pub branching: u64,
    pub schwarzschild: u64,
}

impl Default for Horizon {
    fn default() -> Self {
        Self {
            branching: u64::MAX,
            schwarzschild: u64::MAX,
        }
    }
}

/// In/out parameters of block assembly.
pub struct BlockContext<'p> {
    pub pool: &'p mut TxPool,
    pub kdf_seed: [u8; 32],
    pub fees: Amount,
    pub header: BlockHeader,
    pub body_bytes: Vec<u8>,
}

impl<'p> BlockContext<'p> {
    pub fn new(pool: &'p mut TxPool, kdf_seed: [u8; 32]) -> Self {
        Self {
            pool,
            kdf_seed,
            fees: 0,
            header: BlockHeader::default(),
            body_bytes: Vec::new(),
        }
    }
}

pub struct Processor<S> {
    pub(crate) rules: Rules,
    pub(crate) db: NodeDb<S>,
    pub(crate) utxos: UtxoTree,
    pub(crate) kernels: KernelTree,
    pub(crate) cursor: Cursor,
    pub(crate) extra: Extra,
    pub horizon: Horizon,
    size_utxo_commission: usize,
    hooks: Box<dyn NodeHooks>,
}

fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl<S: KeyValueStore> Processor<S> {
    pub fn new(store: Arc<S>, rules: Rules) -> Self {
        Self::with_hooks(store, rules, Box::new(NullHooks))
    }

    pub fn with_hooks(store: Arc<S>, rules: Rules, hooks: Box<dyn NodeHooks>) -> Self {
        Self {
            rules,
            db: NodeDb::new(store),
            utxos: UtxoTree::new(),
            kernels: KernelTree::new(),
            cursor: Cursor::default(),
            extra: Extra::default(),
            horizon: Horizon::default(),
            size_utxo_commission: 0,
            hooks,
        }
    }

    pub fn rules(&self) -> &Rules {
        &self.rules
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn extra(&self) -> &Extra {
        &self.extra
    }

    pub fn db(&self) -> &NodeDb<S> {
        &self.db
    }

    pub fn utxo_root(&mut self) -> Hash256 {
        self.utxos.root()
    }

    pub fn kernel_root(&mut self) -> Hash256 {
        self.kernels.root()
    }

    fn with_txn<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, ChainError>,
    ) -> Result<T, ChainError> {
        debug_assert!(!self.db.has_pending());
        let result = f(self);
        match &result {
            Ok(_) => self.db.commit()?,
            Err(_) => self.db.rollback(),
        }
        result
    }

    // ---- initialization ----

    /// Open the store, rebuild the live trees from stored blocks, and
    /// settle onto the best known tip.
    pub fn initialize(&mut self, reset_cursor: bool) -> Result<(), ChainError> {
        self.with_txn(|this| this.initialize_inner(reset_cursor))
    }

    fn initialize_inner(&mut self, reset_cursor: bool) -> Result<(), ChainError> {
        let checksum = self.rules.checksum();
        match self.db.param_get(param::CFG_CHECKSUM)? {
            None => self.db.param_set(param::CFG_CHECKSUM, &checksum),
            Some(stored) => {
                if stored.as_slice() != checksum.as_slice() {
                    return Err(ChainError::Incompatible(format!(
                        "store belongs to a different rule set (stored {:02x?}…)",
                        &stored[..4.min(stored.len())]
                    )));
                }
            }
        }

        self.size_utxo_commission = 0;
        self.extra = Extra::default();
        self.utxos.clear();
        self.kernels.clear();

        if reset_cursor {
            self.db.reset_cursor()?;
        }

        self.init_cursor()?;
        self.initialize_from_blocks()?;

        self.horizon.schwarzschild = self
            .horizon
            .schwarzschild
            .max(self.horizon.branching)
            .max(self.rules.max_rollback_height);

        if !reset_cursor {
            self.try_go_up()?;
        }
        Ok(())
    }

    pub(crate) fn init_cursor(&mut self) -> Result<(), ChainError> {
        if let Some(sid) = self.db.get_cursor()? {
            let full = self.db.get_state_header(sid.row)?;
            self.cursor.sid = sid;
            self.cursor.id = full.id();
            self.cursor.full = full;
            self.cursor.history_next = self.db.predicted_states_hash(sid.height)?;
            self.cursor.history = if sid.height > HEIGHT_GENESIS {
                self.db.predicted_states_hash(sid.height - 1)?
            } else {
                ZERO_HASH
            };
            self.cursor.lo_horizon = self.db.param_get_u64(param::LO_HORIZON)?.unwrap_or(0);
        } else {
            self.cursor = Cursor::default();
        }
        self.cursor.difficulty_next = self.next_difficulty()?;
        Ok(())
    }

    /// Replay stored macroblocks and active-chain bodies to rebuild the
    /// trees, then verify the cursor definition against them.
    fn initialize_from_blocks(&mut self) -> Result<(), ChainError> {
        let mut announced = false;
        let tip_height = self.cursor.id.height;
        self.enum_blocks(|this, mut body, _row, h, h_max| {
            match h_max {
                Some(hm) => log_info!("interpreting macroblock up to {hm}"),
                None => {
                    if !announced {
                        announced = true;
                        log_info!("interpreting blocks up to {tip_height}");
                    }
                }
            }
            if !this.handle_validated_block(&mut body, h, true, h_max.is_none(), h_max)? {
                return Err(corrupted("stored block failed to re-apply"));
            }
            Ok(true)
        })?;

        if self.cursor.id.height >= HEIGHT_GENESIS {
            let definition = self.definition(false);
            if definition != self.cursor.full.definition {
                return Err(corrupted("live state does not match cursor definition"));
            }
        }
        Ok(())
    }

    /// Walk every block of the active chain: the best stored macroblock
    /// first (if any), then per-height bodies. The callback gets the body,
    /// its row (0 for a macroblock), the apply height, and the macroblock
    /// height cap.
    pub fn enum_blocks<F>(&mut self, mut on_block: F) -> Result<bool, ChainError>
    where
        F: FnMut(&mut Self, Body, u64, u64, Option<u64>) -> Result<bool, ChainError>,
    {
        if self.cursor.id.height < HEIGHT_GENESIS {
            return Ok(true);
        }

        let mut covered = 0u64;
        for mb_height in self.db.enum_macroblocks()? {
            if mb_height > self.cursor.id.height {
                continue;
            }
            let Some(mb) = self.open_macroblock(mb_height)? else {
                continue;
            };
            if !on_block(self, mb.body, 0, HEIGHT_GENESIS, Some(mb_height))? {
                return Ok(false);
            }
            covered = mb_height;
            break;
        }

        let mut path = Vec::with_capacity((self.cursor.id.height - covered) as usize);
        for _ in covered..self.cursor.id.height {
            let row = match path.last() {
                None => self.find_active_at_strict(self.cursor.id.height)?,
                Some(&last) => self
                    .db
                    .get_prev_row(last)?
                    .ok_or_else(|| corrupted("active chain broken"))?,
            };
            path.push(row);
        }

        let mut h = covered;
        while let Some(row) = path.pop() {
            let (body_bytes, _) = self.db.get_state_block(row)?;
            let bytes = body_bytes.ok_or_else(|| corrupted("active block body missing"))?;
            if bytes.is_empty() {
                return Err(corrupted("active block body missing"));
            }
            let body: Body =
                encoding::decode(&bytes).map_err(|_| corrupted("active block body malformed"))?;
            h += 1;
            if !on_block(self, body, row, h, None)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn open_macroblock(&mut self, height: u64) -> Result<Option<MacroBlock>, ChainError> {
        if let Some(mb) = self.hooks.open_macroblock(height) {
            return Ok(Some(mb));
        }
        match self.db.get_macroblock(height)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(
                encoding::decode(&bytes).map_err(|_| corrupted("stored macroblock malformed"))?,
            )),
        }
    }

    /// Store a macroblock blob so startup replay can use it.
    pub fn register_macroblock(&mut self, mb: &MacroBlock) -> Result<(), ChainError> {
        self.with_txn(|this| {
            this.db
                .put_macroblock(mb.height_range().max, encoding::encode(mb));
            Ok(())
        })
    }

    // ---- congestion reporting ----

    /// Ask peers for whatever keeps each tip from becoming reachable: the
    /// first missing body, or the first missing header below it.
    pub fn enum_congestions(&mut self) -> Result<(), ChainError> {
        for tip in self.db.enum_tips()? {
            if self.db.get_flags(tip.row)? & FLAG_REACHABLE != 0 {
                continue;
            }
            let work = self.db.get_chain_work(tip.row)?;
            if work < self.cursor.full.chain_work {
                continue;
            }

            let mut sid = tip;
            let mut is_block = true;
            while sid.height > HEIGHT_GENESIS {
                let this_sid = sid;
                match self.db.get_prev(&sid)? {
                    None => {
                        is_block = false;
                        break;
                    }
                    Some(prev) => {
                        if self.db.get_flags(prev.row)? & FLAG_REACHABLE != 0 {
                            sid = this_sid;
                            break;
                        }
                        sid = prev;
                    }
                }
            }

            let header = self.db.get_state_header(sid.row)?;
            let id = if is_block {
                header.id()
            } else {
                HeaderId {
                    height: header.height - 1,
                    hash: header.prev,
                }
            };

            if id.height >= self.cursor.lo_horizon {
                let peer = self.db.get_peer(sid.row)?;
                self.hooks.request_data(&id, is_block, peer.as_ref());
            } else {
                log_warn!("{id} state unreachable");
            }
        }
        Ok(())
    }

    // ---- reorg engine ----

    /// Walk toward the functional tip with the most accumulated work,
    /// rolling back and replaying as needed. Ties keep the current tip.
    pub fn try_go_up(&mut self) -> Result<(), ChainError> {
        let mut dirty = false;

        loop {
            let tips = self.db.enum_functional_tips()?;
            let Some(&(tip, tip_work)) = tips.first() else {
                break;
            };
            if tip_work == self.cursor.full.chain_work {
                break;
            }
            debug_assert!(tip_work > self.cursor.full.chain_work);

            let mut target = tip;
            let mut target_work = tip_work;
            let mut path: Vec<u64> = Vec::new();
            while target.row != self.cursor.sid.row {
                if self.cursor.full.chain_work > target_work {
                    self.rollback_one()?;
                    dirty = true;
                } else {
                    debug_assert_ne!(target.row, 0);
                    path.push(target.row);
                    match self.db.get_prev(&target)? {
                        Some(prev) => {
                            target_work = self.db.get_chain_work(prev.row)?;
                            target = prev;
                        }
                        None => {
                            target = StateId::default();
                            target_work = U256::zero();
                        }
                    }
                }
            }

            let mut path_ok = true;
            for row in path.iter().rev() {
                dirty = true;
                if !self.go_forward(*row)? {
                    path_ok = false;
                    break;
                }
            }

            if path_ok {
                break;
            }
        }

        if dirty {
            self.prune_old()?;
            self.hooks.on_new_state();
        }
        Ok(())
    }

    fn go_forward(&mut self, row: u64) -> Result<bool, ChainError> {
        let sid = StateId {
            row,
            height: self.cursor.sid.height + 1,
        };

        if self.handle_block(&sid, true)? {
            self.db.move_fwd(&sid)?;
            self.init_cursor()?;
            return Ok(true);
        }

        self.db.del_state_block(row);
        self.db.set_state_not_functional(row)?;
        if let Some(peer) = self.db.get_peer(row)? {
            self.db.set_peer(row, None);
            self.hooks.on_peer_insane(&peer);
        }
        Ok(false)
    }

    /// Undo the cursor block. Once invoked this must succeed; inability
    /// to unwind is corruption.
    fn rollback_one(&mut self) -> Result<(), ChainError> {
        let sid = self.cursor.sid;
        self.db.move_back()?;
        self.init_cursor()?;

        if !self.handle_block(&sid, false)? {
            return Err(corrupted("rollback failed"));
        }

        self.init_cursor()?;
        self.hooks.on_rolled_back();
        Ok(())
    }

    // ---- pruning ----

    fn prune_old(&mut self) -> Result<(), ChainError> {
        let cursor_height = self.cursor.sid.height;

        if cursor_height > self.horizon.branching.saturating_add(HEIGHT_GENESIS - 1) {
            let h = cursor_height - self.horizon.branching;
            loop {
                let tips = self.db.enum_tips()?;
                let Some(&first) = tips.first() else {
                    break;
                };
                if first.height >= h {
                    break;
                }
                let mut row = first.row;
                while row != 0 {
                    match self.db.delete_state(row)? {
                        None => break,
                        Some(parent) => row = parent,
                    }
                }
            }
        }

        if cursor_height > self.horizon.schwarzschild.saturating_add(HEIGHT_GENESIS - 1) {
            let mut h = cursor_height - self.horizon.schwarzschild;
            h = h.min(self.cursor.lo_horizon);
            let h = self.hooks.adjust_fossil_end(h);

            let mut fossil = self
                .db
                .param_get_u64(param::FOSSIL_HEIGHT)?
                .unwrap_or(HEIGHT_GENESIS - 1);
            loop {
                fossil += 1;
                if fossil >= h {
                    break;
                }
                self.prune_at(fossil, true)?;
                self.db.param_set_u64(param::FOSSIL_HEIGHT, fossil);
            }
        }
        Ok(())
    }

    fn prune_at(&mut self, h: u64, delete_body: bool) -> Result<(), ChainError> {
        for sid in self.db.enum_states_at(h)? {
            if self.db.get_flags(sid.row)? & FLAG_ACTIVE == 0 {
                self.db.set_state_not_functional(sid.row)?;
            }
            if delete_body {
                self.db.del_state_block(sid.row);
                self.db.set_peer(sid.row, None);
            }
        }
        Ok(())
    }

    pub(crate) fn find_active_at_strict(&self, h: u64) -> Result<u64, ChainError> {
        for sid in self.db.enum_states_at(h)? {
            if self.db.get_flags(sid.row)? & FLAG_ACTIVE != 0 {
                return Ok(sid.row);
            }
        }
        Err(corrupted("no active state at height"))
    }

    // ---- definitions ----

    fn current_live(&mut self) -> Hash256 {
        let utxo_root = self.utxos.root();
        let kernel_root = self.kernels.root();
        interpret(&utxo_root, &kernel_root, true)
    }

    pub(crate) fn definition_with(&mut self, history: &Hash256) -> Hash256 {
        let live = self.current_live();
        interpret(&live, history, false)
    }

    pub(crate) fn definition(&mut self, for_next_state: bool) -> Hash256 {
        let history = if for_next_state {
            self.cursor.history_next
        } else {
            self.cursor.history
        };
        self.definition_with(&history)
    }

    // ---- block application ----

    /// Apply (or revert) the stored block at `sid` to the live state.
    /// The first forward apply runs the full header and body checks and
    /// persists the rollback blob.
    fn handle_block(&mut self, sid: &StateId, fwd: bool) -> Result<bool, ChainError> {
        let (body_bytes, rollback_blob) = self.db.get_state_block(sid.row)?;
        let header = self.db.get_state_header(sid.row)?;
        let id = header.id();

        let bytes = body_bytes.unwrap_or_default();
        let mut block: Body = match encoding::decode(&bytes) {
            Ok(block) => block,
            Err(_) => {
                log_warn!("{id} block deserialization failed");
                return Ok(false);
            }
        };
        let rollback = RollbackData::from_blob(rollback_blob.unwrap_or_default());

        let mut first_time = false;

        if fwd {
            if !rollback.is_applied() {
                first_time = true;

                let expected = match block_proof(header.bits) {
                    Ok(work) => self.cursor.full.chain_work + work,
                    Err(_) => {
                        log_warn!("{id} undecodable difficulty");
                        return Ok(false);
                    }
                };
                if expected != header.chain_work {
                    log_warn!("{id} chain work mismatch");
                    return Ok(false);
                }

                if header.bits != self.cursor.difficulty_next {
                    log_warn!("{id} unexpected difficulty");
                    return Ok(false);
                }

                if header.time <= self.moving_median()? {
                    log_warn!("{id} timestamp inconsistent wrt median");
                    return Ok(false);
                }

                if let Err(err) = block.verify(
                    HeightRange::single(sid.height),
                    self.extra.subsidy_open,
                ) {
                    log_warn!("{id} context-free verification failed: {err}");
                    return Ok(false);
                }
            }
        } else {
            if !rollback.is_applied() {
                return Err(corrupted("reverting a block that was never applied"));
            }
            rollback.export_into(&mut block.txv)?;
        }

        let mut ok = self.handle_validated_block(&mut block, sid.height, fwd, fwd, None)?;
        if !ok {
            log_warn!("{id} invalid in its context");
        }

        if first_time && ok {
            let definition = self.definition(true);
            if definition != header.definition {
                log_warn!("{id} header definition mismatch");
                ok = false;
            }

            if ok {
                let rollback = RollbackData::import(&block.txv);
                self.db.set_state_rollback(sid.row, rollback.buf);

                debug_assert!(self.cursor.lo_horizon <= self.cursor.sid.height);
                if self.cursor.sid.height - self.cursor.lo_horizon > self.rules.max_rollback_height
                {
                    self.cursor.lo_horizon =
                        self.cursor.sid.height - self.rules.max_rollback_height;
                    self.db.param_set_u64(param::LO_HORIZON, self.cursor.lo_horizon);
                }
            } else if !self.handle_validated_block(&mut block, sid.height, false, false, None)? {
                return Err(corrupted("failed to undo a rejected block"));
            }
        }

        if ok {
            log_info!("{id} block interpreted, fwd={fwd}");
        }
        Ok(ok)
    }

    /// Apply the body's four element streams plus the block-level
    /// bookkeeping (subsidy era, cumulative subsidy, offset).
    pub(crate) fn handle_validated_block(
        &mut self,
        block: &mut Body,
        h: u64,
        fwd: bool,
        adjust_input_maturity: bool,
        h_max: Option<u64>,
    ) -> Result<bool, ChainError> {
        if block.subsidy_closing && self.extra.subsidy_open != fwd {
            return Ok(false);
        }

        if !self.handle_validated_tx(&mut block.txv, h, fwd, adjust_input_maturity, h_max)? {
            return Ok(false);
        }

        if block.subsidy_closing {
            self.toggle_subsidy_opened();
        }

        let mut offset = block.offset;
        if fwd {
            self.extra.subsidy.add(block.subsidy);
        } else {
            self.extra.subsidy.sub(block.subsidy);
            offset = offset.negate();
        }
        self.extra.offset = self.extra.offset.add(&offset);

        Ok(true)
    }

    /// Apply the element streams in fixed order, counting as it goes; on
    /// forward failure the already-applied prefix is compensated in exact
    /// reverse order before returning.
    pub(crate) fn handle_validated_tx(
        &mut self,
        txv: &mut TxVectors,
        h: u64,
        fwd: bool,
        adjust_input_maturity: bool,
        h_max: Option<u64>,
    ) -> Result<bool, ChainError> {
        let mut n_inp = 0usize;
        let mut n_out = 0usize;
        let mut n_krn_in = 0usize;
        let mut n_krn_out = 0usize;
        let mut ok = true;

        while n_inp < txv.inputs.len() {
            if !self.handle_input(&mut txv.inputs[n_inp], h, h_max, fwd, adjust_input_maturity)? {
                ok = false;
                break;
            }
            n_inp += 1;
        }
        if ok {
            while n_out < txv.outputs.len() {
                if !self.handle_output(&txv.outputs[n_out], h, h_max, fwd)? {
                    ok = false;
                    break;
                }
                n_out += 1;
            }
        }
        if ok {
            while n_krn_in < txv.kernels_in.len() {
                if !self.handle_kernel(&txv.kernels_in[n_krn_in], fwd, true) {
                    ok = false;
                    break;
                }
                n_krn_in += 1;
            }
        }
        if ok {
            while n_krn_out < txv.kernels_out.len() {
                if !self.handle_kernel(&txv.kernels_out[n_krn_out], fwd, false) {
                    ok = false;
                    break;
                }
                n_krn_out += 1;
            }
        }

        if ok {
            return Ok(true);
        }
        if !fwd {
            return Err(corrupted("reverse apply failed"));
        }

        // Compensate the applied prefix, newest element first.
        for i in (0..n_krn_out).rev() {
            if !self.handle_kernel(&txv.kernels_out[i], false, false) {
                return Err(corrupted("kernel compensation failed"));
            }
        }
        for i in (0..n_krn_in).rev() {
            if !self.handle_kernel(&txv.kernels_in[i], false, true) {
                return Err(corrupted("kernel compensation failed"));
            }
        }
        for i in (0..n_out).rev() {
            if !self.handle_output(&txv.outputs[i], h, h_max, false)? {
                return Err(corrupted("output compensation failed"));
            }
        }
        for i in (0..n_inp).rev() {
            if !self.handle_input(&mut txv.inputs[i], h, h_max, false, false)? {
                return Err(corrupted("input compensation failed"));
            }
        }
        Ok(false)
    }

    fn handle_input(
        &mut self,
        input: &mut Input,
        h: u64,
        h_max: Option<u64>,
        fwd: bool,
        adjust_maturity: bool,
    ) -> Result<bool, ChainError> {
        if fwd {
            if adjust_maturity {
                // Spend the earliest spendable leaf under this commitment.
                let bound = h_max.unwrap_or(h);
                let k_min = UtxoKey::new(&input.commitment, 0);
                let k_max = UtxoKey::new(&input.commitment, bound);
                let mut found: Option<UtxoKey> = None;
                let completed = self.utxos.traverse(&k_min, &k_max, |key, _| {
                    found = Some(*key);
                    false
                });
                if completed {
                    return Ok(false);
                }
                let key = found.expect("traversal stopped on a leaf");
                if !self.utxos.decrement(&key) {
                    return Err(corrupted("utxo leaf vanished mid-spend"));
                }
                // The resolved maturity feeds the rollback blob and
                // macroblock cut-through.
                input.maturity = key.maturity();
            } else {
                let Some(h_max) = h_max else {
                    // Explicit maturity is a macroblock-only privilege.
                    return Ok(false);
                };
                if input.maturity > h_max {
                    return Ok(false);
                }
                let key = UtxoKey::new(&input.commitment, input.maturity);
                if !self.utxos.decrement(&key) {
                    return Ok(false);
                }
            }
        } else {
            let key = UtxoKey::new(&input.commitment, input.maturity);
            if !self.utxos.increment(&key) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn handle_output(
        &mut self,
        output: &Output,
        h: u64,
        h_max: Option<u64>,
        fwd: bool,
    ) -> Result<bool, ChainError> {
        let mut maturity = output.min_maturity(h, &self.rules);

        if output.maturity != 0 {
            if h_max.is_none() {
                // Maturity forgery outside macroblock mode.
                return Ok(false);
            }
            if output.maturity < maturity {
                return Ok(false);
            }
            maturity = output.maturity;
        }

        let key = UtxoKey::new(&output.commitment, maturity);
        if fwd {
            Ok(self.utxos.increment(&key))
        } else {
            Ok(self.utxos.decrement(&key))
        }
    }

    fn handle_kernel(&mut self, kernel: &TxKernel, fwd: bool, is_input: bool) -> bool {
        let add = fwd != is_input;
        let id = kernel.id();
        if add {
            // A duplicate means this exact kernel was used before; banned
            // forever.
            self.kernels.insert(id)
        } else {
            self.kernels.remove(&id)
        }
    }

    /// Flip the subsidy era, witnessed by the zero-key kernel leaf.
    pub(crate) fn toggle_subsidy_opened(&mut self) {
        if self.kernels.insert(ZERO_HASH) {
            debug_assert!(self.extra.subsidy_open);
            self.extra.subsidy_open = false;
        } else {
            self.kernels.remove(&ZERO_HASH);
            debug_assert!(!self.extra.subsidy_open);
            self.extra.subsidy_open = true;
        }
    }

    // ---- header / body ingestion ----

    pub(crate) fn on_state_internal(
        &mut self,
        header: &BlockHeader,
    ) -> Result<(DataStatus, HeaderId), ChainError> {
        let id = header.id();

        if !header.is_sane() {
            log_warn!("{id} header insane");
            return Ok((DataStatus::Invalid, id));
        }

        match hash_meets_difficulty(&id.hash, header.bits) {
            Ok(true) => {}
            _ => {
                log_warn!("{id} pow invalid");
                return Ok((DataStatus::Invalid, id));
            }
        }

        let now = timestamp_now();
        if header.time > now && header.time - now > self.rules.timestamp_ahead_threshold_s {
            log_warn!("{id} timestamp ahead by {}", header.time - now);
            return Ok((DataStatus::Invalid, id));
        }

        if !self.hooks.approve_state(&id) {
            log_warn!("{id} state not approved");
            return Ok((DataStatus::Invalid, id));
        }

        if header.height < self.cursor.lo_horizon {
            return Ok((DataStatus::Unreachable, id));
        }

        if self.db.state_find(&id)?.is_some() {
            return Ok((DataStatus::Rejected, id));
        }

        Ok((DataStatus::Accepted, id))
    }

    /// Ingest a header.
    pub fn on_state(&mut self, header: &BlockHeader, peer: &PeerId) -> Result<DataStatus, ChainError> {
        let (status, id) = self.on_state_internal(header)?;
        if status == DataStatus::Accepted {
            self.with_txn(|this| {
                let row = this.db.insert_state(header)?;
                this.db.set_peer(row, Some(peer));
                Ok(())
            })?;
            log_info!("{id} header accepted");
        }
        self.hooks.on_state_data();
        Ok(status)
    }

    /// Ingest a block body for a known header. If the state is reachable
    /// the reorg runs inside the same transaction.
    pub fn on_block(
        &mut self,
        id: &HeaderId,
        block: &[u8],
        peer: &PeerId,
    ) -> Result<DataStatus, ChainError> {
        self.hooks.on_block_data();

        if block.len() > self.rules.max_body_size {
            log_warn!("{id} block too large: {}", block.len());
            return Ok(DataStatus::Invalid);
        }

        let Some(row) = self.db.state_find(id)? else {
            log_warn!("{id} block unexpected");
            return Ok(DataStatus::Rejected);
        };

        if self.db.get_flags(row)? & FLAG_FUNCTIONAL != 0 {
            log_warn!("{id} block already received");
            return Ok(DataStatus::Rejected);
        }

        if id.height < self.cursor.lo_horizon {
            return Ok(DataStatus::Unreachable);
        }

        log_info!("{id} block received");

        self.with_txn(|this| {
            this.db.set_state_block(row, block);
            this.db.set_state_functional(row)?;
            this.db.set_peer(row, Some(peer));

            if this.db.get_flags(row)? & FLAG_REACHABLE != 0 {
                this.try_go_up()?;
            }
            Ok(())
        })?;

        Ok(DataStatus::Accepted)
    }

    /// Fork-choice comparison for the embedding node's sync logic.
    pub fn is_remote_tip_needed(remote: &BlockHeader, mine: &BlockHeader) -> bool {
        match mine.chain_work.cmp(&remote.chain_work) {
            std::cmp::Ordering::Greater => false,
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => mine.definition != remote.definition,
        }
    }

    // ---- difficulty and median ----

    pub(crate) fn next_difficulty(&self) -> Result<u32, ChainError> {
        if self.cursor.sid.row == 0 {
            return Ok(self.rules.start_difficulty);
        }

        let dh = self.cursor.full.height - HEIGHT_GENESIS;
        if dh == 0 || dh % self.rules.difficulty_review_cycle != 0 {
            return Ok(self.cursor.full.bits);
        }

        let row = self.find_active_at_strict(
            self.cursor.full.height - self.rules.difficulty_review_cycle,
        )?;
        let past = self.db.get_state_header(row)?;
        Ok(cinderd_pow::adjust_difficulty(
            &self.rules,
            self.cursor.full.bits,
            past.time,
            self.cursor.full.time,
        ))
    }

    /// Upper median of the last `window_for_median` timestamps; 0 before
    /// genesis.
    pub(crate) fn moving_median(&self) -> Result<u64, ChainError> {
        if self.cursor.sid.row == 0 {
            return Ok(0);
        }

        let mut timestamps = Vec::with_capacity(self.rules.window_for_median);
        let mut row = self.cursor.sid.row;
        loop {
            let header = self.db.get_state_header(row)?;
            timestamps.push(header.time);
            if timestamps.len() >= self.rules.window_for_median {
                break;
            }
            match self.db.get_prev_row(row)? {
                Some(prev) => row = prev,
                None => break,
            }
        }
        timestamps.sort_unstable();
        Ok(timestamps[timestamps.len() >> 1])
    }

    // ---- mempool admission ----

    pub(crate) fn validate_tx_wrt_height(&self, tx: &Transaction, h: u64) -> bool {
        tx.vectors.kernels_out.iter().all(|k| k.is_in_range(h))
    }

    /// Cheap contextual check for pool admission: input UTXOs exist with
    /// enough multiplicity and kernels are consistent with the tree. The
    /// live structures are not touched.
    pub fn validate_tx_context(&self, tx: &Transaction) -> Result<bool, ChainError> {
        let h = self.cursor.sid.height + 1;
        if !self.validate_tx_wrt_height(tx, h) {
            return Ok(false);
        }

        let inputs = &tx.vectors.inputs;
        let mut i = 0;
        while i < inputs.len() {
            let commitment = inputs[i].commitment;
            let mut needed: u32 = 1;
            while i + 1 < inputs.len() && inputs[i + 1].commitment == commitment {
                i += 1;
                needed += 1;
            }

            let k_min = UtxoKey::new(&commitment, 0);
            let k_max = UtxoKey::new(&commitment, h);
            let mut remaining = needed;
            let completed = self.utxos.traverse(&k_min, &k_max, |_, count| {
                if remaining <= count {
                    return false;
                }
                remaining -= count;
                true
            });
            if completed {
                return Ok(false);
            }
            i += 1;
        }

        Ok(self.validate_tx_context_kernels(&tx.vectors.kernels_out, false)
            && self.validate_tx_context_kernels(&tx.vectors.kernels_in, true))
    }

    fn validate_tx_context_kernels(&self, kernels: &[TxKernel], expect_present: bool) -> bool {
        let mut prev: Option<Hash256> = None;
        for kernel in kernels {
            let id = kernel.id();
            if prev == Some(id) {
                return false;
            }
            if self.kernels.contains(&id) != expect_present {
                return false;
            }
            prev = Some(id);
        }
        true
    }

    // ---- block generation ----

    /// Build a block template on the current tip from the pool, fee
    /// descending. The cursor and trees come out untouched; only the pool
    /// may shrink (evicted transactions).
    pub fn generate_new_block(&mut self, bc: &mut BlockContext<'_>) -> Result<bool, ChainError> {
        let mut body = Body {
            // Insist on closing by default; turned off automatically when
            // the era is already closed.
            subsidy_closing: true,
            ..Body::default()
        };
        self.generate_new_block_inner(bc, &mut body, true)
    }

    /// Same, seeded with a caller-supplied partial body (e.g. treasury).
    pub fn generate_new_block_from(
        &mut self,
        bc: &mut BlockContext<'_>,
        body: &mut Body,
    ) -> Result<bool, ChainError> {
        self.generate_new_block_inner(bc, body, false)
    }

    fn generate_new_block_inner(
        &mut self,
        bc: &mut BlockContext<'_>,
        res: &mut Body,
        initially_empty: bool,
    ) -> Result<bool, ChainError> {
        let h = self.cursor.sid.height + 1;

        if !initially_empty
            && res
                .verify(HeightRange::single(h), self.extra.subsidy_open)
                .is_err()
        {
            return Ok(false);
        }

        debug_assert!(!self.db.has_pending());
        let size_estimated = (|| -> Result<usize, ChainError> {
            if !initially_empty
                && !self.handle_validated_tx(&mut res.txv, h, true, true, None)?
            {
                return Ok(0);
            }
            let size = self.assemble_block(bc, res, h)?;
            if !self.handle_validated_tx(&mut res.txv, h, false, false, None)? {
                return Err(corrupted("block template undo failed"));
            }
            Ok(size)
        })();
        // Nothing of the template generation may persist.
        self.db.rollback();
        let size_estimated = size_estimated?;

        if size_estimated == 0 {
            return Ok(false);
        }

        // The estimate counts each pooled transaction's own offset and
        // length prefixes, so it can only overshoot.
        res.normalize();
        bc.body_bytes = encoding::encode(res);
        debug_assert!(bc.body_bytes.len() <= size_estimated);

        Ok(bc.body_bytes.len() <= self.rules.max_body_size)
    }

    /// Returns the estimated serialized size, or 0 to abort.
    fn assemble_block(
        &mut self,
        bc: &mut BlockContext<'_>,
        res: &mut Body,
        h: u64,
    ) -> Result<usize, ChainError> {
        res.subsidy.add_amount(self.rules.coinbase_emission);
        if !self.extra.subsidy_open {
            res.subsidy_closing = false;
        }

        let mut offset = res.offset;

        // Mandatory elements: coinbase output and a height-keyed kernel.
        let (coinbase, sk) =
            self.create_output(&bc.kdf_seed, self.rules.coinbase_emission, h, true, 0);
        if !self.handle_output(&coinbase, h, None, true)? {
            return Ok(0);
        }
        res.txv.outputs.push(coinbase);
        offset = offset.add(&sk.negate());

        let (kernel, sk) = self.create_kernel(&bc.kdf_seed, h);
        if !self.handle_kernel(&kernel, true, false) {
            // Duplicate height key; should never happen on a fresh tip.
            return Ok(0);
        }
        res.txv.kernels_out.push(kernel);
        offset = offset.add(&sk.negate());

        let mut size = res.serialized_size();
        let size_max = self.rules.max_body_size;
        if size > size_max {
            log_warn!("base block too large");
            return Ok(0);
        }

        // Size of a fee output, measured once per processor lifetime.
        if self.size_utxo_commission == 0 {
            let (placeholder, _) = self.create_output(&[0u8; 32], 0, h, false, 1);
            self.size_utxo_commission = encoding::encoded_size(&placeholder);
        }

        bc.fees = 0;
        let mut n_txs = 0usize;

        for key in bc.pool.ordered_ids() {
            let Some(entry) = bc.pool.get(&key) else {
                continue;
            };
            let (fee, tx_size) = (entry.fee, entry.size);

            if fee.hi != 0 {
                // Fees beyond Amount are unusable.
                bc.pool.delete(&key);
                continue;
            }
            let Some(fees_next) = bc.fees.checked_add(fee.lo) else {
                continue;
            };

            let mut size_next = size + tx_size;
            if bc.fees == 0 && fees_next != 0 {
                size_next += self.size_utxo_commission;
            }

            if size_next > size_max {
                let block_is_bare = res.txv.inputs.is_empty()
                    && res.txv.kernels_in.is_empty()
                    && res.txv.outputs.len() == 1
                    && res.txv.kernels_out.len() == 1;
                if block_is_bare {
                    log_info!("transaction cannot fit even an empty block, evicting");
                    bc.pool.delete(&key);
                }
                continue;
            }

            let mut tx = bc
                .pool
                .get(&key)
                .map(|entry| entry.tx.clone())
                .expect("entry checked above");

            if self.validate_tx_wrt_height(&tx, h)
                && self.handle_validated_tx(&mut tx.vectors, h, true, true, None)?
            {
                res.txv.append(&tx.vectors);
                offset = offset.add(&tx.offset);
                bc.fees = fees_next;
                size = size_next;
                n_txs += 1;
            } else {
                bc.pool.delete(&key);
            }
        }

        log_info!("block template: estimated size {size}, {n_txs} transactions");

        if bc.fees != 0 {
            let (commission, sk) = self.create_output(&bc.kdf_seed, bc.fees, h, false, 1);
            if !self.handle_output(&commission, h, None, true)? {
                return Ok(0);
            }
            res.txv.outputs.push(commission);
            offset = offset.add(&sk.negate());
        }

        // Finalize the header.
        bc.header.prev = if self.cursor.sid.row != 0 {
            self.cursor.id.hash
        } else {
            ZERO_HASH
        };

        // The toggle is deliberately non-persistent: flip, compute, flip
        // back.
        if res.subsidy_closing {
            self.toggle_subsidy_opened();
        }
        bc.header.definition = self.definition(true);
        if res.subsidy_closing {
            self.toggle_subsidy_opened();
        }

        bc.header.height = h;
        bc.header.bits = self.cursor.difficulty_next;
        bc.header.nonce = 0;
        bc.header.chain_work = self.cursor.full.chain_work
            + block_proof(bc.header.bits).map_err(|_| corrupted("cursor difficulty invalid"))?;
        bc.header.time = timestamp_now().max(self.moving_median()? + 1);

        res.offset = offset;
        Ok(size)
    }

    fn create_output(
        &self,
        seed: &[u8; 32],
        value: Amount,
        h: u64,
        coinbase: bool,
        tag: u8,
    ) -> (Output, Scalar) {
        let mut material = Vec::with_capacity(49);
        material.extend_from_slice(seed);
        material.extend_from_slice(&h.to_le_bytes());
        material.extend_from_slice(&value.to_le_bytes());
        material.push(tag);
        let digest = sha256(&material);

        let mut blind_material = digest.to_vec();
        blind_material.push(b'b');
        let blinding = Scalar::from_digest(&sha256(&blind_material));

        let mut proof = Vec::with_capacity(96);
        let mut chunk = digest;
        for _ in 0..3 {
            chunk = sha256(&chunk);
            proof.extend_from_slice(&chunk);
        }

        (
            Output {
                commitment: Point::from_digest(&digest),
                coinbase,
                incubation: 0,
                maturity: 0,
                proof,
            },
            blinding,
        )
    }

    fn create_kernel(&self, seed: &[u8; 32], h: u64) -> (TxKernel, Scalar) {
        let mut material = Vec::with_capacity(43);
        material.extend_from_slice(seed);
        material.extend_from_slice(&h.to_le_bytes());
        material.extend_from_slice(b"krn");
        let digest = sha256(&material);

        let mut nonce_material = digest.to_vec();
        nonce_material.push(b'n');
        let mut k_material = digest.to_vec();
        k_material.push(b'k');
        let mut blind_material = digest.to_vec();
        blind_material.push(b'b');

        (
            TxKernel {
                excess: Point::from_digest(&digest),
                fee: 0,
                height_min: h,
                height_max: u64::MAX,
                signature: KernelSignature {
                    nonce: Point::from_digest(&sha256(&nonce_material)),
                    k: Scalar::from_digest(&sha256(&k_material)),
                },
            },
            Scalar::from_digest(&sha256(&blind_material)),
        )
    }
}
