//! Persistent node database: headers, state flags, tips, bodies, rollback
//! blobs, peer attribution, history peaks, and named parameters.
//!
//! Writes always land in an overlay first; reads merge it, so a reorg in
//! progress observes its own mutations. `commit` flushes the overlay as a
//! single batch, `rollback` discards it, and nothing reaches the backing
//! store otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;

use cinderd_consensus::Hash256;
use cinderd_primitives::encoding::{Decodable, Decoder, Encodable, Encoder};
use cinderd_primitives::merkle::CompactMmr;
use cinderd_primitives::{BlockHeader, HeaderId};
use cinderd_storage::{Column, KeyValueStore, WriteBatch};
use primitive_types::U256;

use crate::{corrupted, ChainError};

pub type PeerId = [u8; 32];

pub const FLAG_FUNCTIONAL: u8 = 1 << 0;
pub const FLAG_REACHABLE: u8 = 1 << 1;
pub const FLAG_ACTIVE: u8 = 1 << 2;

/// Named persistent parameters.
pub mod param {
    pub const CFG_CHECKSUM: u8 = 1;
    pub const LO_HORIZON: u8 = 2;
    pub const FOSSIL_HEIGHT: u8 = 3;
    pub const CURSOR_ROW: u8 = 4;
    pub const CURSOR_HEIGHT: u8 = 5;
    pub const NEXT_ROW: u8 = 6;
}

/// Opaque row handle plus the height it sits at. Row 0 is null.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct StateId {
    pub row: u64,
    pub height: u64,
}

struct StateRecord {
    header: BlockHeader,
    parent: u64,
    flags: u8,
}

impl StateRecord {
    fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode(&mut encoder);
        encoder.write_u64_le(self.parent);
        encoder.write_u8(self.flags);
        encoder.into_inner()
    }

    fn decode(bytes: &[u8]) -> Result<Self, ChainError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode(&mut decoder)
            .map_err(|_| corrupted("bad state record header"))?;
        let parent = decoder
            .read_u64_le()
            .map_err(|_| corrupted("bad state record parent"))?;
        let flags = decoder
            .read_u8()
            .map_err(|_| corrupted("bad state record flags"))?;
        if !decoder.is_empty() {
            return Err(corrupted("trailing bytes in state record"));
        }
        Ok(Self {
            header,
            parent,
            flags,
        })
    }
}

fn row_key(row: u64) -> [u8; 8] {
    row.to_be_bytes()
}

fn height_row_key(height: u64, row: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&height.to_be_bytes());
    key[8..].copy_from_slice(&row.to_be_bytes());
    key
}

fn split_height_row_key(key: &[u8]) -> Result<(u64, u64), ChainError> {
    if key.len() != 16 {
        return Err(corrupted("bad height/row key"));
    }
    let height = u64::from_be_bytes(key[..8].try_into().expect("key length"));
    let row = u64::from_be_bytes(key[8..].try_into().expect("key length"));
    Ok((height, row))
}

pub struct NodeDb<S> {
    store: Arc<S>,
    pending: BTreeMap<(Column, Vec<u8>), Option<Vec<u8>>>,
}

impl<S: KeyValueStore> NodeDb<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    // ---- overlay plumbing ----

    fn read(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, ChainError> {
        if let Some(entry) = self.pending.get(&(column, key.to_vec())) {
            return Ok(entry.clone());
        }
        Ok(self.store.get(column, key)?)
    }

    fn write(&mut self, column: Column, key: &[u8], value: Vec<u8>) {
        self.pending.insert((column, key.to_vec()), Some(value));
    }

    fn erase(&mut self, column: Column, key: &[u8]) {
        self.pending.insert((column, key.to_vec()), None);
    }

    fn scan_merged(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChainError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .store
            .scan_prefix(column, prefix)?
            .into_iter()
            .collect();
        for ((entry_column, key), value) in self.pending.range((column, prefix.to_vec())..) {
            if *entry_column != column || !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    /// Flush the overlay as one batch.
    pub fn commit(&mut self) -> Result<(), ChainError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        batch.reserve(self.pending.len());
        for ((column, key), value) in std::mem::take(&mut self.pending) {
            match value {
                Some(value) => batch.put(column, key, value),
                None => batch.delete(column, key),
            }
        }
        self.store.write_batch(&batch)?;
        Ok(())
    }

    /// Discard uncommitted writes.
    pub fn rollback(&mut self) {
        self.pending.clear();
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    // ---- parameters ----

    pub fn param_get(&self, id: u8) -> Result<Option<Vec<u8>>, ChainError> {
        self.read(Column::Meta, &[id])
    }

    pub fn param_set(&mut self, id: u8, value: &[u8]) {
        self.write(Column::Meta, &[id], value.to_vec());
    }

    pub fn param_clear(&mut self, id: u8) {
        self.erase(Column::Meta, &[id]);
    }

    pub fn param_get_u64(&self, id: u8) -> Result<Option<u64>, ChainError> {
        match self.param_get(id)? {
            None => Ok(None),
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| corrupted("bad integer parameter"))?;
                Ok(Some(u64::from_le_bytes(arr)))
            }
        }
    }

    pub fn param_set_u64(&mut self, id: u8, value: u64) {
        self.param_set(id, &value.to_le_bytes());
    }

    // ---- states ----

    fn get_record(&self, row: u64) -> Result<StateRecord, ChainError> {
        let bytes = self
            .read(Column::States, &row_key(row))?
            .ok_or_else(|| corrupted("missing state row"))?;
        StateRecord::decode(&bytes)
    }

    fn put_record(&mut self, row: u64, record: &StateRecord) {
        self.write(Column::States, &row_key(row), record.encode());
    }

    pub fn get_state_header(&self, row: u64) -> Result<BlockHeader, ChainError> {
        Ok(self.get_record(row)?.header)
    }

    pub fn get_flags(&self, row: u64) -> Result<u8, ChainError> {
        Ok(self.get_record(row)?.flags)
    }

    pub fn get_chain_work(&self, row: u64) -> Result<U256, ChainError> {
        Ok(self.get_record(row)?.header.chain_work)
    }

    pub fn get_prev_row(&self, row: u64) -> Result<Option<u64>, ChainError> {
        let parent = self.get_record(row)?.parent;
        Ok((parent != 0).then_some(parent))
    }

    pub fn get_prev(&self, sid: &StateId) -> Result<Option<StateId>, ChainError> {
        match self.get_prev_row(sid.row)? {
            None => Ok(None),
            Some(row) => Ok(Some(StateId {
                row,
                height: sid.height - 1,
            })),
        }
    }

    /// Locate a state row by (height, hash).
    pub fn state_find(&self, id: &HeaderId) -> Result<Option<u64>, ChainError> {
        for (key, value) in self.scan_merged(Column::StateIndex, &id.height.to_be_bytes())? {
            if value.as_slice() == id.hash.as_slice() {
                let (_, row) = split_height_row_key(&key)?;
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    /// Insert a header, wiring it to any already-known parent and orphan
    /// children. The new state carries no flags.
    pub fn insert_state(&mut self, header: &BlockHeader) -> Result<u64, ChainError> {
        let row = self.param_get_u64(param::NEXT_ROW)?.unwrap_or(1);
        self.param_set_u64(param::NEXT_ROW, row + 1);

        let hash = header.hash();
        let height = header.height;

        let parent = if height == 0 {
            0
        } else {
            self.state_find(&HeaderId {
                height: height - 1,
                hash: header.prev,
            })?
            .unwrap_or(0)
        };

        if parent != 0 {
            self.write(Column::Children, &height_row_key(parent, row), Vec::new());
            let parent_record = self.get_record(parent)?;
            self.erase(
                Column::Tips,
                &height_row_key(parent_record.header.height, parent),
            );
        }

        // Adopt orphan children that arrived before us.
        let mut has_children = false;
        for (key, _) in self.scan_merged(Column::StateIndex, &(height + 1).to_be_bytes())? {
            let (child_height, child_row) = split_height_row_key(&key)?;
            debug_assert_eq!(child_height, height + 1);
            let mut child = self.get_record(child_row)?;
            if child.parent == 0 && child.header.prev == hash {
                child.parent = row;
                self.put_record(child_row, &child);
                self.write(Column::Children, &height_row_key(row, child_row), Vec::new());
                has_children = true;
            }
        }

        self.put_record(
            row,
            &StateRecord {
                header: header.clone(),
                parent,
                flags: 0,
            },
        );
        self.write(
            Column::StateIndex,
            &height_row_key(height, row),
            hash.to_vec(),
        );
        if !has_children {
            self.write(Column::Tips, &height_row_key(height, row), Vec::new());
        }

        Ok(row)
    }

    fn children_of(&self, row: u64) -> Result<Vec<u64>, ChainError> {
        let mut children = Vec::new();
        for (key, _) in self.scan_merged(Column::Children, &row_key(row))? {
            let (_, child) = split_height_row_key(&key)?;
            children.push(child);
        }
        Ok(children)
    }

    /// Mark a body as present and valid; reachability spreads to any
    /// functional descendants that were waiting on this state.
    pub fn set_state_functional(&mut self, row: u64) -> Result<(), ChainError> {
        let mut record = self.get_record(row)?;
        record.flags |= FLAG_FUNCTIONAL;
        let root_reachable = if record.header.height == cinderd_consensus::constants::HEIGHT_GENESIS
        {
            true
        } else if record.parent != 0 {
            self.get_flags(record.parent)? & FLAG_REACHABLE != 0
        } else {
            false
        };
        self.put_record(row, &record);
        if root_reachable {
            self.propagate_reachable(row)?;
        }
        Ok(())
    }

    fn propagate_reachable(&mut self, row: u64) -> Result<(), ChainError> {
        let mut queue = vec![row];
        while let Some(row) = queue.pop() {
            let mut record = self.get_record(row)?;
            if record.flags & FLAG_FUNCTIONAL == 0 || record.flags & FLAG_REACHABLE != 0 {
                continue;
            }
            record.flags |= FLAG_REACHABLE;
            self.put_record(row, &record);
            queue.extend(self.children_of(row)?);
        }
        Ok(())
    }

    /// Strip the functional flag (the body was bad or pruned); descendants
    /// lose reachability with it.
    pub fn set_state_not_functional(&mut self, row: u64) -> Result<(), ChainError> {
        let mut record = self.get_record(row)?;
        let was_reachable = record.flags & FLAG_REACHABLE != 0;
        record.flags &= !(FLAG_FUNCTIONAL | FLAG_REACHABLE);
        self.put_record(row, &record);
        if was_reachable {
            let mut queue = self.children_of(row)?;
            while let Some(row) = queue.pop() {
                let mut record = self.get_record(row)?;
                if record.flags & FLAG_REACHABLE == 0 {
                    continue;
                }
                record.flags &= !FLAG_REACHABLE;
                self.put_record(row, &record);
                queue.extend(self.children_of(row)?);
            }
        }
        Ok(())
    }

    /// Remove a childless, non-active state entirely. Returns the parent
    /// row on success (0 when none), or None if the state cannot go.
    pub fn delete_state(&mut self, row: u64) -> Result<Option<u64>, ChainError> {
        let record = self.get_record(row)?;
        if record.flags & FLAG_ACTIVE != 0 {
            return Ok(None);
        }
        if !self.children_of(row)?.is_empty() {
            return Ok(None);
        }

        let height = record.header.height;
        self.erase(Column::States, &row_key(row));
        self.erase(Column::StateIndex, &height_row_key(height, row));
        self.erase(Column::Tips, &height_row_key(height, row));
        self.erase(Column::Bodies, &row_key(row));
        self.erase(Column::Rollback, &row_key(row));
        self.erase(Column::Peers, &row_key(row));

        if record.parent != 0 {
            self.erase(Column::Children, &height_row_key(record.parent, row));
            if self.children_of(record.parent)?.is_empty() {
                let parent_record = self.get_record(record.parent)?;
                self.write(
                    Column::Tips,
                    &height_row_key(parent_record.header.height, record.parent),
                    Vec::new(),
                );
            }
        }

        Ok(Some(record.parent))
    }

    // ---- peers ----

    pub fn set_peer(&mut self, row: u64, peer: Option<&PeerId>) {
        match peer {
            Some(peer) => self.write(Column::Peers, &row_key(row), peer.to_vec()),
            None => self.erase(Column::Peers, &row_key(row)),
        }
    }

    pub fn get_peer(&self, row: u64) -> Result<Option<PeerId>, ChainError> {
        match self.read(Column::Peers, &row_key(row))? {
            None => Ok(None),
            Some(bytes) => {
                let peer: PeerId = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| corrupted("bad peer record"))?;
                Ok(Some(peer))
            }
        }
    }

    // ---- bodies and rollback blobs ----

    pub fn set_state_block(&mut self, row: u64, body: &[u8]) {
        self.write(Column::Bodies, &row_key(row), body.to_vec());
    }

    pub fn set_state_rollback(&mut self, row: u64, blob: Vec<u8>) {
        self.write(Column::Rollback, &row_key(row), blob);
    }

    pub fn get_state_block(
        &self,
        row: u64,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>), ChainError> {
        let body = self.read(Column::Bodies, &row_key(row))?;
        let rollback = self.read(Column::Rollback, &row_key(row))?;
        Ok((body, rollback))
    }

    pub fn del_state_block(&mut self, row: u64) {
        self.erase(Column::Bodies, &row_key(row));
        self.erase(Column::Rollback, &row_key(row));
    }

    // ---- enumeration ----

    /// All tips (states without children), lowest height first.
    pub fn enum_tips(&self) -> Result<Vec<StateId>, ChainError> {
        let mut tips = Vec::new();
        for (key, _) in self.scan_merged(Column::Tips, &[])? {
            let (height, row) = split_height_row_key(&key)?;
            tips.push(StateId { row, height });
        }
        Ok(tips)
    }

    /// Reachable states with no reachable child, best chain work first.
    /// These are the reorg candidates: every ancestor has a body.
    pub fn enum_functional_tips(&self) -> Result<Vec<(StateId, U256)>, ChainError> {
        let mut reachable: Vec<(StateId, U256, u64)> = Vec::new();
        let mut parents_with_reachable_child: Vec<u64> = Vec::new();
        for (key, _) in self.scan_merged(Column::StateIndex, &[])? {
            let (height, row) = split_height_row_key(&key)?;
            let record = self.get_record(row)?;
            if record.flags & FLAG_REACHABLE == 0 {
                continue;
            }
            reachable.push((StateId { row, height }, record.header.chain_work, row));
            if record.parent != 0 {
                parents_with_reachable_child.push(record.parent);
            }
        }
        parents_with_reachable_child.sort_unstable();
        let mut tips: Vec<(StateId, U256)> = reachable
            .into_iter()
            .filter(|(_, _, row)| parents_with_reachable_child.binary_search(row).is_err())
            .map(|(sid, work, _)| (sid, work))
            .collect();
        tips.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.row.cmp(&b.0.row)));
        Ok(tips)
    }

    pub fn enum_states_at(&self, height: u64) -> Result<Vec<StateId>, ChainError> {
        let mut states = Vec::new();
        for (key, _) in self.scan_merged(Column::StateIndex, &height.to_be_bytes())? {
            let (height, row) = split_height_row_key(&key)?;
            states.push(StateId { row, height });
        }
        Ok(states)
    }

    // ---- cursor and history ----

    pub fn get_cursor(&self) -> Result<Option<StateId>, ChainError> {
        let Some(row) = self.param_get_u64(param::CURSOR_ROW)? else {
            return Ok(None);
        };
        if row == 0 {
            return Ok(None);
        }
        let height = self
            .param_get_u64(param::CURSOR_HEIGHT)?
            .ok_or_else(|| corrupted("cursor height missing"))?;
        Ok(Some(StateId { row, height }))
    }

    /// Advance the cursor onto `sid`: mark it active and extend the
    /// history MMR with its hash.
    pub fn move_fwd(&mut self, sid: &StateId) -> Result<(), ChainError> {
        let mut record = self.get_record(sid.row)?;
        record.flags |= FLAG_ACTIVE;
        let hash = record.header.hash();
        self.put_record(sid.row, &record);

        let mut mmr = self.history_peaks(sid.height.wrapping_sub(1))?;
        mmr.append(&hash);
        self.write(Column::History, &sid.height.to_be_bytes(), mmr.encode());

        self.param_set_u64(param::CURSOR_ROW, sid.row);
        self.param_set_u64(param::CURSOR_HEIGHT, sid.height);
        Ok(())
    }

    /// Step the cursor back to the parent, dropping the abandoned
    /// height's history peaks.
    pub fn move_back(&mut self) -> Result<(), ChainError> {
        let sid = self
            .get_cursor()?
            .ok_or_else(|| corrupted("move back on empty chain"))?;
        let mut record = self.get_record(sid.row)?;
        record.flags &= !FLAG_ACTIVE;
        let parent = record.parent;
        self.put_record(sid.row, &record);
        self.erase(Column::History, &sid.height.to_be_bytes());

        if parent != 0 {
            self.param_set_u64(param::CURSOR_ROW, parent);
            self.param_set_u64(param::CURSOR_HEIGHT, sid.height - 1);
        } else {
            self.param_clear(param::CURSOR_ROW);
            self.param_clear(param::CURSOR_HEIGHT);
        }
        Ok(())
    }

    /// Walk the cursor all the way down, clearing active flags and
    /// history.
    pub fn reset_cursor(&mut self) -> Result<(), ChainError> {
        while self.get_cursor()?.is_some() {
            self.move_back()?;
        }
        Ok(())
    }

    /// MMR over the hashes of active states up to and including `height`.
    pub fn history_peaks(&self, height: u64) -> Result<CompactMmr, ChainError> {
        if height < cinderd_consensus::constants::HEIGHT_GENESIS {
            return Ok(CompactMmr::new());
        }
        match self.read(Column::History, &height.to_be_bytes())? {
            None => Ok(CompactMmr::new()),
            Some(bytes) => {
                CompactMmr::decode(&bytes).map_err(|_| corrupted("bad history peaks"))
            }
        }
    }

    /// Hash of the history MMR including the state at `height`.
    pub fn predicted_states_hash(&self, height: u64) -> Result<Hash256, ChainError> {
        Ok(self.history_peaks(height)?.root())
    }

    // ---- macroblocks ----

    pub fn put_macroblock(&mut self, height: u64, blob: Vec<u8>) {
        self.write(Column::Macroblocks, &height.to_be_bytes(), blob);
    }

    pub fn get_macroblock(&self, height: u64) -> Result<Option<Vec<u8>>, ChainError> {
        self.read(Column::Macroblocks, &height.to_be_bytes())
    }

    /// Registered macroblock heights, highest first.
    pub fn enum_macroblocks(&self) -> Result<Vec<u64>, ChainError> {
        let mut heights = Vec::new();
        for (key, _) in self.scan_merged(Column::Macroblocks, &[])? {
            let arr: [u8; 8] = key
                .as_slice()
                .try_into()
                .map_err(|_| corrupted("bad macroblock key"))?;
            heights.push(u64::from_be_bytes(arr));
        }
        heights.reverse();
        Ok(heights)
    }
}
