//! Block-chunked storage for one folder
//!
//! The folder record (accuracy ranges plus the header and body block
//! directories) is always in memory. Block payloads are loaded on demand
//! from a [`BlockSource`]:
//!
//! - Loads happen outside the state lock. Concurrent requests for the same
//!   block share one read; everyone else waits on the condvar.
//! - Mutations issued while any load is in flight are queued and replayed in
//!   order once the loads drain. [`FolderBlockStore::wait_for_deferred`]
//!   blocks until the queue is empty.
//! - Dirty blocks are only written back by [`FolderBlockStore::flush`] and
//!   [`FolderBlockStore::release_memory`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, anyhow};
use log::{debug, error, info};

use super::accuracy;
use super::blocks::{self, BlockEntries};
use super::{BlockSource, RecordKey};
use crate::config::{BlockLimits, SyncConfig};
use crate::date::Timestamp;
use crate::models::{
    AccuracyRange, BlockId, BlockKind, BodyBlock, BodyInfo, FolderBlockInfo, FolderMeta,
    FolderRecord, FullSyncInfo, HeaderBlock, HeaderInfo, MessageKey, Uid,
};

/// Whether a mutation took effect immediately or was queued behind a load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    Applied,
    Deferred,
}

enum DeferredOp {
    AddMessage { header: HeaderInfo, body: BodyInfo },
    UpdateFlags { key: MessageKey, flags: Vec<String> },
    UpdateBody { key: MessageKey, body: BodyInfo },
    Delete { key: MessageKey },
}

impl DeferredOp {
    fn label(&self) -> &'static str {
        match self {
            DeferredOp::AddMessage { .. } => "add_message",
            DeferredOp::UpdateFlags { .. } => "update_flags",
            DeferredOp::UpdateBody { .. } => "update_body",
            DeferredOp::Delete { .. } => "delete_message",
        }
    }
}

enum LoadedBlock {
    Header(HeaderBlock),
    Body(BodyBlock),
}

type LoadKey = (BlockKind, BlockId);

/// Directory plus resident payloads for one kind of block
struct BlockSet<B: BlockEntries> {
    infos: Vec<FolderBlockInfo>,
    loaded: HashMap<BlockId, B>,
    dirty: HashSet<BlockId>,
    deleted: HashSet<BlockId>,
}

impl<B: BlockEntries> BlockSet<B> {
    fn new(infos: Vec<FolderBlockInfo>) -> Self {
        Self {
            infos,
            loaded: HashMap::new(),
            dirty: HashSet::new(),
            deleted: HashSet::new(),
        }
    }

    fn in_directory(&self, id: BlockId) -> bool {
        self.infos.iter().any(|info| info.block_id == id)
    }

    fn containing(&self, key: MessageKey) -> Option<usize> {
        self.infos.iter().position(|info| info.contains(key))
    }

    fn target_for(&self, key: MessageKey, size: usize, limits: &BlockLimits) -> Option<usize> {
        blocks::choose_insertion(&self.infos, key, size, limits)
    }

    fn ids_overlapping(&self, start_ts: Timestamp, end_ts: Timestamp) -> Vec<BlockId> {
        self.infos
            .iter()
            .filter(|info| info.overlaps_dates(start_ts, end_ts))
            .map(|info| info.block_id)
            .collect()
    }

    /// Insert `entry`, replacing an existing entry with the same key.
    fn insert(
        &mut self,
        target: Option<usize>,
        entry: B::Entry,
        next_id: &mut BlockId,
        limits: &BlockLimits,
    ) -> Result<()> {
        let Some(idx) = target else {
            let id = *next_id;
            *next_id += 1;
            let mut block = B::default();
            block.insert_at(0, entry);
            if let Some(info) = blocks::summarize(id, &block, limits) {
                self.infos.push(info);
            }
            self.loaded.insert(id, block);
            self.dirty.insert(id);
            return Ok(());
        };

        let id = self.infos[idx].block_id;
        let block = self
            .loaded
            .get_mut(&id)
            .ok_or_else(|| anyhow!("{} block {id} not resident", B::KIND.as_str()))?;
        match block.position(B::entry_key(&entry)) {
            Ok(pos) => {
                block.remove_at(pos);
                block.insert_at(pos, entry);
            }
            Err(pos) => block.insert_at(pos, entry),
        }
        self.dirty.insert(id);
        self.refresh_info(idx, limits);

        if self.infos.get(idx).is_some_and(|info| info.est_size >= limits.max_block_size) {
            self.split(idx, next_id, limits);
        }
        Ok(())
    }

    fn remove(&mut self, key: MessageKey, limits: &BlockLimits) -> Option<B::Entry> {
        let idx = self.containing(key)?;
        let id = self.infos[idx].block_id;
        let block = self.loaded.get_mut(&id)?;
        let pos = block.position(key).ok()?;
        let entry = block.remove_at(pos);
        self.dirty.insert(id);
        self.refresh_info(idx, limits);
        Some(entry)
    }

    /// Recompute a directory entry from its payload, dropping emptied blocks.
    fn refresh_info(&mut self, idx: usize, limits: &BlockLimits) {
        let id = self.infos[idx].block_id;
        let summary = self
            .loaded
            .get(&id)
            .and_then(|block| blocks::summarize(id, block, limits));
        match summary {
            Some(info) => self.infos[idx] = info,
            None => {
                debug!("[STORE] dropping empty {} block {id}", B::KIND.as_str());
                self.infos.remove(idx);
                self.loaded.remove(&id);
                self.dirty.remove(&id);
                self.deleted.insert(id);
            }
        }
    }

    fn split(&mut self, idx: usize, next_id: &mut BlockId, limits: &BlockLimits) {
        let target = blocks::split_target(idx, self.infos.len(), limits);
        let id = self.infos[idx].block_id;
        let Some(block) = self.loaded.get_mut(&id) else {
            return;
        };
        let Some(keep) = blocks::split_point(block, target, limits) else {
            return;
        };
        let older = block.split_off(keep);

        let new_id = *next_id;
        *next_id += 1;
        self.refresh_info(idx, limits);
        if let Some(info) = blocks::summarize(new_id, &older, limits) {
            debug!(
                "[STORE] split {} block {id}: kept {keep}, moved {} to block {new_id}",
                B::KIND.as_str(),
                info.count
            );
            self.infos.insert(idx + 1, info);
        }
        self.loaded.insert(new_id, older);
        self.dirty.insert(new_id);
    }
}

struct StoreState {
    meta: FolderMeta,
    accuracy: Vec<AccuracyRange>,
    headers: BlockSet<HeaderBlock>,
    bodies: BlockSet<BodyBlock>,
    record_dirty: bool,
    pending_loads: HashSet<LoadKey>,
    deferred: VecDeque<DeferredOp>,
    draining: bool,
    deferred_failure: Option<anyhow::Error>,
}

impl StoreState {
    fn is_loaded(&self, (kind, id): LoadKey) -> bool {
        match kind {
            BlockKind::Header => self.headers.loaded.contains_key(&id),
            BlockKind::Body => self.bodies.loaded.contains_key(&id),
        }
    }

    fn in_directory(&self, (kind, id): LoadKey) -> bool {
        match kind {
            BlockKind::Header => self.headers.in_directory(id),
            BlockKind::Body => self.bodies.in_directory(id),
        }
    }

    /// Blocks that must be resident before `wanted` can be read
    fn missing(&self, wanted: &[LoadKey]) -> Vec<LoadKey> {
        wanted
            .iter()
            .copied()
            .filter(|key| self.in_directory(*key) && !self.is_loaded(*key))
            .collect()
    }

    fn install(&mut self, id: BlockId, block: LoadedBlock) {
        match block {
            LoadedBlock::Header(block) => {
                self.headers.loaded.entry(id).or_insert(block);
            }
            LoadedBlock::Body(block) => {
                self.bodies.loaded.entry(id).or_insert(block);
            }
        }
    }

    fn blocks_for(&self, op: &DeferredOp, limits: &BlockLimits) -> Vec<LoadKey> {
        let mut wanted = Vec::with_capacity(2);
        let mut push = |kind: BlockKind, infos: &[FolderBlockInfo], idx: Option<usize>| {
            if let Some(idx) = idx {
                wanted.push((kind, infos[idx].block_id));
            }
        };
        match op {
            DeferredOp::AddMessage { header, body } => {
                let key = header.key();
                let h = self.headers.target_for(key, limits.header_est_size, limits);
                push(BlockKind::Header, &self.headers.infos, h);
                let b = self.bodies.target_for(key, body.size, limits);
                push(BlockKind::Body, &self.bodies.infos, b);
            }
            DeferredOp::UpdateFlags { key, .. } => {
                push(BlockKind::Header, &self.headers.infos, self.headers.containing(*key));
            }
            DeferredOp::UpdateBody { key, .. } => {
                push(BlockKind::Body, &self.bodies.infos, self.bodies.containing(*key));
            }
            DeferredOp::Delete { key } => {
                push(BlockKind::Header, &self.headers.infos, self.headers.containing(*key));
                push(BlockKind::Body, &self.bodies.infos, self.bodies.containing(*key));
            }
        }
        wanted
    }

    /// Apply a mutation whose blocks are resident
    fn apply(&mut self, op: DeferredOp, limits: &BlockLimits) -> Result<()> {
        match op {
            DeferredOp::AddMessage { header, mut body } => {
                let key = header.key();
                body.date = header.date;

                let target = self.headers.target_for(key, limits.header_est_size, limits);
                self.headers
                    .insert(target, header, &mut self.meta.next_header_block, limits)?;

                let target = self.bodies.target_for(key, body.size, limits);
                self.bodies
                    .insert(target, (key.uid, body), &mut self.meta.next_body_block, limits)?;
                self.record_dirty = true;
            }
            DeferredOp::UpdateFlags { key, flags } => {
                let Some(idx) = self.headers.containing(key) else {
                    log::warn!("[STORE] flag update for unknown message {}", key.uid);
                    return Ok(());
                };
                let id = self.headers.infos[idx].block_id;
                let block = self
                    .headers
                    .loaded
                    .get_mut(&id)
                    .ok_or_else(|| anyhow!("header block {id} not resident"))?;
                if let Ok(pos) = block.position(key) {
                    block.headers[pos].flags = flags;
                    self.headers.dirty.insert(id);
                }
            }
            DeferredOp::UpdateBody { key, mut body } => {
                let Some(idx) = self.bodies.containing(key) else {
                    log::warn!("[STORE] body update for unknown message {}", key.uid);
                    return Ok(());
                };
                body.date = key.date;
                self.bodies
                    .insert(Some(idx), (key.uid, body), &mut self.meta.next_body_block, limits)?;
                self.record_dirty = true;
            }
            DeferredOp::Delete { key } => {
                let header = self.headers.remove(key, limits);
                let body = self.bodies.remove(key, limits);
                if header.is_none() && body.is_none() {
                    log::warn!("[STORE] delete of unknown message {}", key.uid);
                }
                self.record_dirty = true;
            }
        }
        Ok(())
    }

    fn record(&self) -> FolderRecord {
        FolderRecord {
            meta: self.meta.clone(),
            accuracy: self.accuracy.clone(),
            header_blocks: self.headers.infos.clone(),
            body_blocks: self.bodies.infos.clone(),
        }
    }
}

/// Persisted, lazily loaded header/body storage for one folder
pub struct FolderBlockStore {
    folder_id: String,
    source: Arc<dyn BlockSource>,
    limits: BlockLimits,
    oldest_sync_date: Timestamp,
    state: Mutex<StoreState>,
    loads_changed: Condvar,
}

impl FolderBlockStore {
    /// Open the folder record from `source`, or start an empty one.
    pub fn open(
        folder_id: &str,
        path: &str,
        source: Arc<dyn BlockSource>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let record = match source.get(&RecordKey::folder(folder_id))? {
            Some(bytes) => serde_json::from_slice::<FolderRecord>(&bytes)
                .with_context(|| format!("Failed to parse folder record for {folder_id}"))?,
            None => FolderRecord::new(folder_id, path),
        };
        info!(
            "[STORE] opened folder {} ({} header blocks, {} accuracy ranges)",
            folder_id,
            record.header_blocks.len(),
            record.accuracy.len()
        );

        Ok(Self {
            folder_id: folder_id.to_string(),
            source,
            limits: config.blocks,
            oldest_sync_date: config.oldest_sync_date,
            state: Mutex::new(StoreState {
                meta: record.meta,
                accuracy: record.accuracy,
                headers: BlockSet::new(record.header_blocks),
                bodies: BlockSet::new(record.body_blocks),
                record_dirty: false,
                pending_loads: HashSet::new(),
                deferred: VecDeque::new(),
                draining: false,
                deferred_failure: None,
            }),
            loads_changed: Condvar::new(),
        })
    }

    pub fn folder_id(&self) -> &str {
        &self.folder_id
    }

    pub fn path(&self) -> String {
        self.lock().meta.path.clone()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_block(&self, (kind, id): LoadKey) -> Result<LoadedBlock> {
        let key = RecordKey::block(&self.folder_id, kind, id);
        let bytes = self
            .source
            .get(&key)?
            .with_context(|| {
                format!("{} block {id} of {} is missing", kind.as_str(), self.folder_id)
            })?;
        let block = match kind {
            BlockKind::Header => LoadedBlock::Header(serde_json::from_slice(&bytes)?),
            BlockKind::Body => LoadedBlock::Body(serde_json::from_slice(&bytes)?),
        };
        debug!("[STORE] loaded {} block {id} ({} bytes)", kind.as_str(), bytes.len());
        Ok(block)
    }

    /// Make every block in `wanted` resident, sharing in-flight loads.
    fn load_blocks<'a>(
        &'a self,
        mut guard: MutexGuard<'a, StoreState>,
        wanted: &[LoadKey],
    ) -> Result<MutexGuard<'a, StoreState>> {
        loop {
            let missing = guard.missing(wanted);
            if missing.is_empty() {
                return Ok(guard);
            }

            let to_load: Vec<LoadKey> = missing
                .into_iter()
                .filter(|key| !guard.pending_loads.contains(key))
                .collect();
            if to_load.is_empty() {
                guard = self
                    .loads_changed
                    .wait(guard)
                    .unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            guard.pending_loads.extend(to_load.iter().copied());
            drop(guard);

            let results: Vec<(LoadKey, Result<LoadedBlock>)> =
                to_load.iter().map(|&key| (key, self.read_block(key))).collect();

            guard = self.lock();
            let mut failure = None;
            for ((kind, id), result) in results {
                guard.pending_loads.remove(&(kind, id));
                match result {
                    Ok(block) => guard.install(id, block),
                    Err(err) => {
                        failure.get_or_insert(err);
                    }
                }
            }
            self.loads_changed.notify_all();

            if guard.pending_loads.is_empty() && !guard.deferred.is_empty() && !guard.draining {
                guard = self.drain(guard);
            }
            if let Some(err) = failure {
                return Err(err);
            }
        }
    }

    fn apply_op<'a>(
        &'a self,
        mut guard: MutexGuard<'a, StoreState>,
        op: DeferredOp,
    ) -> (MutexGuard<'a, StoreState>, Result<()>) {
        loop {
            let wanted = guard.blocks_for(&op, &self.limits);
            if guard.missing(&wanted).is_empty() {
                let result = guard.apply(op, &self.limits);
                return (guard, result);
            }
            match self.load_blocks(guard, &wanted) {
                Ok(g) => guard = g,
                Err(err) => return (self.lock(), Err(err)),
            }
        }
    }

    /// Replay queued mutations in order. Failures are kept for the next caller.
    fn drain<'a>(&'a self, mut guard: MutexGuard<'a, StoreState>) -> MutexGuard<'a, StoreState> {
        guard.draining = true;
        while let Some(op) = guard.deferred.pop_front() {
            let label = op.label();
            let (g, result) = self.apply_op(guard, op);
            guard = g;
            if let Err(err) = result {
                error!("[STORE] {label} failed for folder {}: {err:#}", self.folder_id);
                if guard.deferred_failure.is_none() {
                    guard.deferred_failure = Some(err);
                }
            }
        }
        guard.draining = false;
        self.loads_changed.notify_all();
        guard
    }

    fn submit(&self, op: DeferredOp) -> Result<Mutation> {
        let mut guard = self.lock();
        guard.deferred.push_back(op);
        if guard.draining || !guard.pending_loads.is_empty() {
            debug!(
                "[STORE] deferring mutation on {} ({} queued)",
                self.folder_id,
                guard.deferred.len()
            );
            return Ok(Mutation::Deferred);
        }
        guard = self.drain(guard);
        match guard.deferred_failure.take() {
            Some(err) => Err(err),
            None => Ok(Mutation::Applied),
        }
    }

    /// Block until every queued mutation has been applied.
    ///
    /// Returns the first failure hit while replaying, if any.
    pub fn wait_for_deferred(&self) -> Result<()> {
        let mut guard = self.lock();
        loop {
            if guard.deferred.is_empty() && !guard.draining {
                break;
            }
            if !guard.draining && guard.pending_loads.is_empty() {
                guard = self.drain(guard);
                continue;
            }
            guard = self
                .loads_changed
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match guard.deferred_failure.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Run `read` once every block `wanted` names is resident
    fn read_with<R>(
        &self,
        wanted: impl Fn(&StoreState) -> Vec<LoadKey>,
        read: impl FnOnce(&StoreState) -> R,
    ) -> Result<R> {
        let mut guard = self.lock();
        loop {
            let keys = wanted(&*guard);
            if guard.missing(&keys).is_empty() {
                return Ok(read(&*guard));
            }
            guard = self.load_blocks(guard, &keys)?;
        }
    }

    fn headers_in_block(
        &self,
        id: BlockId,
        keep: impl Fn(&HeaderInfo) -> bool,
    ) -> Result<Vec<HeaderInfo>> {
        self.read_with(
            |_| vec![(BlockKind::Header, id)],
            |state| {
                state
                    .headers
                    .loaded
                    .get(&id)
                    .map(|block| block.headers.iter().filter(|h| keep(*h)).cloned().collect())
                    .unwrap_or_default()
            },
        )
    }

    // ---- mutations ----

    /// Add a message's header and body together.
    ///
    /// Re-adding a known (date, uid) replaces the stored copy.
    pub fn add_message(&self, header: HeaderInfo, body: BodyInfo) -> Result<Mutation> {
        self.submit(DeferredOp::AddMessage { header, body })
    }

    pub fn update_message_flags(
        &self,
        date: Timestamp,
        uid: Uid,
        flags: Vec<String>,
    ) -> Result<Mutation> {
        self.submit(DeferredOp::UpdateFlags {
            key: MessageKey::new(date, uid),
            flags,
        })
    }

    pub fn update_message_body(
        &self,
        date: Timestamp,
        uid: Uid,
        body: BodyInfo,
    ) -> Result<Mutation> {
        self.submit(DeferredOp::UpdateBody {
            key: MessageKey::new(date, uid),
            body,
        })
    }

    pub fn delete_message_header_and_body(&self, date: Timestamp, uid: Uid) -> Result<Mutation> {
        self.submit(DeferredOp::Delete {
            key: MessageKey::new(date, uid),
        })
    }

    // ---- queries ----

    /// Headers dated in `[start_ts, end_ts)`, newest first, at most `limit` of them.
    ///
    /// Blocks are loaded one at a time as the iterator advances.
    pub fn get_messages_in_date_range(
        &self,
        start_ts: Timestamp,
        end_ts: Timestamp,
        limit: usize,
    ) -> MessagesInRange<'_> {
        let block_ids = self.lock().headers.ids_overlapping(start_ts, end_ts);
        MessagesInRange {
            store: self,
            start_ts,
            end_ts,
            block_ids,
            next_block: 0,
            buffer: VecDeque::new(),
            remaining: limit,
        }
    }

    /// Every header dated in `[start_ts, end_ts)`, newest first
    pub fn get_all_messages_in_date_range(
        &self,
        start_ts: Timestamp,
        end_ts: Timestamp,
    ) -> Result<Vec<HeaderInfo>> {
        self.get_messages_in_date_range(start_ts, end_ts, usize::MAX)
            .collect()
    }

    /// Up to `limit` headers strictly older than the given message, newest first.
    ///
    /// With no date, paging starts from the newest message. With a date but
    /// no uid, everything on that date is excluded.
    pub fn get_messages_before_message(
        &self,
        date: Option<Timestamp>,
        uid: Option<Uid>,
        limit: usize,
    ) -> Result<Vec<HeaderInfo>> {
        let anchor = match date {
            Some(date) => MessageKey::new(date, uid.unwrap_or(0)),
            None => MessageKey::new(Timestamp::MAX, Uid::MAX),
        };
        let block_ids: Vec<BlockId> = self
            .lock()
            .headers
            .infos
            .iter()
            .filter(|info| info.start_key() < anchor)
            .map(|info| info.block_id)
            .collect();

        let mut out = Vec::new();
        for id in block_ids {
            if out.len() >= limit {
                break;
            }
            let headers = self.headers_in_block(id, |h| h.key() < anchor)?;
            out.extend(headers.into_iter().take(limit - out.len()));
        }
        Ok(out)
    }

    /// Up to `limit` headers strictly newer than the given message, newest first.
    ///
    /// The headers closest to the anchor are the ones returned.
    pub fn get_messages_after_message(
        &self,
        date: Timestamp,
        uid: Uid,
        limit: usize,
    ) -> Result<Vec<HeaderInfo>> {
        let anchor = MessageKey::new(date, uid);
        let block_ids: Vec<BlockId> = self
            .lock()
            .headers
            .infos
            .iter()
            .rev()
            .filter(|info| info.end_key() > anchor)
            .map(|info| info.block_id)
            .collect();

        let mut oldest_first = Vec::new();
        for id in block_ids {
            if oldest_first.len() >= limit {
                break;
            }
            let headers = self.headers_in_block(id, |h| h.key() > anchor)?;
            let take = limit - oldest_first.len();
            oldest_first.extend(headers.into_iter().rev().take(take));
        }
        oldest_first.reverse();
        Ok(oldest_first)
    }

    pub fn get_message_header(&self, date: Timestamp, uid: Uid) -> Result<Option<HeaderInfo>> {
        let key = MessageKey::new(date, uid);
        self.read_with(
            |state| {
                state
                    .headers
                    .containing(key)
                    .map(|idx| vec![(BlockKind::Header, state.headers.infos[idx].block_id)])
                    .unwrap_or_default()
            },
            |state| {
                let idx = state.headers.containing(key)?;
                let block = state.headers.loaded.get(&state.headers.infos[idx].block_id)?;
                let pos = block.position(key).ok()?;
                Some(block.headers[pos].clone())
            },
        )
    }

    pub fn get_message_body(&self, date: Timestamp, uid: Uid) -> Result<Option<BodyInfo>> {
        let key = MessageKey::new(date, uid);
        self.read_with(
            |state| {
                state
                    .bodies
                    .containing(key)
                    .map(|idx| vec![(BlockKind::Body, state.bodies.infos[idx].block_id)])
                    .unwrap_or_default()
            },
            |state| {
                let idx = state.bodies.containing(key)?;
                let block = state.bodies.loaded.get(&state.bodies.infos[idx].block_id)?;
                block.bodies.get(&uid).cloned()
            },
        )
    }

    pub fn known_message_count(&self) -> usize {
        self.lock().headers.infos.iter().map(|info| info.count).sum()
    }

    pub fn oldest_message_timestamp(&self) -> Option<Timestamp> {
        self.lock().headers.infos.last().map(|info| info.start_ts)
    }

    pub fn youngest_message_timestamp(&self) -> Option<Timestamp> {
        self.lock().headers.infos.first().map(|info| info.end_ts)
    }

    pub fn header_block_infos(&self) -> Vec<FolderBlockInfo> {
        self.lock().headers.infos.clone()
    }

    pub fn body_block_infos(&self) -> Vec<FolderBlockInfo> {
        self.lock().bodies.infos.clone()
    }

    // ---- accuracy ranges ----

    pub fn accuracy_ranges(&self) -> Vec<AccuracyRange> {
        self.lock().accuracy.clone()
    }

    /// Record that `[start_ts, end_ts)` matches the server as of `updated_at`.
    ///
    /// # Returns
    /// `true` if the accuracy directory changed
    pub fn mark_sync_range(
        &self,
        start_ts: Timestamp,
        end_ts: Timestamp,
        highest_modseq: Option<String>,
        updated_at: Timestamp,
    ) -> bool {
        let mut guard = self.lock();
        let info = FullSyncInfo {
            highest_modseq,
            updated_at,
        };
        let changed = accuracy::mark_sync_range(&mut guard.accuracy, start_ts, end_ts, info);
        guard.record_dirty |= changed;
        changed
    }

    pub fn mark_synced_to_dawn_of_time(&self) -> bool {
        let mut guard = self.lock();
        let changed =
            accuracy::mark_synced_to_dawn_of_time(&mut guard.accuracy, self.oldest_sync_date);
        if changed {
            info!("[STORE] {} is synced to the dawn of time", self.folder_id);
        }
        guard.record_dirty |= changed;
        changed
    }

    pub fn clear_synced_to_dawn_of_time(&self, fallback_ts: Timestamp) -> bool {
        let mut guard = self.lock();
        let changed = accuracy::clear_synced_to_dawn_of_time(
            &mut guard.accuracy,
            self.oldest_sync_date,
            fallback_ts,
        );
        guard.record_dirty |= changed;
        changed
    }

    pub fn synced_to_dawn_of_time(&self) -> bool {
        accuracy::synced_to_dawn_of_time(&self.lock().accuracy, self.oldest_sync_date)
    }

    pub fn oldest_full_sync_date(&self) -> Option<Timestamp> {
        accuracy::oldest_full_sync_date(&self.lock().accuracy)
    }

    /// When the range covering `ts` was last verified against the server
    pub fn accuracy_updated_at(&self, ts: Timestamp) -> Option<Timestamp> {
        accuracy::range_containing(&self.lock().accuracy, ts)
            .map(|range| range.full_sync.updated_at)
    }

    // ---- persistence ----

    /// Write dirty blocks and the folder record back to the source.
    pub fn flush(&self) -> Result<()> {
        let mut guard = self.lock();
        self.write_back(&mut guard)
    }

    fn write_back(&self, state: &mut StoreState) -> Result<()> {
        let mut written = 0;
        for id in &state.headers.dirty {
            if let Some(block) = state.headers.loaded.get(id) {
                let key = RecordKey::block(&self.folder_id, BlockKind::Header, *id);
                self.source.put(&key, &serde_json::to_vec(block)?)?;
                written += 1;
            }
        }
        for id in &state.bodies.dirty {
            if let Some(block) = state.bodies.loaded.get(id) {
                let key = RecordKey::block(&self.folder_id, BlockKind::Body, *id);
                self.source.put(&key, &serde_json::to_vec(block)?)?;
                written += 1;
            }
        }
        for id in &state.headers.deleted {
            self.source
                .delete(&RecordKey::block(&self.folder_id, BlockKind::Header, *id))?;
        }
        for id in &state.bodies.deleted {
            self.source
                .delete(&RecordKey::block(&self.folder_id, BlockKind::Body, *id))?;
        }
        if state.record_dirty {
            let record = serde_json::to_vec(&state.record())?;
            self.source
                .put(&RecordKey::folder(&self.folder_id), &record)
                .with_context(|| format!("Failed to write folder record for {}", self.folder_id))?;
        }

        if written > 0 || state.record_dirty {
            debug!("[STORE] flushed {} ({} blocks)", self.folder_id, written);
        }
        state.headers.dirty.clear();
        state.bodies.dirty.clear();
        state.headers.deleted.clear();
        state.bodies.deleted.clear();
        state.record_dirty = false;
        Ok(())
    }

    /// Flush, then drop every resident block that can be reloaded.
    ///
    /// Write-back and eviction share one lock hold, and a block that is
    /// still dirty stays resident.
    pub fn release_memory(&self) -> Result<()> {
        let mut guard = self.lock();
        if guard.draining || !guard.deferred.is_empty() {
            return self.write_back(&mut guard);
        }
        self.write_back(&mut guard)?;

        let state = &mut *guard;
        let before = state.headers.loaded.len() + state.bodies.loaded.len();
        let header_dirty = &state.headers.dirty;
        state.headers.loaded.retain(|id, _| header_dirty.contains(id));
        let body_dirty = &state.bodies.dirty;
        state.bodies.loaded.retain(|id, _| body_dirty.contains(id));
        let evicted = before - state.headers.loaded.len() - state.bodies.loaded.len();
        debug!("[STORE] released {evicted} blocks for {}", self.folder_id);
        Ok(())
    }

    /// Number of blocks currently resident
    pub fn resident_blocks(&self) -> usize {
        let guard = self.lock();
        guard.headers.loaded.len() + guard.bodies.loaded.len()
    }
}

/// Lazy newest-first walk over headers in a date range
pub struct MessagesInRange<'a> {
    store: &'a FolderBlockStore,
    start_ts: Timestamp,
    end_ts: Timestamp,
    block_ids: Vec<BlockId>,
    next_block: usize,
    buffer: VecDeque<HeaderInfo>,
    remaining: usize,
}

impl Iterator for MessagesInRange<'_> {
    type Item = Result<HeaderInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.remaining == 0 {
                return None;
            }
            if let Some(header) = self.buffer.pop_front() {
                self.remaining -= 1;
                return Some(Ok(header));
            }
            let id = *self.block_ids.get(self.next_block)?;
            self.next_block += 1;

            let (start_ts, end_ts) = (self.start_ts, self.end_ts);
            match self
                .store
                .headers_in_block(id, |h| h.date >= start_ts && h.date < end_ts)
            {
                Ok(headers) => self.buffer.extend(headers),
                Err(err) => {
                    self.next_block = self.block_ids.len();
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BodyRep, BodyRepKind, EmailAddress};
    use crate::storage::InMemoryBlockSource;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    const DAY: i64 = crate::date::DAY_MILLIS;
    const BASE: Timestamp = 1_704_067_200_000; // 2024-01-01

    fn small_config() -> SyncConfig {
        SyncConfig {
            blocks: BlockLimits {
                max_block_size: 1_000,
                split_small: 300,
                split_equal: 500,
                split_large: 700,
                header_est_size: 100,
            },
            ..SyncConfig::default()
        }
    }

    fn header(date: Timestamp, uid: Uid) -> HeaderInfo {
        HeaderInfo {
            id: uid,
            author: EmailAddress::new("sender@example.com"),
            date,
            flags: Vec::new(),
            has_attachments: false,
            subject: format!("message {uid}"),
            snippet: Some("hello".to_string()),
        }
    }

    fn body(size: usize) -> BodyInfo {
        BodyInfo {
            size,
            body_reps: vec![BodyRep {
                kind: BodyRepKind::Plain,
                part_id: "1".to_string(),
                size_estimate: size,
                content: Some("hello".to_string()),
                is_downloaded: true,
            }],
            ..Default::default()
        }
    }

    fn open(source: Arc<dyn BlockSource>) -> FolderBlockStore {
        FolderBlockStore::open("inbox", "INBOX", source, &small_config()).unwrap()
    }

    fn assert_directory_sorted(infos: &[FolderBlockInfo]) {
        for pair in infos.windows(2) {
            assert!(pair[0].start_key() > pair[1].end_key(), "directory out of order: {:?}", infos);
        }
    }

    #[test]
    fn test_add_and_query_range() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        for uid in 1..=5u32 {
            assert_eq!(
                store.add_message(header(BASE + uid as i64 * DAY, uid), body(50)).unwrap(),
                Mutation::Applied
            );
        }

        let all = store.get_all_messages_in_date_range(BASE, BASE + 10 * DAY).unwrap();
        let uids: Vec<Uid> = all.iter().map(|h| h.id).collect();
        assert_eq!(uids, vec![5, 4, 3, 2, 1]);

        let window = store
            .get_all_messages_in_date_range(BASE + 2 * DAY, BASE + 4 * DAY)
            .unwrap();
        assert_eq!(window.iter().map(|h| h.id).collect::<Vec<_>>(), vec![3, 2]);

        let limited: Vec<HeaderInfo> = store
            .get_messages_in_date_range(BASE, BASE + 10 * DAY, 2)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(store.known_message_count(), 5);
    }

    #[test]
    fn test_insert_over_limit_splits_block() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        // 100 bytes per header estimate, split at 1000
        for uid in 1..=9u32 {
            store.add_message(header(BASE + uid as i64 * DAY, uid), body(10)).unwrap();
        }
        assert_eq!(store.header_block_infos().len(), 1);
        let before = store.header_block_infos()[0].clone();
        assert_eq!(before.count, 9);

        store.add_message(header(BASE + 10 * DAY, 10), body(10)).unwrap();
        let infos = store.header_block_infos();
        assert_eq!(infos.len(), 2);
        assert_directory_sorted(&infos);

        // The two blocks partition the original span plus the new message
        assert_eq!(infos[0].end_ts, BASE + 10 * DAY);
        assert_eq!(infos[1].start_ts, before.start_ts);
        assert_eq!(infos.iter().map(|i| i.count).sum::<usize>(), 10);
        assert_eq!(infos.iter().map(|i| i.est_size).sum::<usize>(), 1_000);
        // Newest block splits small
        assert_eq!(infos[0].est_size, 300);
    }

    #[test]
    fn test_body_blocks_split_on_size() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        for uid in 1..=4u32 {
            store.add_message(header(BASE + uid as i64 * DAY, uid), body(300)).unwrap();
        }
        let infos = store.body_block_infos();
        assert_eq!(infos.len(), 2);
        assert_directory_sorted(&infos);
        assert_eq!(infos.iter().map(|i| i.count).sum::<usize>(), 4);
        assert_eq!(infos.iter().map(|i| i.est_size).sum::<usize>(), 1_200);
    }

    #[test]
    fn test_readd_replaces_instead_of_duplicating() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        store.add_message(header(BASE, 1), body(10)).unwrap();
        let mut changed = header(BASE, 1);
        changed.subject = "edited".to_string();
        store.add_message(changed, body(10)).unwrap();

        assert_eq!(store.known_message_count(), 1);
        let stored = store.get_message_header(BASE, 1).unwrap().unwrap();
        assert_eq!(stored.subject, "edited");
    }

    #[test]
    fn test_delete_removes_header_body_and_empty_blocks() {
        let source = Arc::new(InMemoryBlockSource::new());
        let store = open(source.clone());
        store.add_message(header(BASE, 1), body(10)).unwrap();
        store.add_message(header(BASE + DAY, 2), body(10)).unwrap();
        store.flush().unwrap();

        store.delete_message_header_and_body(BASE, 1).unwrap();
        assert!(store.get_message_header(BASE, 1).unwrap().is_none());
        assert!(store.get_message_body(BASE, 1).unwrap().is_none());
        assert_eq!(store.known_message_count(), 1);

        store.delete_message_header_and_body(BASE + DAY, 2).unwrap();
        assert!(store.header_block_infos().is_empty());
        assert!(store.body_block_infos().is_empty());

        store.flush().unwrap();
        let snapshot = source.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1, "only the folder record should remain");
    }

    #[test]
    fn test_update_flags_and_body() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        store.add_message(header(BASE, 1), body(10)).unwrap();

        store
            .update_message_flags(BASE, 1, vec!["\\Seen".to_string()])
            .unwrap();
        assert!(store.get_message_header(BASE, 1).unwrap().unwrap().is_seen());

        let mut replacement = body(20);
        replacement.body_reps[0].content = Some("updated".to_string());
        store.update_message_body(BASE, 1, replacement).unwrap();
        let stored = store.get_message_body(BASE, 1).unwrap().unwrap();
        assert_eq!(stored.body_text(), Some("updated"));
        assert_eq!(stored.date, BASE);
    }

    #[test]
    fn test_paging_before_and_after_message() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        for uid in 1..=12u32 {
            store.add_message(header(BASE + uid as i64 * DAY, uid), body(10)).unwrap();
        }
        assert!(store.header_block_infos().len() > 1);

        let before = store
            .get_messages_before_message(Some(BASE + 8 * DAY), Some(8), 3)
            .unwrap();
        assert_eq!(before.iter().map(|h| h.id).collect::<Vec<_>>(), vec![7, 6, 5]);

        let newest = store.get_messages_before_message(None, None, 2).unwrap();
        assert_eq!(newest.iter().map(|h| h.id).collect::<Vec<_>>(), vec![12, 11]);

        let after = store.get_messages_after_message(BASE + 3 * DAY, 3, 4).unwrap();
        assert_eq!(after.iter().map(|h| h.id).collect::<Vec<_>>(), vec![7, 6, 5, 4]);
    }

    #[test]
    fn test_flush_and_reopen_round_trip() {
        let source = Arc::new(InMemoryBlockSource::new());
        {
            let store = open(source.clone());
            for uid in 1..=15u32 {
                store.add_message(header(BASE + uid as i64 * DAY, uid), body(10)).unwrap();
            }
            store.mark_sync_range(BASE, BASE + 20 * DAY, Some("42".to_string()), 99);
            store.flush().unwrap();
        }

        let reopened = open(source.clone());
        assert_eq!(reopened.known_message_count(), 15);
        assert_eq!(reopened.resident_blocks(), 0);
        assert_eq!(reopened.accuracy_ranges().len(), 1);
        assert_eq!(reopened.accuracy_updated_at(BASE + DAY), Some(99));

        let all = reopened.get_all_messages_in_date_range(BASE, BASE + 20 * DAY).unwrap();
        assert_eq!(all.len(), 15);
        assert_eq!(all[0].id, 15);
    }

    #[test]
    fn test_flush_without_changes_writes_nothing() {
        let source = Arc::new(InMemoryBlockSource::new());
        let store = open(source.clone());
        store.add_message(header(BASE, 1), body(10)).unwrap();
        store.flush().unwrap();
        let writes = source.write_count();

        store.get_all_messages_in_date_range(BASE, BASE + DAY).unwrap();
        store.flush().unwrap();
        assert_eq!(source.write_count(), writes);
    }

    #[test]
    fn test_release_memory_evicts_and_reloads() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        store.add_message(header(BASE, 1), body(10)).unwrap();
        assert!(store.resident_blocks() > 0);

        store.release_memory().unwrap();
        assert_eq!(store.resident_blocks(), 0);
        assert!(store.get_message_body(BASE, 1).unwrap().is_some());
    }

    #[test]
    fn test_release_memory_keeps_concurrent_writes() {
        let source = Arc::new(InMemoryBlockSource::new());
        let store = open(source.clone());
        let done = AtomicBool::new(false);

        std::thread::scope(|s| {
            let writer = s.spawn(|| {
                for uid in 1..=200u32 {
                    store.add_message(header(BASE + uid as i64 * 1_000, uid), body(10)).unwrap();
                }
                done.store(true, Ordering::SeqCst);
            });
            while !done.load(Ordering::SeqCst) {
                store.release_memory().unwrap();
            }
            writer.join().unwrap();
        });

        store.wait_for_deferred().unwrap();
        store.release_memory().unwrap();
        assert_eq!(store.resident_blocks(), 0);

        let reopened = open(source);
        let all = reopened.get_all_messages_in_date_range(BASE, BASE + DAY).unwrap();
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn test_release_memory_after_mutation_persists_it() {
        let source = Arc::new(InMemoryBlockSource::new());
        let store = open(source.clone());
        store.add_message(header(BASE, 1), body(10)).unwrap();
        store.flush().unwrap();

        store
            .update_message_flags(BASE, 1, vec!["\\Seen".to_string()])
            .unwrap();
        store.release_memory().unwrap();
        assert_eq!(store.resident_blocks(), 0);

        let reopened = open(source);
        let seen = reopened.get_message_header(BASE, 1).unwrap().unwrap();
        assert_eq!(seen.flags, vec!["\\Seen".to_string()]);
    }

    #[test]
    fn test_dawn_of_time_round_trip() {
        let store = open(Arc::new(InMemoryBlockSource::new()));
        store.mark_sync_range(BASE, BASE + DAY, None, 1);
        assert!(!store.synced_to_dawn_of_time());
        assert!(store.mark_synced_to_dawn_of_time());
        assert!(store.synced_to_dawn_of_time());
        assert!(store.clear_synced_to_dawn_of_time(BASE));
        assert!(!store.synced_to_dawn_of_time());
        assert_eq!(store.oldest_full_sync_date(), Some(BASE));
    }

    /// Block reads park until the gate opens
    struct GatedSource {
        inner: InMemoryBlockSource,
        closed: AtomicBool,
        gate: Mutex<bool>,
        opened: Condvar,
        block_reads: AtomicUsize,
    }

    impl GatedSource {
        fn new() -> Self {
            Self {
                inner: InMemoryBlockSource::new(),
                closed: AtomicBool::new(false),
                gate: Mutex::new(false),
                opened: Condvar::new(),
                block_reads: AtomicUsize::new(0),
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn open(&self) {
            *self.gate.lock().unwrap() = true;
            self.opened.notify_all();
        }

        fn wait_for_reads(&self, n: usize) {
            while self.block_reads.load(Ordering::SeqCst) < n {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }

    impl BlockSource for GatedSource {
        fn put(&self, key: &RecordKey, data: &[u8]) -> Result<()> {
            self.inner.put(key, data)
        }

        fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>> {
            if key.kind != crate::storage::RecordKind::Folder {
                self.block_reads.fetch_add(1, Ordering::SeqCst);
                if self.closed.load(Ordering::SeqCst) {
                    let mut open = self.gate.lock().unwrap();
                    while !*open {
                        open = self.opened.wait(open).unwrap();
                    }
                }
            }
            self.inner.get(key)
        }

        fn exists(&self, key: &RecordKey) -> Result<bool> {
            self.inner.exists(key)
        }

        fn delete(&self, key: &RecordKey) -> Result<()> {
            self.inner.delete(key)
        }

        fn clear(&self) -> Result<()> {
            self.inner.clear()
        }
    }

    fn gated_store_with_message() -> (Arc<GatedSource>, FolderBlockStore) {
        let source = Arc::new(GatedSource::new());
        let store = open(source.clone());
        store.add_message(header(BASE, 1), body(10)).unwrap();
        store.release_memory().unwrap();
        source.close();
        (source, store)
    }

    #[test]
    fn test_concurrent_reads_share_one_load() {
        let (source, store) = gated_store_with_message();

        std::thread::scope(|s| {
            let a = s.spawn(|| store.get_all_messages_in_date_range(BASE, BASE + DAY).unwrap());
            source.wait_for_reads(1);
            let b = s.spawn(|| store.get_all_messages_in_date_range(BASE, BASE + DAY).unwrap());
            std::thread::sleep(Duration::from_millis(20));
            source.open();
            assert_eq!(a.join().unwrap().len(), 1);
            assert_eq!(b.join().unwrap().len(), 1);
        });

        assert_eq!(source.block_reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mutation_during_load_is_deferred_then_replayed() {
        let (source, store) = gated_store_with_message();

        std::thread::scope(|s| {
            let reader =
                s.spawn(|| store.get_all_messages_in_date_range(BASE, BASE + DAY).unwrap());
            source.wait_for_reads(1);

            let outcome = store
                .update_message_flags(BASE, 1, vec!["\\Flagged".to_string()])
                .unwrap();
            assert_eq!(outcome, Mutation::Deferred);
            let outcome = store.add_message(header(BASE + 10, 2), body(10)).unwrap();
            assert_eq!(outcome, Mutation::Deferred);

            source.open();
            let seen = reader.join().unwrap();
            assert!(!seen.is_empty());
        });

        store.wait_for_deferred().unwrap();
        let flagged = store.get_message_header(BASE, 1).unwrap().unwrap();
        assert_eq!(flagged.flags, vec!["\\Flagged".to_string()]);
        assert_eq!(store.known_message_count(), 2);
    }

    #[test]
    fn test_missing_block_payload_is_an_error() {
        let source = Arc::new(InMemoryBlockSource::new());
        let store = open(source.clone());
        store.add_message(header(BASE, 1), body(10)).unwrap();
        store.release_memory().unwrap();
        source
            .delete(&RecordKey::block("inbox", BlockKind::Header, 0))
            .unwrap();

        let err = store.get_all_messages_in_date_range(BASE, BASE + DAY).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
