//! Block directory policy: where a message goes and how blocks split
//!
//! Header and body blocks share the same placement and split rules, so the
//! logic here is written once against [`BlockEntries`].

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::BlockLimits;
use crate::models::{
    BlockId, BlockKind, BodyBlock, BodyInfo, FolderBlockInfo, HeaderBlock, HeaderInfo, MessageKey,
    Uid,
};

/// A block payload holding entries ordered newest first
pub trait BlockEntries: Default + Clone + Serialize + DeserializeOwned + Send + 'static {
    type Entry: Clone + Send;

    const KIND: BlockKind;

    fn len(&self) -> usize;

    fn key_at(&self, idx: usize) -> MessageKey;

    fn size_at(&self, idx: usize, limits: &BlockLimits) -> usize;

    fn insert_at(&mut self, idx: usize, entry: Self::Entry);

    fn remove_at(&mut self, idx: usize) -> Self::Entry;

    /// Keep `[0, at)` and return the older `[at, len)` as a new block
    fn split_off(&mut self, at: usize) -> Self;

    fn entry_key(entry: &Self::Entry) -> MessageKey;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `Ok(idx)` when `key` is present, else `Err(insertion index)`
    fn position(&self, key: MessageKey) -> Result<usize, usize> {
        match (0..self.len()).find(|&i| self.key_at(i) <= key) {
            Some(i) if self.key_at(i) == key => Ok(i),
            Some(i) => Err(i),
            None => Err(self.len()),
        }
    }

    fn total_size(&self, limits: &BlockLimits) -> usize {
        (0..self.len()).map(|i| self.size_at(i, limits)).sum()
    }
}

impl BlockEntries for HeaderBlock {
    type Entry = HeaderInfo;

    const KIND: BlockKind = BlockKind::Header;

    fn len(&self) -> usize {
        self.headers.len()
    }

    fn key_at(&self, idx: usize) -> MessageKey {
        self.headers[idx].key()
    }

    fn size_at(&self, _idx: usize, limits: &BlockLimits) -> usize {
        limits.header_est_size
    }

    fn insert_at(&mut self, idx: usize, entry: HeaderInfo) {
        self.uids.insert(idx, entry.id);
        self.headers.insert(idx, entry);
    }

    fn remove_at(&mut self, idx: usize) -> HeaderInfo {
        self.uids.remove(idx);
        self.headers.remove(idx)
    }

    fn split_off(&mut self, at: usize) -> Self {
        HeaderBlock {
            uids: self.uids.split_off(at),
            headers: self.headers.split_off(at),
        }
    }

    fn entry_key(entry: &HeaderInfo) -> MessageKey {
        entry.key()
    }
}

impl BlockEntries for BodyBlock {
    type Entry = (Uid, BodyInfo);

    const KIND: BlockKind = BlockKind::Body;

    fn len(&self) -> usize {
        self.uids.len()
    }

    fn key_at(&self, idx: usize) -> MessageKey {
        let uid = self.uids[idx];
        let date = self.bodies.get(&uid).map_or(0, |body| body.date);
        MessageKey::new(date, uid)
    }

    fn size_at(&self, idx: usize, _limits: &BlockLimits) -> usize {
        self.bodies.get(&self.uids[idx]).map_or(0, |body| body.size)
    }

    fn insert_at(&mut self, idx: usize, (uid, body): (Uid, BodyInfo)) {
        self.uids.insert(idx, uid);
        self.bodies.insert(uid, body);
    }

    fn remove_at(&mut self, idx: usize) -> (Uid, BodyInfo) {
        let uid = self.uids.remove(idx);
        (uid, self.bodies.remove(&uid).unwrap_or_default())
    }

    fn split_off(&mut self, at: usize) -> Self {
        let uids = self.uids.split_off(at);
        let bodies = uids
            .iter()
            .filter_map(|uid| self.bodies.remove(uid).map(|body| (*uid, body)))
            .collect();
        BodyBlock { uids, bodies }
    }

    fn entry_key((uid, body): &(Uid, BodyInfo)) -> MessageKey {
        MessageKey::new(body.date, *uid)
    }
}

/// Build the directory entry for a block's current contents
pub fn summarize<B: BlockEntries>(
    block_id: BlockId,
    block: &B,
    limits: &BlockLimits,
) -> Option<FolderBlockInfo> {
    if block.is_empty() {
        return None;
    }
    let newest = block.key_at(0);
    let oldest = block.key_at(block.len() - 1);
    Some(FolderBlockInfo {
        block_id,
        start_ts: oldest.date,
        start_uid: oldest.uid,
        end_ts: newest.date,
        end_uid: newest.uid,
        count: block.len(),
        est_size: block.total_size(limits),
    })
}

/// Index of the block that should receive `key`, or None when the directory is empty.
///
/// A block whose span contains the key always wins. Otherwise the older
/// neighbour is tried, then the newer one, taking whichever stays under the
/// size limit. When neither fits, the neighbour farther from the middle of
/// the directory takes it and will split.
pub fn choose_insertion(
    infos: &[FolderBlockInfo],
    key: MessageKey,
    size: usize,
    limits: &BlockLimits,
) -> Option<usize> {
    if infos.is_empty() {
        return None;
    }

    let mut older = infos.len();
    for (i, info) in infos.iter().enumerate() {
        if info.contains(key) {
            return Some(i);
        }
        if info.end_key() < key {
            older = i;
            break;
        }
    }

    let fits = |idx: usize| infos[idx].est_size + size < limits.max_block_size;
    let has_older = older < infos.len();
    let has_newer = older > 0;

    if has_older && fits(older) {
        return Some(older);
    }
    if has_newer && fits(older - 1) {
        return Some(older - 1);
    }

    if (has_newer && older < infos.len() / 2) || !has_older {
        Some(older - 1)
    } else {
        Some(older)
    }
}

/// Size the newer half of a split should aim for.
///
/// Edge blocks keep the part nearer the center larger, since new messages
/// tend to land at the edges.
pub fn split_target(index: usize, len: usize, limits: &BlockLimits) -> usize {
    if index == 0 {
        limits.split_small
    } else if index + 1 == len {
        limits.split_large
    } else {
        limits.split_equal
    }
}

/// How many of the newest entries stay in place when splitting toward `target` bytes.
///
/// Always leaves at least one entry on each side; None when the block is too
/// small to split.
pub fn split_point<B: BlockEntries>(
    block: &B,
    target: usize,
    limits: &BlockLimits,
) -> Option<usize> {
    let len = block.len();
    if len < 2 {
        return None;
    }
    let mut acc = 0;
    let mut keep = len;
    for i in 0..len {
        acc += block.size_at(i, limits);
        if acc >= target {
            keep = i + 1;
            break;
        }
    }
    Some(keep.clamp(1, len - 1))
}
