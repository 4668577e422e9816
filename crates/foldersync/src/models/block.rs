use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{BodyInfo, HeaderInfo, MessageKey, Uid};
use crate::date::Timestamp;

pub type BlockId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Header,
    Body,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Header => "header",
            BlockKind::Body => "body",
        }
    }
}

/// Directory entry describing one block.
///
/// `start_*` is the oldest message in the block, `end_*` the newest.
/// Both ends are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderBlockInfo {
    pub block_id: BlockId,
    pub start_ts: Timestamp,
    pub start_uid: Uid,
    pub end_ts: Timestamp,
    pub end_uid: Uid,
    pub count: usize,
    pub est_size: usize,
}

impl FolderBlockInfo {
    pub fn start_key(&self) -> MessageKey {
        MessageKey::new(self.start_ts, self.start_uid)
    }

    pub fn end_key(&self) -> MessageKey {
        MessageKey::new(self.end_ts, self.end_uid)
    }

    pub fn contains(&self, key: MessageKey) -> bool {
        self.start_key() <= key && key <= self.end_key()
    }

    /// Whether any message dated in `[start_ts, end_ts)` could live here
    pub fn overlaps_dates(&self, start_ts: Timestamp, end_ts: Timestamp) -> bool {
        self.start_ts < end_ts && start_ts <= self.end_ts
    }
}

/// Headers for one block, newest first. `uids[i]` is `headers[i].id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderBlock {
    pub uids: Vec<Uid>,
    pub headers: Vec<HeaderInfo>,
}

/// Bodies for one block. `uids` holds the newest-first order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyBlock {
    pub uids: Vec<Uid>,
    pub bodies: BTreeMap<Uid, BodyInfo>,
}
