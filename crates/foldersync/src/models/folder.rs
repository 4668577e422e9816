use serde::{Deserialize, Serialize};

use super::{AccuracyRange, BlockId, FolderBlockInfo};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderMeta {
    pub id: String,
    /// Mailbox path on the server, e.g. "INBOX" or "Archive/2023"
    pub path: String,
    pub next_header_block: BlockId,
    pub next_body_block: BlockId,
}

/// Persisted directory for one folder. Block payloads are stored separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub meta: FolderMeta,
    /// Sorted descending by `end_ts`, non-overlapping
    pub accuracy: Vec<AccuracyRange>,
    /// Sorted newest to oldest
    pub header_blocks: Vec<FolderBlockInfo>,
    pub body_blocks: Vec<FolderBlockInfo>,
}

impl FolderRecord {
    pub fn new(id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            meta: FolderMeta {
                id: id.into(),
                path: path.into(),
                next_header_block: 0,
                next_body_block: 0,
            },
            accuracy: Vec::new(),
            header_blocks: Vec::new(),
            body_blocks: Vec::new(),
        }
    }
}
