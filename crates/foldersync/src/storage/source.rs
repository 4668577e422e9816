//! Persistence trait for folder records and block payloads

use anyhow::Result;

use crate::models::{BlockId, BlockKind};

/// What a stored record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// The folder directory (meta, accuracy ranges, block infos)
    Folder,
    Block(BlockKind, BlockId),
}

/// Key for storing/retrieving a serialized record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub folder_id: String,
    pub kind: RecordKind,
}

impl RecordKey {
    pub fn folder(folder_id: &str) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            kind: RecordKind::Folder,
        }
    }

    pub fn block(folder_id: &str, kind: BlockKind, block_id: BlockId) -> Self {
        Self {
            folder_id: folder_id.to_string(),
            kind: RecordKind::Block(kind, block_id),
        }
    }
}

/// Byte-level persistence for folder stores.
///
/// Implementations handle compression internally; callers see the
/// serialized JSON they wrote.
pub trait BlockSource: Send + Sync {
    fn put(&self, key: &RecordKey, data: &[u8]) -> Result<()>;

    /// Returns None if the record doesn't exist
    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>>;

    fn exists(&self, key: &RecordKey) -> Result<bool>;

    /// Deleting a missing record is not an error
    fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Remove every record for every folder
    fn clear(&self) -> Result<()>;
}
