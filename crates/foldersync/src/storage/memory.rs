//! In-memory block source
//!
//! Used by tests and by offline runs that don't need durability.

use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{BlockSource, RecordKey};

/// In-memory implementation of BlockSource
///
/// Records are kept as the exact bytes written so tests can compare
/// snapshots for byte-identical storage.
#[derive(Default)]
pub struct InMemoryBlockSource {
    records: RwLock<BTreeMap<RecordKey, Vec<u8>>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl InMemoryBlockSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every stored record
    pub fn snapshot(&self) -> Result<BTreeMap<RecordKey, Vec<u8>>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("block source lock poisoned"))?;
        Ok(records.clone())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of `get` calls served
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of `put` calls served
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockSource for InMemoryBlockSource {
    fn put(&self, key: &RecordKey, data: &[u8]) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("block source lock poisoned"))?;
        records.insert(key.clone(), data.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> Result<Option<Vec<u8>>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("block source lock poisoned"))?;
        Ok(records.get(key).cloned())
    }

    fn exists(&self, key: &RecordKey) -> Result<bool> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("block source lock poisoned"))?;
        Ok(records.contains_key(key))
    }

    fn delete(&self, key: &RecordKey) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("block source lock poisoned"))?;
        records.remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("block source lock poisoned"))?;
        records.clear();
        Ok(())
    }
}
