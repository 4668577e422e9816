use serde::{Deserialize, Serialize};

use crate::date::Timestamp;

/// Server state a sync observed for a window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncInfo {
    pub highest_modseq: Option<String>,
    pub updated_at: Timestamp,
}

/// A date window `[start_ts, end_ts)` that local storage claims matches the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyRange {
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub full_sync: FullSyncInfo,
}

impl AccuracyRange {
    pub fn overlaps(&self, start_ts: Timestamp, end_ts: Timestamp) -> bool {
        self.start_ts < end_ts && start_ts < self.end_ts
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start_ts <= ts && ts < self.end_ts
    }
}
