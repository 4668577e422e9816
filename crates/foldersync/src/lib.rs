//! Foldersync - incremental mirror of one IMAP folder
//!
//! This crate keeps a local, block-structured copy of a mail folder in step
//! with the server:
//! - Block storage for headers and bodies, with per-date-range accuracy marks
//! - A connection broker that borrows one connection from a shared pool
//! - Date-range sync steps that SEARCH, diff and fetch
//! - A driver that grows or refreshes coverage step by step, bisecting busy windows
//! - Progress estimation for UI feedback
//!
//! Everything is synchronous; callers run syncs on their own threads.

pub mod clock;
pub mod config;
pub mod date;
pub mod error;
pub mod imap;
pub mod models;
pub mod storage;
pub mod sync;

pub use clock::{Clock, FixedClock, SystemClock};
pub use crate::config::{BlockLimits, GrowthCap, ProgressWeights, RefreshThresholds, SyncConfig};
pub use date::{DAY_MILLIS, Timestamp};
pub use error::SyncError;
pub use imap::{
    ConnectionPool, ConnectionSession, DecoderFactory, DefaultDecoderFactory, ImapTransport,
    TransportError,
};
pub use models::{AccuracyRange, BodyInfo, HeaderInfo, Uid};
pub use storage::{BlockSource, FileBlockSource, FolderBlockStore, InMemoryBlockSource};
pub use sync::{
    // Entry points
    FolderSyncer, CancelToken, SyncDirection, SyncSummary, DoneReason,
    // Building blocks
    DateRangeSyncStep, MessageDiffFetcher, ProgressEstimator, SyncDriver,
};
