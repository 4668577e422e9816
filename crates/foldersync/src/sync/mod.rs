//! Folder sync: date-range steps and the driver that repeats them

pub mod date_range;
pub mod diff;
mod folder;
pub mod growth;
pub mod progress;
pub mod timing;

pub use date_range::{BisectInfo, DateRangeSyncStep, StepOutcome, StepReport, StepRequest};
pub use diff::{DiffPlan, FetchReport, MessageDiffFetcher, classify};
pub use folder::FolderSyncer;
pub use growth::{
    CancelToken, DoneReason, DriverState, StepRunner, SyncDirection, SyncDriver, SyncKind,
    SyncSummary,
};
pub use progress::ProgressEstimator;
pub use timing::refresh_due;
