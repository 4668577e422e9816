//! Errors surfaced by a folder sync

use thiserror::Error;

use crate::date::Timestamp;
use crate::imap::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Could not get a usable connection to the folder
    #[error("connection unavailable: {0}")]
    ConnectionUnavailable(String),

    /// SEARCH failed; the connection was given up and storage left untouched
    #[error("search failed: {0}")]
    SearchFailed(TransportError),

    /// A header, flags or part fetch failed
    #[error("fetch failed: {0}")]
    FetchFailed(TransportError),

    #[error("invalid sync range: start {start} is not before end {end}")]
    InvalidRange { start: Timestamp, end: Timestamp },

    /// A sync was started while another was still running
    #[error("sync already in progress")]
    Busy,

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// Whether the connection is gone (or was given up) because of this error
    ///
    /// A fetch the server merely refused leaves the connection usable.
    pub fn is_connection_loss(&self) -> bool {
        match self {
            SyncError::ConnectionUnavailable(_) | SyncError::SearchFailed(_) => true,
            SyncError::FetchFailed(e) => e.is_fatal(),
            _ => false,
        }
    }
}
