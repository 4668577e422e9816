//! Per-folder sync entry points
//!
//! A [`FolderSyncer`] ties one folder's [`ConnectionSession`] to its
//! [`SyncDriver`]. Only one sync per folder runs at a time; a second caller
//! gets [`SyncError::Busy`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};

use log::warn;

use super::date_range::{DateRangeSyncStep, StepOutcome, StepRequest};
use super::growth::{CancelToken, StepRunner, SyncDirection, SyncDriver, SyncSummary};
use super::timing::refresh_due;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::date::Timestamp;
use crate::error::SyncError;
use crate::imap::{ConnectionPool, ConnectionSession, DecoderFactory};
use crate::storage::FolderBlockStore;

struct ActiveSync {
    session: ConnectionSession,
    driver: SyncDriver,
}

/// Runs steps over the session's connection
struct SessionStepRunner<'a> {
    session: &'a mut ConnectionSession,
    step: DateRangeSyncStep<'a>,
    progress: &'a mut dyn FnMut(f64),
}

impl StepRunner for SessionStepRunner<'_> {
    fn run_step(&mut self, req: &StepRequest) -> Result<StepOutcome, SyncError> {
        self.step.run(self.session, req, &mut *self.progress)
    }

    fn server_total(&self) -> Option<u32> {
        self.session.mailbox().map(|mailbox| mailbox.exists)
    }
}

pub struct FolderSyncer {
    store: Arc<FolderBlockStore>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    decoders: Arc<dyn DecoderFactory>,
    aborted: Arc<AtomicBool>,
    active: Mutex<ActiveSync>,
}

impl FolderSyncer {
    pub fn new(
        store: Arc<FolderBlockStore>,
        pool: Arc<dyn ConnectionPool>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
        decoders: Arc<dyn DecoderFactory>,
    ) -> Self {
        let session = ConnectionSession::new(pool, store.path());
        let driver = SyncDriver::new(config.clone(), clock.clone());
        Self {
            store,
            config,
            clock,
            decoders,
            aborted: Arc::new(AtomicBool::new(false)),
            active: Mutex::new(ActiveSync { session, driver }),
        }
    }

    pub fn store(&self) -> &Arc<FolderBlockStore> {
        &self.store
    }

    /// Whether the last sync lost its connection
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Whether the window around `ts` is stale enough to refresh
    pub fn refresh_due(&self, ts: Timestamp) -> bool {
        let is_inbox = self.store.path().eq_ignore_ascii_case("INBOX");
        refresh_due(
            self.store.accuracy_updated_at(ts),
            self.clock.now_ms(),
            is_inbox,
            &self.config.refresh,
        )
    }

    pub fn initial_sync(
        &self,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<SyncSummary, SyncError> {
        self.with_sync("initial sync", progress, |driver, store, runner| {
            driver.initial_sync(store, runner, cancel)
        })
    }

    pub fn refresh_sync(
        &self,
        direction: SyncDirection,
        start_ts: Option<Timestamp>,
        end_ts: Option<Timestamp>,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<SyncSummary, SyncError> {
        self.with_sync("refresh sync", progress, |driver, store, runner| {
            driver.refresh_sync(store, runner, cancel, direction, start_ts, end_ts)
        })
    }

    pub fn grow_sync(
        &self,
        direction: SyncDirection,
        anchor_ts: Option<Timestamp>,
        window_days: i64,
        cancel: &CancelToken,
        progress: &mut dyn FnMut(f64),
    ) -> Result<SyncSummary, SyncError> {
        self.with_sync("grow sync", progress, |driver, store, runner| {
            driver.grow_sync(store, runner, cancel, direction, anchor_ts, window_days)
        })
    }

    fn with_sync(
        &self,
        label: &str,
        progress: &mut dyn FnMut(f64),
        sync: impl FnOnce(
            &mut SyncDriver,
            &FolderBlockStore,
            &mut dyn StepRunner,
        ) -> Result<SyncSummary, SyncError>,
    ) -> Result<SyncSummary, SyncError> {
        let mut guard = match self.active.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(SyncError::Busy),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let active = &mut *guard;

        self.aborted.store(false, Ordering::SeqCst);
        let aborted = self.aborted.clone();
        active.session.acquire_conn(label, true, move || {
            aborted.store(true, Ordering::SeqCst);
        })?;

        let store: &FolderBlockStore = &self.store;
        let step = DateRangeSyncStep::new(
            store,
            &self.config,
            self.clock.as_ref(),
            self.decoders.as_ref(),
        );
        let mut runner = SessionStepRunner {
            session: &mut active.session,
            step,
            progress,
        };
        let result = sync(&mut active.driver, store, &mut runner as &mut dyn StepRunner);

        if let Err(e) = &result {
            warn!("[SYNC] {}: {} failed: {}", self.store.folder_id(), label, e);
        }
        active.session.relinquish_conn();
        result
    }
}
