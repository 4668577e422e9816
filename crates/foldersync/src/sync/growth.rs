//! The multi-step sync driver
//!
//! Runs date-range steps back to back, narrowing the window when a step
//! bisects and widening it when a step finds nothing new, until the sync
//! reaches its bound, has enough headers, or is cancelled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info};

use super::date_range::{BisectInfo, StepOutcome, StepReport, StepRequest};
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::date::{DAY_MILLIS, Timestamp, days_between, make_days_after, make_days_before, quantize};
use crate::error::SyncError;
use crate::storage::FolderBlockStore;

/// Bisect deltas above this many days are treated as [`HUGE_DELTA_FALLBACK_DAYS`]
const HUGE_DELTA_DAYS: i64 = 1000;
const HUGE_DELTA_FALLBACK_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// From newer to older
    Pastwards,
    /// From older to newer
    Futurewards,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    Initial,
    Refresh,
    Grow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Syncing,
    BisectRetry,
    StepComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneReason {
    Cancelled,
    /// Everything on the server is stored locally
    DawnOfTime,
    /// The window reached the sync's outer bound
    ReachedBound,
    /// Enough headers for the caller
    Satisfied,
}

/// Runs one step over a window
pub trait StepRunner {
    fn run_step(&mut self, req: &StepRequest) -> Result<StepOutcome, SyncError>;

    /// Message count the server reported for the folder, if known
    fn server_total(&self) -> Option<u32>;
}

/// Cooperative cancellation, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a whole sync did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub kind: SyncKind,
    pub direction: SyncDirection,
    pub reason: DoneReason,
    /// Completed steps
    pub steps: usize,
    pub bisections: usize,
    pub new_count: usize,
    pub known_count: usize,
    pub deleted_count: usize,
    pub partial_count: usize,
    pub flags_changed: usize,
}

impl SyncSummary {
    /// A sync that had nothing to do
    fn idle(kind: SyncKind, direction: SyncDirection, reason: DoneReason) -> Self {
        Self {
            kind,
            direction,
            reason,
            steps: 0,
            bisections: 0,
            new_count: 0,
            known_count: 0,
            deleted_count: 0,
            partial_count: 0,
            flags_changed: 0,
        }
    }
}

/// Owns the window state of one folder's syncs
pub struct SyncDriver {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    state: DriverState,
    kind: SyncKind,
    direction: SyncDirection,
    start_ts: Option<Timestamp>,
    end_ts: Option<Timestamp>,
    window_days: i64,
    /// Pastwards windows never start before this
    floor: Timestamp,
    /// Futurewards windows never end after this; `None` runs up to now
    ceiling: Option<Timestamp>,
    /// Growth is paused until the window passes this edge
    do_not_grow_until: Option<Timestamp>,
    /// Futurewards sync that started at the oldest sync date for lack of an anchor
    fallback_origin: bool,
    desired_headers: Option<usize>,
    accuracy_stamp: Timestamp,
    steps: usize,
    bisections: usize,
    totals: StepReport,
}

impl SyncDriver {
    pub fn new(config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let floor = config.oldest_sync_date;
        Self {
            config,
            clock,
            state: DriverState::Idle,
            kind: SyncKind::Initial,
            direction: SyncDirection::Pastwards,
            start_ts: None,
            end_ts: None,
            window_days: 1,
            floor,
            ceiling: None,
            do_not_grow_until: None,
            fallback_origin: false,
            desired_headers: None,
            accuracy_stamp: 0,
            steps: 0,
            bisections: 0,
            totals: StepReport::default(),
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Window the next (or last) step runs over
    pub fn window(&self) -> (Option<Timestamp>, Option<Timestamp>) {
        (self.start_ts, self.end_ts)
    }

    /// Start from now and walk into the past until enough headers are stored.
    pub fn initial_sync(
        &mut self,
        store: &FolderBlockStore,
        runner: &mut dyn StepRunner,
        cancel: &CancelToken,
    ) -> Result<SyncSummary, SyncError> {
        let days = self.config.initial_sync_days.max(1);
        let start = make_days_before(self.now_bound(), days).max(self.config.oldest_sync_date);
        self.begin(SyncKind::Initial, SyncDirection::Pastwards, Some(start), None, days)?;
        self.desired_headers = Some(self.config.initial_fill_size);
        self.drive(store, runner, cancel)
    }

    /// Re-verify `[start_ts, end_ts)`; open bounds mean the oldest sync date and now.
    pub fn refresh_sync(
        &mut self,
        store: &FolderBlockStore,
        runner: &mut dyn StepRunner,
        cancel: &CancelToken,
        direction: SyncDirection,
        start_ts: Option<Timestamp>,
        end_ts: Option<Timestamp>,
    ) -> Result<SyncSummary, SyncError> {
        if let (Some(start), Some(end)) = (start_ts, end_ts)
            && start >= end
        {
            return Err(SyncError::InvalidRange { start, end });
        }
        let floor = start_ts.unwrap_or(self.config.oldest_sync_date);
        let days = days_between(floor, end_ts.unwrap_or_else(|| self.now_bound())).max(1);
        self.begin(SyncKind::Refresh, direction, start_ts, end_ts, days)?;
        self.floor = floor;
        self.ceiling = end_ts;
        self.drive(store, runner, cancel)
    }

    /// Extend coverage outward from `anchor_ts`.
    ///
    /// Pastwards defaults to the oldest fully synced date. Futurewards with no
    /// anchor starts at the oldest sync date.
    pub fn grow_sync(
        &mut self,
        store: &FolderBlockStore,
        runner: &mut dyn StepRunner,
        cancel: &CancelToken,
        direction: SyncDirection,
        anchor_ts: Option<Timestamp>,
        window_days: i64,
    ) -> Result<SyncSummary, SyncError> {
        let days = window_days.max(1);
        match direction {
            SyncDirection::Pastwards => {
                if store.synced_to_dawn_of_time() {
                    info!("[SYNC] {}: already synced to the dawn of time", store.folder_id());
                    return Ok(SyncSummary::idle(SyncKind::Grow, direction, DoneReason::DawnOfTime));
                }
                let anchor = anchor_ts
                    .or_else(|| store.oldest_full_sync_date())
                    .unwrap_or_else(|| self.now_bound());
                if anchor <= self.config.oldest_sync_date {
                    return Ok(SyncSummary::idle(
                        SyncKind::Grow,
                        direction,
                        DoneReason::ReachedBound,
                    ));
                }
                let start = make_days_before(anchor, days).max(self.config.oldest_sync_date);
                self.begin(SyncKind::Grow, direction, Some(start), Some(anchor), days)?;
            }
            SyncDirection::Futurewards => {
                let start = anchor_ts.unwrap_or(self.config.oldest_sync_date);
                let end = make_days_after(start, days);
                let end = (end < self.now_bound()).then_some(end);
                self.begin(SyncKind::Grow, direction, Some(start), end, days)?;
                self.fallback_origin = anchor_ts.is_none();
            }
        }
        self.desired_headers = Some(self.config.initial_fill_size);
        self.drive(store, runner, cancel)
    }

    fn begin(
        &mut self,
        kind: SyncKind,
        direction: SyncDirection,
        start_ts: Option<Timestamp>,
        end_ts: Option<Timestamp>,
        window_days: i64,
    ) -> Result<(), SyncError> {
        if self.state != DriverState::Idle {
            return Err(SyncError::Busy);
        }
        self.kind = kind;
        self.direction = direction;
        self.start_ts = start_ts;
        self.end_ts = end_ts;
        self.window_days = window_days;
        self.floor = self.config.oldest_sync_date;
        self.ceiling = None;
        self.do_not_grow_until = None;
        self.fallback_origin = false;
        self.desired_headers = None;
        self.accuracy_stamp = self.clock.now_ms();
        self.steps = 0;
        self.bisections = 0;
        self.totals = StepReport::default();
        info!(
            "[SYNC] begin {:?} {:?} sync over {:?}..{:?} ({} days)",
            kind, direction, start_ts, end_ts, window_days
        );
        Ok(())
    }

    fn drive(
        &mut self,
        store: &FolderBlockStore,
        runner: &mut dyn StepRunner,
        cancel: &CancelToken,
    ) -> Result<SyncSummary, SyncError> {
        let result = self.run_steps(store, runner, cancel);
        // Checkpoint whatever the steps stored, even on failure
        let flushed = store.flush();
        self.state = DriverState::Idle;

        let reason = result?;
        flushed?;
        let summary = self.summary(reason);
        info!(
            "[SYNC] {}: {:?} sync done ({:?}) after {} steps, {} bisections, {} new",
            store.folder_id(),
            summary.kind,
            summary.reason,
            summary.steps,
            summary.bisections,
            summary.new_count
        );
        Ok(summary)
    }

    fn run_steps(
        &mut self,
        store: &FolderBlockStore,
        runner: &mut dyn StepRunner,
        cancel: &CancelToken,
    ) -> Result<DoneReason, SyncError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(DoneReason::Cancelled);
            }
            self.state = DriverState::Syncing;
            let req = StepRequest {
                start_ts: self.start_ts,
                end_ts: self.end_ts,
                bisect_limit: self.config.bisect_limit,
                accuracy_stamp: self.accuracy_stamp,
            };
            match runner.run_step(&req)? {
                StepOutcome::Bisect(info) => {
                    self.state = DriverState::BisectRetry;
                    self.on_bisect(store, &info);
                }
                StepOutcome::Completed(report) => {
                    self.state = DriverState::StepComplete;
                    let total = runner.server_total();
                    if let Some(reason) = self.on_step_completed(store, total, &report) {
                        return Ok(reason);
                    }
                }
            }
        }
    }

    fn on_bisect(&mut self, store: &FolderBlockStore, info: &BisectInfo) {
        self.bisections += 1;
        let limit = self.config.bisect_limit.max(1) as f64;
        let oldest = self.config.oldest_sync_date;
        let mut num_headers = info.num_headers.max(1) as f64;
        let mut delta = info.cur_days_delta;

        if self.direction == SyncDirection::Futurewards && self.fallback_origin {
            // There is history after the origin, so the folder is not fully synced
            store.clear_synced_to_dawn_of_time(info.old_start_ts.unwrap_or(oldest));
            num_headers = 1.5 * limit;
            self.fallback_origin = false;
        } else if delta > HUGE_DELTA_DAYS {
            delta = HUGE_DELTA_FALLBACK_DAYS;
        }
        // Linear density: shrink by limit / (2 * num_headers)
        let mut days = ((limit * delta as f64 / (num_headers * 2.0)).ceil() as i64).max(1);
        if days >= info.cur_days_delta {
            days = (info.cur_days_delta - 1).max(1);
        }

        match self.direction {
            SyncDirection::Pastwards => {
                let end = info.old_end_ts.unwrap_or_else(|| self.now_bound());
                self.do_not_grow_until = Some(info.old_start_ts.unwrap_or(oldest));
                self.start_ts = Some(make_days_before(end, days).max(self.floor));
                self.end_ts = info.old_end_ts;
            }
            SyncDirection::Futurewards => {
                let start = info.old_start_ts.unwrap_or(oldest);
                self.do_not_grow_until = Some(info.old_end_ts.unwrap_or_else(|| self.now_bound()));
                self.start_ts = Some(start);
                self.end_ts = Some(make_days_after(start, days));
            }
        }
        self.window_days = days;
        debug!(
            "[SYNC] bisect: {} results over {} days, retrying with {} days",
            info.num_headers, info.cur_days_delta, days
        );
    }

    /// Fold a completed step in and move the window, or say why the sync is done.
    fn on_step_completed(
        &mut self,
        store: &FolderBlockStore,
        server_total: Option<u32>,
        report: &StepReport,
    ) -> Option<DoneReason> {
        self.steps += 1;
        self.totals.new_count += report.new_count;
        self.totals.known_count += report.known_count;
        self.totals.deleted_count += report.deleted_count;
        self.totals.partial_count += report.partial_count;
        self.totals.skipped_count += report.skipped_count;
        self.totals.flags_changed += report.flags_changed;

        if self.direction == SyncDirection::Pastwards
            && let Some(total) = server_total
            && self.holds_everything(store, total)
        {
            store.mark_synced_to_dawn_of_time();
            return Some(DoneReason::DawnOfTime);
        }

        if self.reached_bound() {
            return Some(DoneReason::ReachedBound);
        }

        if let Some(wanted) = self.desired_headers
            && self.totals.new_count + self.totals.known_count >= wanted
        {
            return Some(DoneReason::Satisfied);
        }

        if report.new_count == 0 {
            match self.do_not_grow_until {
                Some(pin) if self.passed(pin) => {
                    self.do_not_grow_until = None;
                    self.widen();
                }
                Some(_) => {}
                None => self.widen(),
            }
        }

        self.advance()
    }

    /// Local count matches the server and coverage reaches past the oldest local message
    fn holds_everything(&self, store: &FolderBlockStore, server_total: u32) -> bool {
        if store.known_message_count() != server_total as usize {
            return false;
        }
        let covered_from = self.start_ts.unwrap_or(self.config.oldest_sync_date);
        server_total == 0
            || store
                .oldest_message_timestamp()
                .is_none_or(|oldest| covered_from <= oldest)
    }

    fn reached_bound(&self) -> bool {
        match self.direction {
            SyncDirection::Pastwards => self.start_ts.is_none_or(|start| start <= self.floor),
            SyncDirection::Futurewards => match (self.end_ts, self.ceiling) {
                (None, _) => true,
                (Some(end), Some(ceiling)) => end >= ceiling,
                (Some(end), None) => end >= self.now_bound(),
            },
        }
    }

    fn passed(&self, pin: Timestamp) -> bool {
        match self.direction {
            SyncDirection::Pastwards => self.start_ts.is_none_or(|start| start <= pin),
            SyncDirection::Futurewards => self.end_ts.is_none_or(|end| end >= pin),
        }
    }

    fn widen(&mut self) {
        let now = self.clock.now_ms();
        let edge = match self.direction {
            SyncDirection::Pastwards => self.start_ts,
            SyncDirection::Futurewards => self.end_ts,
        }
        .unwrap_or(now);
        let cap = self.config.growth_cap_days(days_between(edge, now).abs());
        let grown = (self.window_days as f64 * self.config.growth_factor).ceil() as i64;
        self.window_days = self.window_days.max(grown.min(cap));
    }

    fn advance(&mut self) -> Option<DoneReason> {
        let days = self.window_days;
        match self.direction {
            SyncDirection::Pastwards => {
                let Some(end) = self.start_ts else {
                    return Some(DoneReason::ReachedBound);
                };
                self.end_ts = Some(end);
                self.start_ts = Some(make_days_before(end, days).max(self.floor));
            }
            SyncDirection::Futurewards => {
                let Some(start) = self.end_ts else {
                    return Some(DoneReason::ReachedBound);
                };
                let end = make_days_after(start, days);
                self.start_ts = Some(start);
                self.end_ts = match self.ceiling {
                    Some(ceiling) => Some(end.min(ceiling)),
                    None => (end < self.now_bound()).then_some(end),
                };
            }
        }
        debug!("[SYNC] next window {:?}..{:?} ({} days)", self.start_ts, self.end_ts, days);
        None
    }

    /// Start of tomorrow in server time: the exclusive end of "now"
    fn now_bound(&self) -> Timestamp {
        quantize(self.clock.now_ms() + DAY_MILLIS + self.config.tz_offset_ms)
    }

    fn summary(&self, reason: DoneReason) -> SyncSummary {
        SyncSummary {
            kind: self.kind,
            direction: self.direction,
            reason,
            steps: self.steps,
            bisections: self.bisections,
            new_count: self.totals.new_count,
            known_count: self.totals.known_count,
            deleted_count: self.totals.deleted_count,
            partial_count: self.totals.partial_count,
            flags_changed: self.totals.flags_changed,
        }
    }
}
