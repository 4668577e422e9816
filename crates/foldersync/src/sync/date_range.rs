//! One SEARCH → diff → fetch cycle over a date window
//!
//! The server's date filters work in whole days of the server's timezone,
//! so the local side of the window is shifted by the configured offset
//! before known headers are loaded.

use log::{debug, info};

use super::diff::{MessageDiffFetcher, classify};
use super::progress::ProgressEstimator;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::date::{DAY_MILLIS, Timestamp, days_between, quantize};
use crate::error::SyncError;
use crate::imap::{ConnectionSession, DecoderFactory, SearchCriteria};
use crate::storage::FolderBlockStore;

/// Window and limits for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    /// Inclusive; `None` reaches back without limit
    pub start_ts: Option<Timestamp>,
    /// Exclusive; `None` reaches forward without limit
    pub end_ts: Option<Timestamp>,
    pub bisect_limit: usize,
    /// Stamp recorded on the accuracy range this step verifies
    pub accuracy_stamp: Timestamp,
}

/// Why a step gave up before touching storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BisectInfo {
    pub old_start_ts: Option<Timestamp>,
    pub old_end_ts: Option<Timestamp>,
    /// UIDs the SEARCH returned
    pub num_headers: usize,
    pub cur_days_delta: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    pub new_count: usize,
    pub known_count: usize,
    pub deleted_count: usize,
    pub partial_count: usize,
    pub skipped_count: usize,
    pub flags_changed: usize,
    /// Local-time bounds of the window that was reconciled
    pub eff_start_ts: Option<Timestamp>,
    pub eff_end_ts: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Too many results; retry with a narrower window
    Bisect(BisectInfo),
    Completed(StepReport),
}

pub struct DateRangeSyncStep<'a> {
    store: &'a FolderBlockStore,
    config: &'a SyncConfig,
    clock: &'a dyn Clock,
    decoders: &'a dyn DecoderFactory,
}

impl<'a> DateRangeSyncStep<'a> {
    pub fn new(
        store: &'a FolderBlockStore,
        config: &'a SyncConfig,
        clock: &'a dyn Clock,
        decoders: &'a dyn DecoderFactory,
    ) -> Self {
        Self {
            store,
            config,
            clock,
            decoders,
        }
    }

    /// Reconcile `[start_ts, end_ts)` with the server over the session's connection.
    ///
    /// A failed SEARCH gives up the connection and leaves storage untouched.
    pub fn run(
        &self,
        session: &mut ConnectionSession,
        req: &StepRequest,
        progress: &mut dyn FnMut(f64),
    ) -> Result<StepOutcome, SyncError> {
        if let (Some(start), Some(end)) = (req.start_ts, req.end_ts)
            && start >= end
        {
            return Err(SyncError::InvalidRange { start, end });
        }

        // The server only answers for whole days, so widen to day boundaries
        let start_ts = req.start_ts.map(quantize);
        let end_ts = req.end_ts.map(|ts| quantize(ts + DAY_MILLIS - 1));

        let mut progress = ProgressEstimator::new(self.config.progress, progress);
        let mailbox = session
            .mailbox()
            .cloned()
            .ok_or_else(|| SyncError::ConnectionUnavailable("no connection held".to_string()))?;
        progress.connection_acquired();

        let tz = self.config.tz_offset_ms;
        let eff_start_ts = start_ts.map(|ts| ts - tz);
        let eff_end_ts = end_ts.map(|ts| ts - tz);
        let criteria = SearchCriteria::new(start_ts, end_ts);
        debug!("[SYNC] {}: SEARCH {}", session.folder_path(), criteria.to_imap_string());

        // 1. SEARCH and the local load run side by side
        let (searched, known) = {
            let transport = session
                .transport()
                .ok_or_else(|| SyncError::ConnectionUnavailable("no connection held".to_string()))?;
            let store = self.store;
            rayon::join(
                || transport.search(&criteria),
                || {
                    store.get_all_messages_in_date_range(
                        eff_start_ts.unwrap_or(Timestamp::MIN),
                        eff_end_ts.unwrap_or(Timestamp::MAX),
                    )
                },
            )
        };
        let server_uids = match searched {
            Ok(uids) => uids,
            Err(e) => {
                session.connection_died();
                return Err(SyncError::SearchFailed(e));
            }
        };
        let known = known?;

        // 2. Too many results over more than a day: narrow and retry
        let now = self.clock.now_ms();
        let start = start_ts.unwrap_or(self.config.oldest_sync_date);
        let end = end_ts.unwrap_or_else(|| quantize(now + DAY_MILLIS + tz));
        let cur_days_delta = days_between(start, end);
        if server_uids.len() > req.bisect_limit && cur_days_delta > 1 {
            info!(
                "[SYNC] {}: {} results over {} days exceeds {}, bisecting",
                session.folder_path(),
                server_uids.len(),
                cur_days_delta,
                req.bisect_limit
            );
            return Ok(StepOutcome::Bisect(BisectInfo {
                old_start_ts: start_ts,
                old_end_ts: end_ts,
                num_headers: server_uids.len(),
                cur_days_delta,
            }));
        }
        progress.search_completed();

        // 3-5. Diff, then deletions and both fetch pipelines
        let plan = classify(&server_uids, known);
        debug!(
            "[SYNC] {}: {} new, {} known, {} deleted",
            session.folder_path(),
            plan.new_uids.len(),
            plan.known.len(),
            plan.deleted.len()
        );
        progress.begin_fetch(plan.new_uids.len(), plan.known.len());

        let fetcher = MessageDiffFetcher::new(self.store, self.decoders, self.config.snippet_chars);
        let fetched = match session.transport() {
            Some(transport) => fetcher.run(transport, plan, &mut progress),
            None => Err(SyncError::ConnectionUnavailable("no connection held".to_string())),
        };
        let fetched = match fetched {
            Ok(report) => report,
            Err(e) => {
                if e.is_connection_loss() {
                    session.connection_died();
                }
                return Err(e);
            }
        };

        // 6. Everything is in storage; record the verified window
        self.store.wait_for_deferred()?;
        self.store
            .mark_sync_range(start, end, mailbox.highest_modseq.clone(), req.accuracy_stamp);
        progress.finish();

        info!(
            "[SYNC] {}: step done ({} new, {} known, {} deleted)",
            session.folder_path(),
            fetched.new_count,
            fetched.known_count,
            fetched.deleted_count
        );
        Ok(StepOutcome::Completed(StepReport {
            new_count: fetched.new_count,
            known_count: fetched.known_count,
            deleted_count: fetched.deleted_count,
            partial_count: fetched.partial_count,
            skipped_count: fetched.skipped_count,
            flags_changed: fetched.flags_changed,
            eff_start_ts,
            eff_end_ts,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::imap::DefaultDecoderFactory;
    use crate::imap::memory::{
        InMemoryConnectionPool, InMemoryMailbox, InMemoryServer, ServerMessage,
    };
    use crate::storage::InMemoryBlockSource;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    const JAN1: Timestamp = 1_704_067_200_000;
    const NOW: Timestamp = JAN1 + 20 * DAY_MILLIS + 3_600_000;

    struct Fixture {
        mailbox: Arc<InMemoryMailbox>,
        session: ConnectionSession,
        source: Arc<InMemoryBlockSource>,
        store: FolderBlockStore,
        config: SyncConfig,
        clock: FixedClock,
        died: Arc<AtomicBool>,
    }

    fn fixture(bisect_limit: usize) -> Fixture {
        fixture_in_tz(bisect_limit, 0)
    }

    /// Server clock and account both at UTC plus `tz_offset_ms`
    fn fixture_in_tz(bisect_limit: usize, tz_offset_ms: i64) -> Fixture {
        let server = InMemoryServer::new();
        server.set_tz_offset(tz_offset_ms);
        let mailbox = server.mailbox("INBOX");
        let pool = InMemoryConnectionPool::new(server);
        let config = SyncConfig {
            bisect_limit,
            tz_offset_ms,
            ..SyncConfig::default()
        };
        let source = Arc::new(InMemoryBlockSource::new());
        let store = FolderBlockStore::open("inbox", "INBOX", source.clone(), &config).unwrap();
        let mut session = ConnectionSession::new(pool, "INBOX");
        let died = Arc::new(AtomicBool::new(false));
        let flag = died.clone();
        session
            .acquire_conn("test", true, move || flag.store(true, Ordering::SeqCst))
            .unwrap();
        Fixture {
            mailbox,
            session,
            source,
            store,
            config,
            clock: FixedClock::new(NOW),
            died,
        }
    }

    impl Fixture {
        fn run(
            &mut self,
            start: Option<Timestamp>,
            end: Option<Timestamp>,
        ) -> Result<StepOutcome, SyncError> {
            let step = DateRangeSyncStep::new(
                &self.store,
                &self.config,
                &self.clock,
                &DefaultDecoderFactory,
            );
            let req = StepRequest {
                start_ts: start,
                end_ts: end,
                bisect_limit: self.config.bisect_limit,
                accuracy_stamp: NOW,
            };
            step.run(&mut self.session, &req, &mut |_: f64| {})
        }

        fn fill(&self, days: i64, per_day: i64) {
            for day in 0..days {
                for i in 0..per_day {
                    let date = JAN1 + day * DAY_MILLIS + i * 60_000;
                    self.mailbox
                        .add(ServerMessage::text(date, "a@x.com", &format!("d{day} m{i}"), "body"));
                }
            }
        }
    }

    fn completed(outcome: StepOutcome) -> StepReport {
        match outcome {
            StepOutcome::Completed(report) => report,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_step_syncs_window_and_marks_range() {
        let mut f = fixture(50);
        f.fill(3, 4);

        let report = completed(f.run(Some(JAN1), Some(JAN1 + 3 * DAY_MILLIS)).unwrap());
        assert_eq!(report.new_count, 12);
        assert_eq!(report.known_count, 0);
        assert_eq!(report.eff_start_ts, Some(JAN1));
        assert_eq!(f.store.known_message_count(), 12);

        let ranges = f.store.accuracy_ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].start_ts, ranges[0].end_ts), (JAN1, JAN1 + 3 * DAY_MILLIS));
        assert_eq!(ranges[0].full_sync.updated_at, NOW);
    }

    #[test]
    fn test_step_bisects_without_touching_storage() {
        let mut f = fixture(5);
        f.fill(10, 2);

        let outcome = f.run(Some(JAN1), Some(JAN1 + 10 * DAY_MILLIS)).unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Bisect(BisectInfo {
                old_start_ts: Some(JAN1),
                old_end_ts: Some(JAN1 + 10 * DAY_MILLIS),
                num_headers: 20,
                cur_days_delta: 10,
            })
        );
        assert_eq!(f.store.known_message_count(), 0);
        assert!(f.store.accuracy_ranges().is_empty());
        assert_eq!(f.mailbox.stats().header_fetches, 0);
    }

    #[test]
    fn test_single_day_window_never_bisects() {
        let mut f = fixture(2);
        f.fill(1, 6);
        let report = completed(f.run(Some(JAN1), Some(JAN1 + DAY_MILLIS)).unwrap());
        assert_eq!(report.new_count, 6);
    }

    #[test]
    fn test_open_ended_window_delta_counts_to_tomorrow() {
        let mut f = fixture(1);
        f.fill(2, 2);
        match f.run(Some(JAN1), None).unwrap() {
            StepOutcome::Bisect(info) => {
                assert_eq!(info.old_end_ts, None);
                assert_eq!(info.cur_days_delta, 21);
            }
            other => panic!("expected bisect, got {other:?}"),
        }
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut f = fixture(50);
        f.fill(2, 3);
        f.run(Some(JAN1), Some(JAN1 + 2 * DAY_MILLIS)).unwrap();
        f.store.flush().unwrap();
        let before = f.source.snapshot().unwrap();

        let report = completed(f.run(Some(JAN1), Some(JAN1 + 2 * DAY_MILLIS)).unwrap());
        f.store.flush().unwrap();
        assert_eq!(report.new_count, 0);
        assert_eq!(report.known_count, 6);
        assert_eq!(report.flags_changed, 0);
        assert_eq!(f.source.snapshot().unwrap(), before);
    }

    #[test]
    fn test_search_drop_aborts_cleanly() {
        let mut f = fixture(50);
        f.fill(2, 2);
        f.run(Some(JAN1), Some(JAN1 + 2 * DAY_MILLIS)).unwrap();
        let ranges = f.store.accuracy_ranges();

        f.mailbox.remove(1);
        f.mailbox.drop_connection_on_search();
        let err = f.run(Some(JAN1), Some(JAN1 + 2 * DAY_MILLIS)).unwrap_err();

        assert!(matches!(err, SyncError::SearchFailed(_)));
        assert!(f.died.load(Ordering::SeqCst));
        assert!(!f.session.is_held());
        assert_eq!(f.store.known_message_count(), 4);
        assert_eq!(f.store.accuracy_ranges(), ranges);
    }

    #[test]
    fn test_invalid_range_rejected_before_search() {
        let mut f = fixture(50);
        let err = f.run(Some(JAN1 + DAY_MILLIS), Some(JAN1)).unwrap_err();
        assert!(matches!(err, SyncError::InvalidRange { .. }));
        assert_eq!(f.mailbox.stats().searches, 0);
    }

    /// Messages just inside and just outside one server-local day
    fn check_day_edges_in_tz(tz: i64) {
        const HOUR: i64 = 3_600_000;
        let mut f = fixture_in_tz(50, tz);
        let day = JAN1 + 5 * DAY_MILLIS;
        // The server's local day `day` spans [day - tz, day + DAY - tz) in UTC
        let first = day - tz;
        let last = day + DAY_MILLIS - tz;
        let dates = [first - 2 * HOUR, first + HOUR, last - HOUR, last + 2 * HOUR];
        for (i, date) in dates.iter().enumerate() {
            f.mailbox
                .add(ServerMessage::text(*date, "a@x.com", &format!("edge {i}"), "body"));
        }
        let wide = completed(f.run(Some(day - DAY_MILLIS), Some(day + 2 * DAY_MILLIS)).unwrap());
        assert_eq!(wide.new_count, 4);

        let report = completed(f.run(Some(day), Some(day + DAY_MILLIS)).unwrap());
        assert_eq!(report.deleted_count, 0);
        assert_eq!(report.known_count, 2);
        assert_eq!(report.new_count, 0);
        assert_eq!(report.eff_start_ts, Some(first));
        assert_eq!(report.eff_end_ts, Some(last));
        assert_eq!(f.store.known_message_count(), 4);
        for (i, date) in dates.iter().enumerate() {
            let header = f.store.get_message_header(*date, i as u32 + 1).unwrap();
            assert!(header.is_some(), "edge {i} was dropped");
        }
    }

    #[test]
    fn test_server_east_of_utc_keeps_day_edges() {
        check_day_edges_in_tz(5 * 3_600_000);
    }

    #[test]
    fn test_server_west_of_utc_keeps_day_edges() {
        check_day_edges_in_tz(-5 * 3_600_000);
    }

    #[test]
    fn test_refused_fetch_keeps_connection() {
        let mut f = fixture(50);
        f.fill(1, 2);
        f.mailbox.reject_next_fetch();

        let err = f.run(Some(JAN1), Some(JAN1 + DAY_MILLIS)).unwrap_err();
        assert!(matches!(err, SyncError::FetchFailed(_)));
        assert!(!f.died.load(Ordering::SeqCst));
        assert!(f.session.is_held());
        assert!(f.store.accuracy_ranges().is_empty());

        // Same connection, next attempt goes through
        let report = completed(f.run(Some(JAN1), Some(JAN1 + DAY_MILLIS)).unwrap());
        assert_eq!(report.new_count, 2);
    }
}
