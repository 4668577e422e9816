//! Day arithmetic for date-bounded folder searches
//!
//! IMAP `SINCE`/`BEFORE` only understand whole days, so every window
//! boundary the sync engine produces is quantized to a day boundary.
//! All timestamps are UTC milliseconds.

use chrono::{DateTime, Utc};

/// UTC milliseconds since the epoch
pub type Timestamp = i64;

pub const DAY_MILLIS: i64 = 24 * 60 * 60 * 1000;

/// 1990-01-01T00:00:00Z, the default floor for pastwards syncs
pub const DEFAULT_OLDEST_SYNC_DATE: Timestamp = 631_152_000_000;

/// Round a timestamp down to the start of its (UTC) day.
pub fn quantize(ts: Timestamp) -> Timestamp {
    ts - ts.rem_euclid(DAY_MILLIS)
}

/// Start of the day `days` days before the day containing `ts`.
pub fn make_days_before(ts: Timestamp, days: i64) -> Timestamp {
    quantize(ts) - days * DAY_MILLIS
}

/// Start of the day `days` days after the day containing `ts`.
pub fn make_days_after(ts: Timestamp, days: i64) -> Timestamp {
    quantize(ts) + days * DAY_MILLIS
}

/// Whole days between two timestamps, rounded to the nearest day.
pub fn days_between(start: Timestamp, end: Timestamp) -> i64 {
    ((end - start) as f64 / DAY_MILLIS as f64).round() as i64
}

/// Render a timestamp the way IMAP date criteria expect (`5-Jan-2024`).
pub fn imap_date(ts: Timestamp) -> String {
    let date: DateTime<Utc> = DateTime::from_timestamp_millis(ts).unwrap_or_default();
    date.format("%-d-%b-%Y").to_string()
}
