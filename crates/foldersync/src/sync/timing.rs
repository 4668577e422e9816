//! Refresh staleness checks
//!
//! Pure functions so the scheduler side can be tested without a store.

use crate::config::RefreshThresholds;
use crate::date::Timestamp;

/// Check whether a window last verified at `last_verified_at` should be refreshed.
///
/// # Arguments
/// * `last_verified_at` - `updated_at` of the accuracy range covering the window
///   (None if never synced)
/// * `now` - Current time in UTC millis
/// * `is_inbox` - The inbox goes stale faster than other folders
///
/// # Returns
/// `true` if the threshold has elapsed (or the window was never synced)
pub fn refresh_due(
    last_verified_at: Option<Timestamp>,
    now: Timestamp,
    is_inbox: bool,
    thresholds: &RefreshThresholds,
) -> bool {
    let threshold = if is_inbox {
        thresholds.inbox_ms
    } else {
        thresholds.non_inbox_ms
    };
    match last_verified_at {
        Some(last) => now - last >= threshold,
        None => true,
    }
}
