//! Accuracy range bookkeeping
//!
//! The list is kept sorted descending by `end_ts` with no two ranges
//! overlapping. Marking a window that overlaps existing ranges collapses
//! them into their union, which takes the stamp of the window being
//! marked. Ranges that merely touch are merged only when their stamps agree.

use crate::date::Timestamp;
use crate::models::{AccuracyRange, FullSyncInfo};

/// Record that `[start_ts, end_ts)` now matches the server as of `info`.
///
/// # Returns
/// `true` if the range list changed
pub fn mark_sync_range(
    ranges: &mut Vec<AccuracyRange>,
    start_ts: Timestamp,
    end_ts: Timestamp,
    info: FullSyncInfo,
) -> bool {
    let before = ranges.clone();

    let mut merged = AccuracyRange {
        start_ts,
        end_ts,
        full_sync: info,
    };
    let mut remaining = std::mem::take(ranges);

    // Absorbing one range can make the union touch another, so repeat until stable.
    loop {
        let (absorb, keep): (Vec<AccuracyRange>, Vec<AccuracyRange>) =
            remaining.into_iter().partition(|range| {
                let adjacent = range.end_ts == merged.start_ts || range.start_ts == merged.end_ts;
                range.overlaps(merged.start_ts, merged.end_ts)
                    || (adjacent && range.full_sync == merged.full_sync)
            });
        remaining = keep;
        if absorb.is_empty() {
            break;
        }
        for range in absorb {
            merged.start_ts = merged.start_ts.min(range.start_ts);
            merged.end_ts = merged.end_ts.max(range.end_ts);
        }
    }

    remaining.push(merged);
    remaining.sort_by(|a, b| b.end_ts.cmp(&a.end_ts));
    *ranges = remaining;

    *ranges != before
}

/// Stretch the newest range back to before `oldest_sync_date` and drop the rest.
///
/// # Returns
/// `true` if the range list changed
pub fn mark_synced_to_dawn_of_time(
    ranges: &mut Vec<AccuracyRange>,
    oldest_sync_date: Timestamp,
) -> bool {
    let len = ranges.len();
    let Some(first) = ranges.first_mut() else {
        return false;
    };
    let dawn = oldest_sync_date - 1;
    if first.start_ts == dawn && len == 1 {
        return false;
    }
    first.start_ts = dawn;
    ranges.truncate(1);
    true
}

/// Whether the oldest range carries the dawn-of-time marker
pub fn synced_to_dawn_of_time(ranges: &[AccuracyRange], oldest_sync_date: Timestamp) -> bool {
    ranges
        .last()
        .is_some_and(|range| range.start_ts < oldest_sync_date)
}

/// Undo the dawn-of-time marker, pulling the oldest range in to `fallback_ts`.
///
/// # Returns
/// `true` if the marker was present
pub fn clear_synced_to_dawn_of_time(
    ranges: &mut [AccuracyRange],
    oldest_sync_date: Timestamp,
    fallback_ts: Timestamp,
) -> bool {
    match ranges.last_mut() {
        Some(range) if range.start_ts < oldest_sync_date => {
            range.start_ts = fallback_ts.min(range.end_ts);
            true
        }
        _ => false,
    }
}

/// Start of the unbroken coverage that begins with the newest range.
pub fn oldest_full_sync_date(ranges: &[AccuracyRange]) -> Option<Timestamp> {
    let mut iter = ranges.iter();
    let mut oldest = iter.next()?.start_ts;
    for range in iter {
        if range.end_ts < oldest {
            break;
        }
        oldest = range.start_ts;
    }
    Some(oldest)
}

/// The range covering `ts`, if any
pub fn range_containing(ranges: &[AccuracyRange], ts: Timestamp) -> Option<&AccuracyRange> {
    ranges.iter().find(|range| range.contains(ts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::date::DAY_MILLIS;

    const JAN1: Timestamp = 1_704_067_200_000;

    fn jan(day: i64) -> Timestamp {
        JAN1 + (day - 1) * DAY_MILLIS
    }

    fn info(stamp: Timestamp) -> FullSyncInfo {
        FullSyncInfo {
            highest_modseq: None,
            updated_at: stamp,
        }
    }

    fn assert_well_formed(ranges: &[AccuracyRange]) {
        for pair in ranges.windows(2) {
            assert!(pair[0].end_ts > pair[1].end_ts, "not sorted: {:?}", ranges);
            assert!(pair[1].end_ts <= pair[0].start_ts, "overlap: {:?}", ranges);
        }
    }

    #[test]
    fn test_mark_into_empty() {
        let mut ranges = Vec::new();
        assert!(mark_sync_range(&mut ranges, jan(1), jan(8), info(1)));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start_ts, jan(1));
        assert_eq!(ranges[0].end_ts, jan(8));
    }

    #[test]
    fn test_overlapping_marks_collapse_to_union() {
        let mut ranges = Vec::new();
        mark_sync_range(&mut ranges, jan(1), jan(8), info(1));
        mark_sync_range(&mut ranges, jan(5), jan(10), info(2));

        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start_ts, jan(1));
        assert_eq!(ranges[0].end_ts, jan(10));
        assert_eq!(ranges[0].full_sync, info(2));
    }

    #[test]
    fn test_disjoint_marks_stay_sorted_descending() {
        let mut ranges = Vec::new();
        mark_sync_range(&mut ranges, jan(1), jan(3), info(1));
        mark_sync_range(&mut ranges, jan(10), jan(12), info(2));
        mark_sync_range(&mut ranges, jan(5), jan(7), info(3));

        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0].start_ts, jan(10));
        assert_eq!(ranges[2].start_ts, jan(1));
        assert_well_formed(&ranges);
    }

    #[test]
    fn test_adjacent_marks_merge_only_with_same_stamp() {
        let mut ranges = Vec::new();
        mark_sync_range(&mut ranges, jan(1), jan(5), info(1));
        mark_sync_range(&mut ranges, jan(5), jan(9), info(2));
        assert_eq!(ranges.len(), 2);
        assert_well_formed(&ranges);

        mark_sync_range(&mut ranges, jan(9), jan(12), info(2));
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].start_ts, jan(5));
        assert_eq!(ranges[0].end_ts, jan(12));
    }

    #[test]
    fn test_mark_spanning_several_ranges() {
        let mut ranges = Vec::new();
        mark_sync_range(&mut ranges, jan(1), jan(2), info(1));
        mark_sync_range(&mut ranges, jan(4), jan(5), info(1));
        mark_sync_range(&mut ranges, jan(7), jan(8), info(1));
        mark_sync_range(&mut ranges, jan(20), jan(21), info(1));

        mark_sync_range(&mut ranges, jan(1), jan(8), info(5));
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[1].start_ts, jan(1));
        assert_eq!(ranges[1].end_ts, jan(8));
        assert_well_formed(&ranges);
    }

    #[test]
    fn test_remark_same_window_is_unchanged() {
        let mut ranges = Vec::new();
        mark_sync_range(&mut ranges, jan(1), jan(8), info(1));
        assert!(!mark_sync_range(&mut ranges, jan(1), jan(8), info(1)));
        assert!(mark_sync_range(&mut ranges, jan(1), jan(8), info(2)));
    }

    #[test]
    fn test_dawn_of_time_marker() {
        let oldest = jan(1) - 365 * DAY_MILLIS;
        let mut ranges = Vec::new();
        mark_sync_range(&mut ranges, jan(1), jan(3), info(1));
        mark_sync_range(&mut ranges, jan(10), jan(12), info(1));
        assert!(!synced_to_dawn_of_time(&ranges, oldest));

        assert!(mark_synced_to_dawn_of_time(&mut ranges, oldest));
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].start_ts, oldest - 1);
        assert_eq!(ranges[0].end_ts, jan(12));
        assert!(synced_to_dawn_of_time(&ranges, oldest));
        assert!(!mark_synced_to_dawn_of_time(&mut ranges, oldest));

        assert!(clear_synced_to_dawn_of_time(&mut ranges, oldest, jan(2)));
        assert_eq!(ranges[0].start_ts, jan(2));
        assert!(!synced_to_dawn_of_time(&ranges, oldest));
    }

    #[test]
    fn test_oldest_full_sync_date_follows_contiguous_chain() {
        let mut ranges = Vec::new();
        assert_eq!(oldest_full_sync_date(&ranges), None);

        mark_sync_range(&mut ranges, jan(8), jan(10), info(1));
        mark_sync_range(&mut ranges, jan(5), jan(8), info(2));
        mark_sync_range(&mut ranges, jan(1), jan(3), info(3));
        assert_eq!(oldest_full_sync_date(&ranges), Some(jan(5)));
        assert!(range_containing(&ranges, jan(2)).is_some());
        assert!(range_containing(&ranges, jan(4)).is_none());
    }
}
