/// Sliding windows over sorted timestamp sequences.
///
/// The window ending at the i'th timestamp t is the half-open interval (t - w, t], and its count is
/// the number of timestamps in it.  Counts for all windows are computed with two pointers in a
/// single pass, O(n).  Windows whose count satisfies a predicate are "dense"; dense windows whose
/// intervals overlap are merged into one Episode, so that a burst is reported once no matter how
/// many windows it spans.
use chrono::{DateTime, Utc};
use logutils::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Episode {
    /// Start of the first dense window in the episode (exclusive).
    pub start: Timestamp,

    /// End of the last dense window in the episode (inclusive).
    pub end: Timestamp,

    /// Largest count of any window in the episode.
    pub peak: usize,
}

/// `ts` must be sorted in non-decreasing order.

pub fn dense_episodes<F>(ts: &[Timestamp], window: chrono::Duration, is_dense: F) -> Vec<Episode>
where
    F: Fn(usize) -> bool,
{
    let mut episodes: Vec<Episode> = vec![];
    let mut left = 0;
    for (i, t) in ts.iter().enumerate() {
        // A window end past the representable range is never <= t.
        while ts[left]
            .checked_add_signed(window)
            .is_some_and(|end| end <= *t)
        {
            left += 1;
        }
        let count = i - left + 1;
        if !is_dense(count) {
            continue;
        }
        let start = t.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        match episodes.last_mut() {
            Some(e) if start < e.end => {
                e.end = *t;
                e.peak = usize::max(e.peak, count);
            }
            _ => episodes.push(Episode {
                start,
                end: *t,
                peak: count,
            }),
        }
    }
    episodes
}

/// The number of timestamps in `ts` within (start, end].  `ts` must be sorted.

pub fn count_within(ts: &[Timestamp], start: Timestamp, end: Timestamp) -> usize {
    let lo = ts.partition_point(|t| *t <= start);
    let hi = ts.partition_point(|t| *t <= end);
    hi - lo
}

#[cfg(test)]
fn secs(xs: &[i64]) -> Vec<Timestamp> {
    let base = logutils::timestamp_from_ymdhms(2025, 1, 15, 10, 0, 0).unwrap();
    xs.iter()
        .map(|s| base + chrono::Duration::seconds(*s))
        .collect()
}

#[test]
fn test_window_counts() {
    let w = chrono::Duration::seconds(60);
    let ts = secs(&[0, 10, 20, 59, 60, 61, 200]);
    // Counts: 1, 2, 3, 4, 4 (0 drops out at 60), 5, 1
    let eps = dense_episodes(&ts, w, |n| n >= 4);
    assert!(eps.len() == 1);
    assert!(eps[0].peak == 5);
    assert!(eps[0].start == ts[3] - w);
    assert!(eps[0].end == ts[5]);

    let eps = dense_episodes(&ts, w, |n| n >= 5);
    assert!(eps.len() == 1);
    assert!(eps[0].start == ts[5] - w);

    let eps = dense_episodes(&ts, w, |n| n >= 6);
    assert!(eps.is_empty());
}

#[test]
fn test_episodes_merge() {
    let w = chrono::Duration::seconds(60);
    // Two bursts far apart, the first spread over more than one window.
    let ts = secs(&[0, 1, 2, 50, 51, 52, 100, 101, 102, 1000, 1001, 1002]);
    let eps = dense_episodes(&ts, w, |n| n >= 3);
    assert!(eps.len() == 2);
    assert!(eps[0].end == ts[8]);
    assert!(eps[0].peak == 6);
    assert!(eps[1].start == ts[11] - w);
    assert!(eps[1].peak == 3);

    assert!(dense_episodes(&[], w, |_| true).is_empty());
}

#[test]
fn test_count_within() {
    let ts = secs(&[0, 10, 10, 20, 30]);
    assert!(count_within(&ts, ts[0], ts[4]) == 4);
    assert!(count_within(&ts, ts[0], ts[1]) == 2);
    assert!(count_within(&ts, ts[4], ts[4]) == 0);
}

#[test]
fn test_huge_window() {
    let ts = secs(&[0, 10, 20]);
    let eps = dense_episodes(&ts, chrono::Duration::days(365 * 300_000), |n| n >= 2);
    assert!(eps.len() == 1);
    assert!(eps[0].peak == 3);
    assert!(eps[0].start == DateTime::<Utc>::MIN_UTC);
}
