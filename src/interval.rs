use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a span was flagged for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RemovalKind {
    #[default]
    Repetition,
    FillerWord,
    LongPause,
    Manual,
}

impl RemovalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalKind::Repetition => "repetition",
            RemovalKind::FillerWord => "filler_word",
            RemovalKind::LongPause => "long_pause",
            RemovalKind::Manual => "manual",
        }
    }
}

/// A span of the source timeline to cut out.
///
/// Sentence-level analysis emits these with `is_entire_segment = true` when the
/// whole sentence goes, and `false` when only part of it does (those are refined
/// by word-level analysis before trimming).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemovalInterval {
    pub start_time: f64,
    pub end_time: f64,
    #[serde(rename = "type", default)]
    pub kind: RemovalKind,
    #[serde(rename = "is_entire", alias = "isEntire", default = "default_true")]
    pub is_entire_segment: bool,
}

fn default_true() -> bool {
    true
}

impl RemovalInterval {
    pub fn new(start_time: f64, end_time: f64, kind: RemovalKind, is_entire_segment: bool) -> Self {
        Self {
            start_time,
            end_time,
            kind,
            is_entire_segment,
        }
    }

    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// True when the interval shares any positive-length span with `[start, end]`.
    pub fn overlaps(&self, start: f64, end: f64) -> bool {
        self.start_time < end && start < self.end_time
    }
}

/// A span of the source timeline to retain. Always `end > start`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeepInterval {
    pub start: f64,
    pub end: f64,
}

impl KeepInterval {
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum IntervalError {
    #[error("no segments remain: removal intervals cover the whole {duration:.3}s timeline")]
    NothingToKeep { duration: f64 },

    #[error("invalid media duration: {0}")]
    InvalidDuration(f64),
}

/// Sort removal intervals ascending by start time, the order
/// [`compute_keep_intervals`] expects.
pub fn sort_removals(removals: &mut [RemovalInterval]) {
    removals.sort_by(|a, b| {
        a.start_time
            .total_cmp(&b.start_time)
            .then(a.end_time.total_cmp(&b.end_time))
    });
}

/// Derive the keep intervals covering `[0, duration]` minus the union of `removals`.
///
/// `removals` must already be sorted by `start_time`. Overlapping and touching
/// removals produce no gap between them; zero-length keeps are discarded. An empty
/// result is an error rather than "keep everything".
pub fn compute_keep_intervals(
    removals: &[RemovalInterval],
    duration: f64,
) -> Result<Vec<KeepInterval>, IntervalError> {
    if !(duration > 0.0) || !duration.is_finite() {
        return Err(IntervalError::InvalidDuration(duration));
    }
    debug_assert!(
        removals
            .windows(2)
            .all(|pair| pair[0].start_time <= pair[1].start_time),
        "removal intervals must be sorted by start_time"
    );

    if removals.is_empty() {
        return Ok(vec![KeepInterval { start: 0.0, end: duration }]);
    }

    let mut keeps = Vec::with_capacity(removals.len() + 1);

    // Tracks the furthest end seen so far, so a removal nested inside an
    // earlier, longer one never opens a gap.
    let mut covered_until = 0.0_f64;
    for removal in removals {
        let gap_end = removal.start_time.min(duration);
        if gap_end > covered_until {
            keeps.push(KeepInterval {
                start: covered_until,
                end: gap_end,
            });
        }
        covered_until = covered_until.max(removal.end_time);
        if covered_until >= duration {
            break;
        }
    }

    if covered_until < duration {
        keeps.push(KeepInterval {
            start: covered_until,
            end: duration,
        });
    }

    keeps.retain(|k| k.end > k.start);

    if keeps.is_empty() {
        return Err(IntervalError::NothingToKeep { duration });
    }
    Ok(keeps)
}

/// Total retained time across a keep list.
pub fn kept_duration(keeps: &[KeepInterval]) -> f64 {
    keeps.iter().map(KeepInterval::duration).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn removal(start: f64, end: f64) -> RemovalInterval {
        RemovalInterval::new(start, end, RemovalKind::Repetition, true)
    }

    fn spans(keeps: &[KeepInterval]) -> Vec<(f64, f64)> {
        keeps.iter().map(|k| (k.start, k.end)).collect()
    }

    #[test]
    fn empty_removals_keep_everything() {
        let keeps = compute_keep_intervals(&[], 12.5).unwrap();
        assert_eq!(spans(&keeps), vec![(0.0, 12.5)]);
    }

    #[test]
    fn removal_covering_whole_timeline_is_an_error() {
        let err = compute_keep_intervals(&[removal(0.0, 10.0)], 10.0).unwrap_err();
        assert_eq!(err, IntervalError::NothingToKeep { duration: 10.0 });
    }

    #[test]
    fn touching_removals_leave_no_gap() {
        let keeps = compute_keep_intervals(&[removal(2.0, 4.0), removal(4.0, 6.0)], 10.0).unwrap();
        assert_eq!(spans(&keeps), vec![(0.0, 2.0), (6.0, 10.0)]);
    }

    #[test]
    fn derives_gaps_between_sorted_removals() {
        // The leading [0, 0.48] gap is real footage and is kept.
        let removals = [
            removal(0.48, 7.12),
            removal(10.72, 15.60),
            removal(16.66, 24.27),
        ];
        let keeps = compute_keep_intervals(&removals, 30.0).unwrap();
        assert_eq!(
            spans(&keeps),
            vec![(0.0, 0.48), (7.12, 10.72), (15.60, 16.66), (24.27, 30.0)]
        );
    }

    #[test]
    fn overlapping_and_nested_removals_merge() {
        let removals = [removal(1.0, 10.0), removal(2.0, 3.0), removal(5.0, 12.0)];
        let keeps = compute_keep_intervals(&removals, 20.0).unwrap();
        assert_eq!(spans(&keeps), vec![(0.0, 1.0), (12.0, 20.0)]);
    }

    #[test]
    fn removals_past_the_end_are_clamped() {
        let keeps = compute_keep_intervals(&[removal(8.0, 15.0)], 10.0).unwrap();
        assert_eq!(spans(&keeps), vec![(0.0, 8.0)]);
    }

    #[test]
    fn keeps_tile_the_complement() {
        let removals = [removal(1.0, 2.0), removal(3.5, 4.0), removal(7.0, 9.0)];
        let duration = 10.0;
        let keeps = compute_keep_intervals(&removals, duration).unwrap();

        for pair in keeps.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        assert!(keeps.iter().all(|k| k.duration() > 0.0));

        let removed: f64 = removals.iter().map(RemovalInterval::duration).sum();
        assert!((kept_duration(&keeps) + removed - duration).abs() < 1e-9);
    }

    #[test]
    fn derivation_is_repeatable() {
        let removals = [removal(2.0, 3.0), removal(5.0, 6.0)];
        let first = compute_keep_intervals(&removals, 8.0).unwrap();
        let second = compute_keep_intervals(&removals, 8.0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_non_positive_duration() {
        assert!(matches!(
            compute_keep_intervals(&[], 0.0),
            Err(IntervalError::InvalidDuration(_))
        ));
    }

    #[test]
    fn sort_orders_by_start_time() {
        let mut removals = vec![removal(5.0, 6.0), removal(1.0, 2.0), removal(3.0, 4.0)];
        sort_removals(&mut removals);
        let starts: Vec<f64> = removals.iter().map(|r| r.start_time).collect();
        assert_eq!(starts, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn removal_serializes_with_type_and_is_entire_keys() {
        let json = serde_json::to_value(RemovalInterval::new(1.0, 2.0, RemovalKind::FillerWord, false)).unwrap();
        assert_eq!(json["type"], "filler_word");
        assert_eq!(json["is_entire"], false);
    }
}
