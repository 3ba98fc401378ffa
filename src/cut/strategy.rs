use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::interval::KeepInterval;

/// How a single keep interval is cut out of the source.
///
/// Every strategy re-encodes to the same intermediate codec so the clips can
/// be joined by a stream-copy concat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExtractStrategy {
    /// Short clip: accurate seek to the start and a fast re-encode.
    Precise,
    /// Coarse input seek to `coarse_start`, then a fine trim relative to it.
    KeyframeSeek { coarse_start: f64 },
    /// Seek straight to the target start and encode through to the end.
    DirectSeek,
}

#[derive(Debug, Clone, Copy)]
pub struct StrategyConfig {
    /// Clips shorter than this always use [`ExtractStrategy::Precise`].
    pub short_segment_secs: f64,
    /// Upper bound on how far before the target start a coarse seek may land.
    pub coarse_seek_secs: f64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            short_segment_secs: 2.0,
            coarse_seek_secs: 1.0,
        }
    }
}

/// Picks an [`ExtractStrategy`] per segment. Keyframe availability is decided
/// once for the whole source when the planner is built.
#[derive(Debug, Clone)]
pub struct SegmentPlanner {
    keyframes: Vec<f64>,
    config: StrategyConfig,
}

impl SegmentPlanner {
    pub fn new(mut keyframes: Vec<f64>, config: StrategyConfig) -> Self {
        keyframes.retain(|k| k.is_finite() && *k >= 0.0);
        keyframes.sort_by(f64::total_cmp);
        Self { keyframes, config }
    }

    pub fn keyframes_known(&self) -> bool {
        !self.keyframes.is_empty()
    }

    pub fn plan(&self, interval: &KeepInterval) -> ExtractStrategy {
        if interval.duration() < self.config.short_segment_secs {
            return ExtractStrategy::Precise;
        }
        if !self.keyframes_known() {
            return ExtractStrategy::DirectSeek;
        }
        ExtractStrategy::KeyframeSeek {
            coarse_start: self.coarse_start(interval.start),
        }
    }

    /// Latest keyframe at or before `start` when it sits within the coarse
    /// window, otherwise the window edge itself.
    fn coarse_start(&self, start: f64) -> f64 {
        let window_start = (start - self.config.coarse_seek_secs).max(0.0);
        let idx = self.keyframes.partition_point(|k| *k <= start);
        match idx.checked_sub(1).map(|i| self.keyframes[i]) {
            Some(keyframe) if keyframe >= window_start => keyframe,
            _ => window_start,
        }
    }
}

/// One unit of work for the extraction pool.
#[derive(Debug, Clone)]
pub struct SegmentJob {
    pub index: usize,
    pub interval: KeepInterval,
    pub strategy: ExtractStrategy,
    pub output: PathBuf,
}
