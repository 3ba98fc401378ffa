//! Cut orchestration: parallel segment extraction, ordered concatenation and
//! the fallback cascade used when that primary path fails.

mod strategy;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use strategy::{ExtractStrategy, SegmentJob, SegmentPlanner, StrategyConfig};

use crate::ffmpeg::{MediaError, MediaToolchain};
use crate::interval::{
    compute_keep_intervals, kept_duration, sort_removals, IntervalError, KeepInterval,
    RemovalInterval,
};
use crate::settings::TrimSettings;

/// One way of producing the output file, tried in [`Tier::CASCADE`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Parallel per-segment extraction followed by a stream-copy concat.
    Primary,
    /// One stream-copy cut straight from the source.
    SingleCut,
    /// One invocation that trims and re-joins every segment in a filter graph.
    FilterGraph,
}

impl Tier {
    pub const CASCADE: [Tier; 3] = [Tier::Primary, Tier::SingleCut, Tier::FilterGraph];

    /// Whether this tier can handle a job with `keep_count` segments.
    pub fn applicable(&self, keep_count: usize) -> bool {
        match self {
            Tier::Primary => keep_count >= 1,
            Tier::SingleCut => keep_count == 1,
            Tier::FilterGraph => keep_count >= 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::SingleCut => "single_cut",
            Tier::FilterGraph => "filter_graph",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tool-level failure within one tier.
#[derive(Debug, Error)]
pub enum CutError {
    #[error("segment {index} extraction failed: {source}")]
    Extraction { index: usize, source: MediaError },

    #[error("could not start extraction pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("concatenation failed: {0}")]
    Concatenation(MediaError),

    #[error("render failed: {0}")]
    Render(MediaError),

    #[error("workspace IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct TierFailure {
    pub tier: Tier,
    pub error: CutError,
}

#[derive(Debug, Error)]
pub enum TrimError {
    #[error("source media not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("media toolchain unavailable: {0}")]
    Toolchain(MediaError),

    #[error("could not probe source: {0}")]
    Probe(MediaError),

    #[error(transparent)]
    NoKeepSegments(#[from] IntervalError),

    #[error("trim workspace error: {0}")]
    Workspace(std::io::Error),

    #[error("all cut strategies failed, last tier {tier}: {cause}")]
    Exhausted {
        tier: Tier,
        cause: String,
        attempts: Vec<TierFailure>,
    },
}

impl TrimError {
    /// The last tier attempted, when the failure came from the cascade.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            TrimError::Exhausted { tier, .. } => Some(*tier),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TrimConfig {
    pub strategy: StrategyConfig,
    /// Extraction pool size; `None` uses available parallelism.
    pub max_workers: Option<usize>,
}

impl TrimConfig {
    pub fn from_settings(settings: &TrimSettings) -> Self {
        Self {
            strategy: StrategyConfig {
                short_segment_secs: settings.short_segment_secs,
                coarse_seek_secs: settings.coarse_seek_secs,
            },
            max_workers: settings.max_workers.filter(|n| *n > 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimReport {
    pub output_path: PathBuf,
    pub tier: Tier,
    pub original_duration: f64,
    pub kept_duration: f64,
    pub keep_segments: usize,
    pub keyframes_known: bool,
}

pub struct Trimmer {
    toolchain: Arc<dyn MediaToolchain>,
    config: TrimConfig,
}

impl Trimmer {
    pub fn new(toolchain: Arc<dyn MediaToolchain>, config: TrimConfig) -> Self {
        Self { toolchain, config }
    }

    /// Cut `removals` out of `source` and write the result to `output`.
    ///
    /// `output` is only created once a tier has fully succeeded. All
    /// intermediates live in a private workspace that is removed on return.
    pub fn trim(
        &self,
        source: &Path,
        removals: &[RemovalInterval],
        output: &Path,
    ) -> Result<TrimReport, TrimError> {
        if !source.is_file() {
            return Err(TrimError::SourceMissing(source.to_path_buf()));
        }
        self.toolchain
            .check_available()
            .map_err(TrimError::Toolchain)?;

        let mut removals = removals.to_vec();
        sort_removals(&mut removals);

        let duration = self
            .toolchain
            .probe_duration(source)
            .map_err(TrimError::Probe)?;
        let keeps = compute_keep_intervals(&removals, duration)?;

        let keyframes = self.toolchain.probe_keyframes(source).unwrap_or_else(|e| {
            warn!(error = %e, "Keyframe probe failed, seeking without keyframes");
            Vec::new()
        });
        let planner = SegmentPlanner::new(keyframes, self.config.strategy);

        info!(
            source = %source.display(),
            duration,
            segments = keeps.len(),
            removals = removals.len(),
            keyframes_known = planner.keyframes_known(),
            "Starting trim"
        );

        let parent = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent).map_err(TrimError::Workspace)?;
        let workspace = tempfile::Builder::new()
            .prefix(".autotrim-")
            .tempdir_in(&parent)
            .map_err(TrimError::Workspace)?;

        let extension = output
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let staged = workspace.path().join(format!("output.{}", extension));

        let mut attempts: Vec<TierFailure> = Vec::new();
        for tier in Tier::CASCADE {
            if !tier.applicable(keeps.len()) {
                continue;
            }
            debug!(%tier, "Attempting cut tier");
            match self.run_tier(tier, source, &keeps, &planner, workspace.path(), &staged) {
                Ok(()) => {
                    move_into_place(&staged, output).map_err(TrimError::Workspace)?;
                    info!(%tier, output = %output.display(), "Trim complete");
                    return Ok(TrimReport {
                        output_path: output.to_path_buf(),
                        tier,
                        original_duration: duration,
                        kept_duration: kept_duration(&keeps),
                        keep_segments: keeps.len(),
                        keyframes_known: planner.keyframes_known(),
                    });
                }
                Err(error) => {
                    warn!(%tier, error = %error, "Cut tier failed");
                    let _ = std::fs::remove_file(&staged);
                    attempts.push(TierFailure { tier, error });
                }
            }
        }

        match attempts.last() {
            Some(last) => Err(TrimError::Exhausted {
                tier: last.tier,
                cause: last.error.to_string(),
                attempts,
            }),
            // Primary applies to any non-empty keep list.
            None => Err(TrimError::NoKeepSegments(IntervalError::NothingToKeep {
                duration,
            })),
        }
    }

    fn run_tier(
        &self,
        tier: Tier,
        source: &Path,
        keeps: &[KeepInterval],
        planner: &SegmentPlanner,
        workspace: &Path,
        staged: &Path,
    ) -> Result<(), CutError> {
        match tier {
            Tier::Primary => {
                let segments_dir = workspace.join("segments");
                std::fs::create_dir_all(&segments_dir)?;
                let jobs: Vec<SegmentJob> = keeps
                    .iter()
                    .enumerate()
                    .map(|(index, interval)| SegmentJob {
                        index,
                        interval: *interval,
                        strategy: planner.plan(interval),
                        output: segments_dir.join(format!("segment_{:04}.mp4", index)),
                    })
                    .collect();
                let clips = self.extract_all(source, &jobs)?;
                self.toolchain
                    .concat(&clips, staged)
                    .map_err(CutError::Concatenation)
            }
            Tier::SingleCut => self
                .toolchain
                .cut_single(source, &keeps[0], staged)
                .map_err(CutError::Render),
            Tier::FilterGraph => self
                .toolchain
                .trim_and_join(source, keeps, staged)
                .map_err(CutError::Render),
        }
    }

    /// Extract every job on a bounded pool and return the clip paths in
    /// timeline order. The first failure stops the pool from starting more
    /// segments.
    fn extract_all(&self, source: &Path, jobs: &[SegmentJob]) -> Result<Vec<PathBuf>, CutError> {
        let workers = self.worker_count(jobs.len());
        debug!(workers, segments = jobs.len(), "Extracting segments");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("autotrim-extract-{}", i))
            .build()?;

        pool.install(|| {
            jobs.par_iter()
                .map(|job| {
                    self.toolchain
                        .extract_clip(source, &job.interval, &job.strategy, &job.output)
                        .map(|()| job.output.clone())
                        .map_err(|e| CutError::Extraction {
                            index: job.index,
                            source: e,
                        })
                })
                .collect()
        })
    }

    /// Pool size: the configured worker count, else the host's parallelism,
    /// never more than there are segments.
    fn worker_count(&self, segments: usize) -> usize {
        self.config
            .max_workers
            .unwrap_or_else(rayon::current_num_threads)
            .min(segments)
            .max(1)
    }
}

/// Rename into place, falling back to copy when the rename crosses filesystems.
fn move_into_place(staged: &Path, output: &Path) -> std::io::Result<()> {
    if std::fs::rename(staged, output).is_err() {
        std::fs::copy(staged, output)?;
        let _ = std::fs::remove_file(staged);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interval::RemovalKind;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeToolchain {
        duration: f64,
        keyframes: Vec<f64>,
        fail_extract_at: Option<f64>,
        fail_cut_single: bool,
        fail_trim_join: bool,
        calls: Mutex<Vec<&'static str>>,
        clips: Mutex<Vec<PathBuf>>,
        concat_input: Mutex<Vec<PathBuf>>,
        reverse_gate: Option<ReverseGate>,
    }

    /// Holds each segment back until every later segment has finished, so
    /// extraction completes in reverse timeline order.
    struct ReverseGate {
        starts: Vec<f64>,
        finished: Mutex<Vec<f64>>,
        changed: Condvar,
    }

    impl ReverseGate {
        fn new(starts: Vec<f64>) -> Self {
            Self {
                starts,
                finished: Mutex::new(Vec::new()),
                changed: Condvar::new(),
            }
        }

        fn wait_for_later(&self, start: f64) {
            let later = self.starts.iter().filter(|s| **s > start).count();
            let finished = self.finished.lock().unwrap();
            let (mut finished, timeout) = self
                .changed
                .wait_timeout_while(finished, Duration::from_secs(5), |f| {
                    f.iter().filter(|s| **s > start).count() < later
                })
                .unwrap();
            assert!(!timeout.timed_out(), "segment at {} never released", start);
            finished.push(start);
            self.changed.notify_all();
        }

        fn completion_order(&self) -> Vec<f64> {
            self.finished.lock().unwrap().clone()
        }
    }

    impl FakeToolchain {
        fn with_duration(duration: f64) -> Self {
            Self {
                duration,
                ..Default::default()
            }
        }

        fn called(&self, name: &str) -> bool {
            self.calls.lock().unwrap().iter().any(|c| *c == name)
        }
    }

    impl MediaToolchain for FakeToolchain {
        fn probe_duration(&self, _path: &Path) -> Result<f64, MediaError> {
            self.calls.lock().unwrap().push("probe_duration");
            Ok(self.duration)
        }

        fn probe_keyframes(&self, _path: &Path) -> Result<Vec<f64>, MediaError> {
            Ok(self.keyframes.clone())
        }

        fn extract_clip(
            &self,
            _source: &Path,
            interval: &KeepInterval,
            _strategy: &ExtractStrategy,
            output: &Path,
        ) -> Result<(), MediaError> {
            self.calls.lock().unwrap().push("extract_clip");
            if let Some(gate) = &self.reverse_gate {
                gate.wait_for_later(interval.start);
            }
            if self.fail_extract_at == Some(interval.start) {
                return Err(MediaError::tool_failed("ffmpeg", "boom", Some(1)));
            }
            std::fs::write(output, b"clip")?;
            self.clips.lock().unwrap().push(output.to_path_buf());
            Ok(())
        }

        fn concat(&self, clips: &[PathBuf], output: &Path) -> Result<(), MediaError> {
            self.calls.lock().unwrap().push("concat");
            *self.concat_input.lock().unwrap() = clips.to_vec();
            std::fs::write(output, b"joined")?;
            Ok(())
        }

        fn cut_single(&self, _source: &Path, _interval: &KeepInterval, output: &Path) -> Result<(), MediaError> {
            self.calls.lock().unwrap().push("cut_single");
            if self.fail_cut_single {
                return Err(MediaError::tool_failed("ffmpeg", "cut failed", Some(1)));
            }
            std::fs::write(output, b"single")?;
            Ok(())
        }

        fn trim_and_join(&self, _source: &Path, _keeps: &[KeepInterval], output: &Path) -> Result<(), MediaError> {
            self.calls.lock().unwrap().push("trim_and_join");
            // Leave a partial file behind to check it never reaches the output path.
            std::fs::write(output, b"partial")?;
            if self.fail_trim_join {
                return Err(MediaError::tool_failed("ffmpeg", "graph failed", Some(1)));
            }
            Ok(())
        }
    }

    fn removal(start: f64, end: f64) -> RemovalInterval {
        RemovalInterval::new(start, end, RemovalKind::Repetition, true)
    }

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.mp4");
        std::fs::write(&source, b"source").unwrap();
        let output = dir.path().join("out").join("trimmed.mp4");
        (dir, source, output)
    }

    fn trimmer(fake: &Arc<FakeToolchain>) -> Trimmer {
        Trimmer::new(fake.clone(), TrimConfig::default())
    }

    #[test]
    fn primary_path_concats_in_timeline_order() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain {
            reverse_gate: Some(ReverseGate::new(vec![0.0, 8.0, 18.0, 28.0])),
            ..FakeToolchain::with_duration(40.0)
        });
        let removals: Vec<_> = (0..3).map(|i| removal(i as f64 * 10.0 + 5.0, i as f64 * 10.0 + 8.0)).collect();
        let config = TrimConfig {
            max_workers: Some(4),
            ..TrimConfig::default()
        };
        let trimmer = Trimmer::new(fake.clone(), config);
        assert_eq!(trimmer.worker_count(4), 4);

        let report = trimmer.trim(&source, &removals, &output).unwrap();

        assert_eq!(report.tier, Tier::Primary);
        assert_eq!(report.keep_segments, 4);
        assert!((report.kept_duration - 31.0).abs() < 1e-9);
        let gate = fake.reverse_gate.as_ref().unwrap();
        assert_eq!(gate.completion_order(), vec![28.0, 18.0, 8.0, 0.0]);
        let names: Vec<String> = fake
            .concat_input
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        let expected: Vec<String> = (0..4).map(|i| format!("segment_{:04}.mp4", i)).collect();
        assert_eq!(names, expected);
        assert_eq!(std::fs::read(&output).unwrap(), b"joined");
    }

    #[test]
    fn worker_count_is_bounded_by_segments() {
        let fake = Arc::new(FakeToolchain::with_duration(10.0));
        let config = TrimConfig {
            max_workers: Some(8),
            ..TrimConfig::default()
        };
        let trimmer = Trimmer::new(fake.clone(), config);
        assert_eq!(trimmer.worker_count(3), 3);
        assert_eq!(trimmer.worker_count(0), 1);
        assert!(Trimmer::new(fake, TrimConfig::default()).worker_count(64) >= 1);
    }

    #[test]
    fn unsorted_removals_are_sorted_before_derivation() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain::with_duration(10.0));
        let removals = [removal(6.0, 8.0), removal(1.0, 2.0)];

        let report = trimmer(&fake).trim(&source, &removals, &output).unwrap();
        assert_eq!(report.keep_segments, 3);
    }

    #[test]
    fn single_keep_failure_falls_back_to_single_cut() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain {
            fail_extract_at: Some(0.0),
            ..FakeToolchain::with_duration(10.0)
        });

        let report = trimmer(&fake).trim(&source, &[removal(5.0, 10.0)], &output).unwrap();

        assert_eq!(report.tier, Tier::SingleCut);
        assert!(!fake.called("concat"));
        assert!(!fake.called("trim_and_join"));
        assert_eq!(std::fs::read(&output).unwrap(), b"single");
    }

    #[test]
    fn multi_keep_failure_falls_back_to_filter_graph() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain {
            fail_extract_at: Some(6.0),
            ..FakeToolchain::with_duration(10.0)
        });

        let report = trimmer(&fake).trim(&source, &[removal(3.0, 6.0)], &output).unwrap();

        assert_eq!(report.tier, Tier::FilterGraph);
        assert!(!fake.called("cut_single"));
        assert!(!fake.called("concat"));
    }

    #[test]
    fn exhausted_cascade_leaves_no_output() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain {
            fail_extract_at: Some(0.0),
            fail_trim_join: true,
            ..FakeToolchain::with_duration(10.0)
        });

        let err = trimmer(&fake).trim(&source, &[removal(3.0, 6.0)], &output).unwrap_err();

        match &err {
            TrimError::Exhausted { tier, attempts, .. } => {
                assert_eq!(*tier, Tier::FilterGraph);
                let tiers: Vec<Tier> = attempts.iter().map(|a| a.tier).collect();
                assert_eq!(tiers, vec![Tier::Primary, Tier::FilterGraph]);
                assert!(matches!(attempts[0].error, CutError::Extraction { index: 0, .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.tier(), Some(Tier::FilterGraph));
        assert!(!output.exists());
    }

    #[test]
    fn nothing_to_keep_aborts_before_any_cut() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain::with_duration(10.0));

        let err = trimmer(&fake).trim(&source, &[removal(0.0, 10.0)], &output).unwrap_err();

        assert!(matches!(err, TrimError::NoKeepSegments(IntervalError::NothingToKeep { .. })));
        assert!(!fake.called("extract_clip"));
        assert!(!fake.called("cut_single"));
        assert!(!fake.called("trim_and_join"));
        assert!(!output.exists());
    }

    #[test]
    fn workspace_is_removed_on_success_and_failure() {
        let (_dir, source, output) = setup();
        let fake = Arc::new(FakeToolchain::with_duration(10.0));
        trimmer(&fake).trim(&source, &[removal(3.0, 6.0)], &output).unwrap();
        let clip = fake.clips.lock().unwrap()[0].clone();
        assert!(!clip.parent().unwrap().parent().unwrap().exists());

        let failing = Arc::new(FakeToolchain {
            fail_extract_at: Some(6.0),
            fail_trim_join: true,
            ..FakeToolchain::with_duration(10.0)
        });
        let _ = trimmer(&failing).trim(&source, &[removal(3.0, 6.0)], &output);
        let leftovers: Vec<_> = std::fs::read_dir(output.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".autotrim-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn missing_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeToolchain::with_duration(10.0));
        let err = trimmer(&fake)
            .trim(&dir.path().join("nope.mp4"), &[], &dir.path().join("out.mp4"))
            .unwrap_err();
        assert!(matches!(err, TrimError::SourceMissing(_)));
        assert!(!fake.called("probe_duration"));
    }

    #[test]
    fn tier_applicability() {
        assert!(Tier::Primary.applicable(1));
        assert!(Tier::SingleCut.applicable(1));
        assert!(!Tier::SingleCut.applicable(2));
        assert!(!Tier::FilterGraph.applicable(1));
        assert!(Tier::FilterGraph.applicable(3));
    }
}
