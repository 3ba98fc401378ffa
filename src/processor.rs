//! Pipeline coordinator: runs each stage of a job under the job's
//! single-flight lease and persists its artifact before advancing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, info, info_span, Instrument};

use crate::analysis::{self, AnalysisLevel, Analyzer};
use crate::cut::{TrimConfig, TrimError, TrimReport, Trimmer};
use crate::error::ServiceError;
use crate::ffmpeg::{Ffmpeg, MediaToolchain};
use crate::interval::{sort_removals, RemovalInterval};
use crate::job::{JobError, JobManager, JobRecord, JobStatus, Stage, StageLease, TrimSummary};
use crate::settings::Settings;
use crate::transcription::{self, Transcriber, Transcript};

const TRANSCRIPT_FILE: &str = "transcript.json";
const SENTENCE_ANALYSIS_FILE: &str = "sentence_analysis.json";
const WORD_ANALYSIS_FILE: &str = "word_analysis.json";
const REMOVALS_FILE: &str = "removals.json";
const MANUAL_REMOVALS_FILE: &str = "removals_manual.json";
const OUTPUT_STEM: &str = "trimmed";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Job(#[from] JobError),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Trim(#[from] TrimError),

    #[error("{0} is not available yet")]
    MissingArtifact(&'static str),

    #[error("invalid removal interval: {0}")]
    InvalidRemoval(String),

    #[error("stage task failed: {0}")]
    Task(String),
}

impl PipelineError {
    /// Rejected before any work started; the job is untouched.
    pub fn is_conflict(&self) -> bool {
        matches!(self, PipelineError::Job(e) if e.is_conflict())
    }
}

/// Stored shape of an analysis or merged removal list: `{"data": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemovalList {
    pub data: Vec<RemovalInterval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl RemovalList {
    fn new(data: Vec<RemovalInterval>) -> Self {
        Self {
            data,
            raw_response: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub transcription_timeout: Duration,
    pub analysis_timeout: Duration,
    pub start_offset_secs: f64,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl PipelineOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            transcription_timeout: Duration::from_secs(settings.transcription.timeout_secs.max(1)),
            analysis_timeout: Duration::from_secs(settings.analysis.timeout_secs.max(1)),
            start_offset_secs: settings.analysis.start_offset_secs,
        }
    }
}

/// Result delivered on a [`StageHandle`].
pub type StageOutcome = Result<JobRecord, PipelineError>;

/// A stage running in the background. Await [`StageHandle::wait`] for its outcome.
#[derive(Debug)]
pub struct StageHandle {
    job_id: String,
    stage: Stage,
    rx: oneshot::Receiver<StageOutcome>,
}

impl StageHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub async fn wait(self) -> StageOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(PipelineError::Task(format!("{} task ended without a result", self.stage))))
    }
}

/// What a finished stage hands back to be recorded on the job.
enum StageOutput {
    Nothing,
    Transcript(PathBuf),
    SentenceAnalysis(PathBuf),
    WordAnalysis(PathBuf),
    Removals(PathBuf),
    Trimmed { output: PathBuf, summary: TrimSummary },
}

impl StageOutput {
    fn apply(self, record: &mut JobRecord) {
        match self {
            StageOutput::Nothing => {}
            StageOutput::Transcript(path) => record.artifacts.transcript = Some(path),
            StageOutput::SentenceAnalysis(path) => record.artifacts.sentence_analysis = Some(path),
            StageOutput::WordAnalysis(path) => record.artifacts.word_analysis = Some(path),
            StageOutput::Removals(path) => record.artifacts.removals = Some(path),
            StageOutput::Trimmed { output, summary } => {
                record.artifacts.output = Some(output);
                record.summary = Some(summary);
            }
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    jobs: JobManager,
    transcriber: Arc<dyn Transcriber>,
    analyzer: Arc<dyn Analyzer>,
    trimmer: Arc<Trimmer>,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(
        jobs: JobManager,
        transcriber: Arc<dyn Transcriber>,
        analyzer: Arc<dyn Analyzer>,
        trimmer: Trimmer,
        options: PipelineOptions,
    ) -> Self {
        Self {
            jobs,
            transcriber,
            analyzer,
            trimmer: Arc::new(trimmer),
            options,
        }
    }

    /// Build the pipeline from settings and recover jobs left mid-stage by a
    /// previous process.
    pub fn start(settings: &Settings) -> anyhow::Result<Self> {
        let jobs = JobManager::open(&settings.general.data_dir)?;
        let transcriber = transcription::build_transcriber(&settings.transcription, &settings.trim)?;
        let analyzer = analysis::build_analyzer(&settings.analysis)?;
        let toolchain: Arc<dyn MediaToolchain> = Arc::new(Ffmpeg::from_settings(&settings.trim));
        let trimmer = Trimmer::new(toolchain, TrimConfig::from_settings(&settings.trim));

        let pipeline = Self::new(jobs, transcriber, analyzer, trimmer, PipelineOptions::from_settings(settings));
        let recovered = pipeline.recover_interrupted()?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted jobs");
        }
        Ok(pipeline)
    }

    pub fn jobs(&self) -> &JobManager {
        &self.jobs
    }

    pub fn recover_interrupted(&self) -> Result<Vec<JobRecord>, PipelineError> {
        Ok(self.jobs.recover_interrupted()?)
    }

    /// Check preconditions now, then run `stage` on the runtime.
    ///
    /// A busy job or one at the wrong checkpoint is rejected here, before
    /// anything is spawned.
    pub fn dispatch(&self, job_id: &str, stage: Stage) -> Result<StageHandle, PipelineError> {
        let lease = self.jobs.begin(job_id, stage)?;
        let (tx, rx) = oneshot::channel();
        let pipeline = self.clone();
        let span = info_span!("stage", job_id = %job_id, stage = %stage);
        tokio::spawn(
            async move {
                let outcome = pipeline.execute(lease).await;
                let _ = tx.send(outcome);
            }
            .instrument(span),
        );
        Ok(StageHandle {
            job_id: job_id.to_string(),
            stage,
            rx,
        })
    }

    /// Run one stage to completion.
    pub async fn run_stage(&self, job_id: &str, stage: Stage) -> StageOutcome {
        let lease = self.jobs.begin(job_id, stage)?;
        self.execute(lease)
            .instrument(info_span!("stage", job_id = %job_id, stage = %stage))
            .await
    }

    /// Drive a job from its last persisted checkpoint to completion, skipping
    /// stages that already finished.
    pub async fn run_all(&self, job_id: &str) -> StageOutcome {
        loop {
            let record = self.jobs.get(job_id)?;
            if record.status.is_terminal() {
                return Ok(record);
            }
            let stage = Stage::next_for(record.status).ok_or_else(|| JobError::Conflict {
                job_id: job_id.to_string(),
                reason: format!("no stage can resume from {}", record.status),
            })?;
            self.run_stage(job_id, stage).await?;
        }
    }

    async fn execute(&self, lease: StageLease) -> StageOutcome {
        let stage = lease.stage();
        let record = match self.jobs.get(lease.job_id()) {
            Ok(record) => record,
            Err(e) => {
                // Dropping the lease rolls the job back.
                return Err(e.into());
            }
        };

        match self.perform(stage, &record).await {
            Ok(output) => Ok(lease.complete(|r| output.apply(r))?),
            Err(e) => {
                if let Err(rollback) = lease.fail(e.to_string()) {
                    error!(error = %rollback, "Could not record stage failure");
                }
                Err(e)
            }
        }
    }

    async fn perform(&self, stage: Stage, record: &JobRecord) -> Result<StageOutput, PipelineError> {
        match stage {
            Stage::Upload => Ok(StageOutput::Nothing),
            Stage::Transcribe => self.transcribe(record).await,
            Stage::SentenceAnalysis => self.analyze_sentences(record).await,
            Stage::WordAnalysis => self.analyze_words(record).await,
            Stage::Merge => self.merge(record),
            Stage::Trim => self.trim(record).await,
        }
    }

    async fn transcribe(&self, record: &JobRecord) -> Result<StageOutput, PipelineError> {
        let timeout = self.options.transcription_timeout;
        info!(provider = self.transcriber.name(), "Transcribing");
        let transcript = tokio::time::timeout(timeout, self.transcriber.transcribe(&record.input_path))
            .await
            .map_err(|_| ServiceError::Timeout {
                what: "transcription",
                secs: timeout.as_secs(),
            })??;
        if transcript.words.is_empty() {
            return Err(ServiceError::Empty {
                provider: self.transcriber.name(),
            }
            .into());
        }
        info!(
            words = transcript.words.len(),
            sentences = transcript.sentences.len(),
            "Transcript saved"
        );
        let path = self
            .jobs
            .store()
            .write_artifact(&record.job_id, TRANSCRIPT_FILE, &transcript)?;
        Ok(StageOutput::Transcript(path))
    }

    async fn analyze_sentences(&self, record: &JobRecord) -> Result<StageOutput, PipelineError> {
        let transcript = self.load_transcript(record)?;
        let text = analysis::format_sentences(&transcript);
        let list = self.analyze(AnalysisLevel::Sentence, &text).await?;
        info!(
            removals = list.data.len(),
            partial = list.data.iter().filter(|r| !r.is_entire_segment).count(),
            "Sentence analysis saved"
        );
        let path = self
            .jobs
            .store()
            .write_artifact(&record.job_id, SENTENCE_ANALYSIS_FILE, &list)?;
        Ok(StageOutput::SentenceAnalysis(path))
    }

    async fn analyze_words(&self, record: &JobRecord) -> Result<StageOutput, PipelineError> {
        let transcript = self.load_transcript(record)?;
        let sentences = self.load_list(record, record.artifacts.sentence_analysis.as_ref(), "sentence analysis")?;
        let text = analysis::format_words(&transcript, &sentences.data);
        let list = self.analyze(AnalysisLevel::Word, &text).await?;
        info!(removals = list.data.len(), "Word analysis saved");
        let path = self
            .jobs
            .store()
            .write_artifact(&record.job_id, WORD_ANALYSIS_FILE, &list)?;
        Ok(StageOutput::WordAnalysis(path))
    }

    /// Ask the analyzer about `text`; an empty transcript skips the call.
    async fn analyze(&self, level: AnalysisLevel, text: &str) -> Result<RemovalList, PipelineError> {
        if text.trim().is_empty() {
            info!(%level, "Nothing to analyze, recording empty result");
            return Ok(RemovalList::default());
        }
        let timeout = self.options.analysis_timeout;
        let raw = tokio::time::timeout(timeout, self.analyzer.analyze(level, text))
            .await
            .map_err(|_| ServiceError::Timeout {
                what: "analysis",
                secs: timeout.as_secs(),
            })??;
        let data = analysis::parse_analysis_response(&raw, level, self.options.start_offset_secs)?;
        Ok(RemovalList {
            data,
            raw_response: Some(raw),
        })
    }

    fn merge(&self, record: &JobRecord) -> Result<StageOutput, PipelineError> {
        let sentences = self.load_list(record, record.artifacts.sentence_analysis.as_ref(), "sentence analysis")?;
        let words = self.load_list(record, record.artifacts.word_analysis.as_ref(), "word analysis")?;
        let merged = merge_removals(&sentences.data, &words.data);
        info!(removals = merged.len(), "Removal list merged");
        let path = self
            .jobs
            .store()
            .write_artifact(&record.job_id, REMOVALS_FILE, &RemovalList::new(merged))?;
        Ok(StageOutput::Removals(path))
    }

    async fn trim(&self, record: &JobRecord) -> Result<StageOutput, PipelineError> {
        let removals = self.load_list(record, record.artifacts.removals.as_ref(), "removal list")?.data;
        let output = self
            .jobs
            .store()
            .job_dir(&record.job_id)
            .join(format!("{}{}", OUTPUT_STEM, record.file_extension));

        let trimmer = self.trimmer.clone();
        let source = record.input_path.clone();
        let target = output.clone();
        let cut = removals.clone();
        let report = tokio::task::spawn_blocking(move || trimmer.trim(&source, &cut, &target))
            .await
            .map_err(|e| PipelineError::Task(e.to_string()))??;

        Ok(StageOutput::Trimmed {
            summary: summarize(&report, &removals),
            output,
        })
    }

    fn load_transcript(&self, record: &JobRecord) -> Result<Transcript, PipelineError> {
        let path = record
            .artifacts
            .transcript
            .as_ref()
            .ok_or(PipelineError::MissingArtifact("transcript"))?;
        Ok(self.jobs.store().read_artifact(&record.job_id, path)?)
    }

    fn load_list(
        &self,
        record: &JobRecord,
        path: Option<&PathBuf>,
        what: &'static str,
    ) -> Result<RemovalList, PipelineError> {
        let path = path.ok_or(PipelineError::MissingArtifact(what))?;
        Ok(self.jobs.store().read_artifact(&record.job_id, path)?)
    }

    /// Word-level transcript, once transcription has completed.
    pub fn transcript(&self, job_id: &str) -> Result<Transcript, PipelineError> {
        load_transcript(&self.jobs, job_id)
    }

    pub fn removals(&self, job_id: &str) -> Result<Vec<RemovalInterval>, PipelineError> {
        load_removals(&self.jobs, job_id)
    }
}

/// Entire-sentence removals plus every word-level refinement, sorted by start.
pub fn merge_removals(sentences: &[RemovalInterval], words: &[RemovalInterval]) -> Vec<RemovalInterval> {
    let mut merged: Vec<RemovalInterval> = sentences
        .iter()
        .filter(|r| r.is_entire_segment)
        .chain(words.iter())
        .cloned()
        .collect();
    sort_removals(&mut merged);
    merged
}

fn summarize(report: &TrimReport, removals: &[RemovalInterval]) -> TrimSummary {
    let mut removals_by_kind = BTreeMap::new();
    for removal in removals {
        *removals_by_kind.entry(removal.kind.as_str().to_string()).or_insert(0) += 1;
    }
    TrimSummary {
        original_duration: report.original_duration,
        final_duration: report.kept_duration,
        keep_segments: report.keep_segments,
        tier: report.tier.to_string(),
        removals_by_kind,
    }
}

pub fn load_transcript(jobs: &JobManager, job_id: &str) -> Result<Transcript, PipelineError> {
    let record = jobs.get(job_id)?;
    if !record.reached(JobStatus::TranscriptionComplete) {
        return Err(PipelineError::MissingArtifact("transcript"));
    }
    let path = record
        .artifacts
        .transcript
        .as_ref()
        .ok_or(PipelineError::MissingArtifact("transcript"))?;
    Ok(jobs.store().read_artifact(job_id, path)?)
}

pub fn load_removals(jobs: &JobManager, job_id: &str) -> Result<Vec<RemovalInterval>, PipelineError> {
    let record = jobs.get(job_id)?;
    if !record.reached(JobStatus::InvalidSegmentsReady) {
        return Err(PipelineError::MissingArtifact("removal list"));
    }
    let path = record
        .artifacts
        .removals
        .as_ref()
        .ok_or(PipelineError::MissingArtifact("removal list"))?;
    let list: RemovalList = jobs.store().read_artifact(job_id, path)?;
    Ok(list.data)
}

/// Replace a job's removal list by hand and make it ready to trim.
///
/// Allowed from a finished transcript up to `InvalidSegmentsReady`; a job that
/// has started or finished trimming is rejected.
pub fn override_removals(
    jobs: &JobManager,
    job_id: &str,
    mut removals: Vec<RemovalInterval>,
) -> Result<JobRecord, PipelineError> {
    for r in &removals {
        if !(r.start_time >= 0.0) || !(r.end_time > r.start_time) {
            return Err(PipelineError::InvalidRemoval(format!(
                "[{}, {}] must satisfy 0 <= start < end",
                r.start_time, r.end_time
            )));
        }
    }
    sort_removals(&mut removals);

    let store = jobs.store();
    let record = jobs.set_checkpoint(
        job_id,
        JobStatus::TranscriptionComplete..=JobStatus::InvalidSegmentsReady,
        JobStatus::InvalidSegmentsReady,
        move |r| {
            let path = store.write_artifact(job_id, MANUAL_REMOVALS_FILE, &RemovalList::new(removals))?;
            r.artifacts.removals = Some(path);
            r.last_error = None;
            Ok(())
        },
    )?;
    info!(job_id = %job_id, "Removal list overridden");
    Ok(record)
}
