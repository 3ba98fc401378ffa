//! Front-end facing operations. Every call returns a [`Response`] envelope;
//! mapping it to HTTP or exit codes is the caller's job.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::ffmpeg::{Ffmpeg, MediaToolchain};
use crate::interval::{RemovalInterval, RemovalKind};
use crate::job::{JobManager, JobRecord, JobStatus, Stage};
use crate::processor::{self, Pipeline, PipelineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: ResponseStatus,
    pub job_id: Option<String>,
    pub current_stage: Option<JobStatus>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    pub fn success(record: &JobRecord, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Success,
            job_id: Some(record.job_id.clone()),
            current_stage: Some(record.status),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Error envelope, reporting the job's current status when it can be read.
    pub fn error(jobs: &JobManager, job_id: Option<&str>, message: impl Into<String>) -> Self {
        let current_stage = job_id.and_then(|id| jobs.get(id).ok()).map(|r| r.status);
        Self {
            status: ResponseStatus::Error,
            job_id: job_id.map(str::to_string),
            current_stage,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    fn for_job(mut self, job_id: &str) -> Self {
        self.job_id = Some(job_id.to_string());
        self
    }
}

/// A removal interval as submitted by a user. `type` defaults to manual.
#[derive(Debug, Clone, Deserialize)]
pub struct RemovalInput {
    #[serde(alias = "startTime")]
    pub start_time: f64,
    #[serde(alias = "endTime")]
    pub end_time: f64,
    #[serde(rename = "type", default)]
    pub kind: Option<RemovalKind>,
    #[serde(alias = "isEntire", default)]
    pub is_entire: Option<bool>,
}

impl From<RemovalInput> for RemovalInterval {
    fn from(input: RemovalInput) -> Self {
        RemovalInterval::new(
            input.start_time,
            input.end_time,
            input.kind.unwrap_or(RemovalKind::Manual),
            input.is_entire.unwrap_or(true),
        )
    }
}

pub fn check_ffmpeg(ffmpeg: &Ffmpeg) -> bool {
    match ffmpeg.check_available() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Media toolchain unavailable");
            false
        }
    }
}

/// Register a video and mark it uploaded.
pub fn upload(jobs: &JobManager, path: &Path) -> Response {
    let record = match jobs.create_job(path) {
        Ok(record) => record,
        Err(e) => return Response::error(jobs, None, format!("Upload rejected: {}", e)),
    };
    match jobs.advance(&record.job_id, JobStatus::Uploaded) {
        Ok(record) => Response::success(&record, "File uploaded successfully"),
        Err(e) => Response::error(jobs, Some(&record.job_id), format!("Upload failed: {}", e)),
    }
}

/// Start `stage` in the background and return as soon as it is accepted.
pub fn start_stage(pipeline: &Pipeline, job_id: &str, stage: Stage) -> Response {
    match pipeline.dispatch(job_id, stage) {
        Ok(_handle) => match pipeline.jobs().get(job_id) {
            Ok(record) => Response::success(&record, format!("{} started", stage)),
            Err(e) => Response::error(pipeline.jobs(), Some(job_id), e.to_string()),
        },
        Err(e) => stage_error(pipeline, job_id, stage, &e),
    }
}

/// Run `stage` and wait for it.
pub async fn run_stage(pipeline: &Pipeline, job_id: &str, stage: Stage) -> Response {
    match pipeline.run_stage(job_id, stage).await {
        Ok(record) => Response::success(&record, format!("{} complete", stage)),
        Err(e) => stage_error(pipeline, job_id, stage, &e),
    }
}

pub async fn transcribe(pipeline: &Pipeline, job_id: &str) -> Response {
    run_stage(pipeline, job_id, Stage::Transcribe).await
}

pub async fn analyze_sentences(pipeline: &Pipeline, job_id: &str) -> Response {
    run_stage(pipeline, job_id, Stage::SentenceAnalysis).await
}

pub async fn analyze_words(pipeline: &Pipeline, job_id: &str) -> Response {
    run_stage(pipeline, job_id, Stage::WordAnalysis).await
}

pub async fn merge(pipeline: &Pipeline, job_id: &str) -> Response {
    run_stage(pipeline, job_id, Stage::Merge).await
}

pub async fn trim(pipeline: &Pipeline, job_id: &str) -> Response {
    match pipeline.run_stage(job_id, Stage::Trim).await {
        Ok(record) => {
            let data = json!({
                "output_path": record.artifacts.output,
                "summary": record.summary,
            });
            Response::success(&record, "Video trimmed successfully").with_data(data)
        }
        Err(e) => stage_error(pipeline, job_id, Stage::Trim, &e),
    }
}

/// Resume a job from its last checkpoint and run it to completion.
pub async fn process_all(pipeline: &Pipeline, job_id: &str) -> Response {
    match pipeline.run_all(job_id).await {
        Ok(record) => {
            let data = json!({
                "output_path": record.artifacts.output,
                "summary": record.summary,
            });
            Response::success(&record, "Processing complete").with_data(data)
        }
        Err(e) => Response::error(pipeline.jobs(), Some(job_id), format!("Processing failed: {}", e)),
    }
}

pub fn get_status(jobs: &JobManager, job_id: &str) -> Response {
    match jobs.get(job_id) {
        Ok(record) => {
            let data = json!({
                "is_processing": record.is_processing,
                "last_error": record.last_error,
                "artifacts": record.artifacts,
                "summary": record.summary,
            });
            Response::success(&record, "Status fetched successfully").with_data(data)
        }
        Err(e) => Response::error(jobs, None, e.to_string()).for_job(job_id),
    }
}

pub fn get_transcript(jobs: &JobManager, job_id: &str) -> Response {
    let result = processor::load_transcript(jobs, job_id).and_then(|t| {
        let record = jobs.get(job_id)?;
        Ok((record, t))
    });
    match result {
        Ok((record, transcript)) => Response::success(&record, "Transcript fetched successfully")
            .with_data(json!({ "words": transcript.words })),
        Err(e) => Response::error(jobs, Some(job_id), format!("Error fetching transcript: {}", e)),
    }
}

pub fn get_removals(jobs: &JobManager, job_id: &str) -> Response {
    let result = processor::load_removals(jobs, job_id).and_then(|r| {
        let record = jobs.get(job_id)?;
        Ok((record, r))
    });
    match result {
        Ok((record, removals)) => Response::success(&record, "Removal intervals fetched successfully")
            .with_data(json!({ "data": removals })),
        Err(e) => Response::error(jobs, Some(job_id), format!("Error fetching removal intervals: {}", e)),
    }
}

pub fn override_removals(jobs: &JobManager, job_id: &str, intervals: Vec<RemovalInput>) -> Response {
    let removals: Vec<RemovalInterval> = intervals.into_iter().map(Into::into).collect();
    match processor::override_removals(jobs, job_id, removals) {
        Ok(record) => Response::success(&record, "Removal intervals updated successfully"),
        Err(e) => Response::error(jobs, Some(job_id), format!("Error updating removal intervals: {}", e)),
    }
}

fn stage_error(pipeline: &Pipeline, job_id: &str, stage: Stage, err: &PipelineError) -> Response {
    let prefix = if err.is_conflict() { "Rejected" } else { "Failed" };
    Response::error(pipeline.jobs(), Some(job_id), format!("{} {}: {}", prefix, stage, err))
}
