use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::lease::LeaseOwner;
use super::status::{JobStatus, Stage};

/// Durable state of one job, stored as `<data_dir>/<job_id>/metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    /// Absolute path to the uploaded source media
    pub input_path: PathBuf,
    /// Source extension including the leading dot
    pub file_extension: String,
    pub status: JobStatus,
    pub is_processing: bool,
    /// Stage holding the single-flight flag, used to roll back after a crash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_stage: Option<Stage>,
    /// Process running the active stage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<LeaseOwner>,
    #[serde(default)]
    pub artifacts: Artifacts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StageFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<TrimSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job_id: impl Into<String>, input_path: PathBuf, file_extension: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            input_path,
            file_extension: file_extension.into(),
            status: JobStatus::Created,
            is_processing: false,
            active_stage: None,
            owner: None,
            artifacts: Artifacts::default(),
            last_error: None,
            summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the job has reached at least `status`.
    pub fn reached(&self, status: JobStatus) -> bool {
        self.status >= status
    }
}

/// Paths to what each stage produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sentence_analysis: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_analysis: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removals: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Why the last rollback happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl StageFailure {
    pub fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Outcome of a successful trim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrimSummary {
    pub original_duration: f64,
    pub final_duration: f64,
    pub keep_segments: usize,
    /// Cut tier that produced the output
    pub tier: String,
    pub removals_by_kind: BTreeMap<String, usize>,
}
