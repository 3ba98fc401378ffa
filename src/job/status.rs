use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job. Ordering follows [`JobStatus::rank`] only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Created,
    Uploaded,
    TranscriptionStarted,
    TranscriptionComplete,
    SentenceAnalysisStarted,
    SentenceAnalysisComplete,
    WordAnalysisStarted,
    WordAnalysisComplete,
    InvalidSegmentsReady,
    TrimStarted,
    Completed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 11] = [
        JobStatus::Created,
        JobStatus::Uploaded,
        JobStatus::TranscriptionStarted,
        JobStatus::TranscriptionComplete,
        JobStatus::SentenceAnalysisStarted,
        JobStatus::SentenceAnalysisComplete,
        JobStatus::WordAnalysisStarted,
        JobStatus::WordAnalysisComplete,
        JobStatus::InvalidSegmentsReady,
        JobStatus::TrimStarted,
        JobStatus::Completed,
    ];

    pub fn rank(&self) -> u8 {
        match self {
            JobStatus::Created => 1,
            JobStatus::Uploaded => 2,
            JobStatus::TranscriptionStarted => 3,
            JobStatus::TranscriptionComplete => 4,
            JobStatus::SentenceAnalysisStarted => 5,
            JobStatus::SentenceAnalysisComplete => 6,
            JobStatus::WordAnalysisStarted => 7,
            JobStatus::WordAnalysisComplete => 8,
            JobStatus::InvalidSegmentsReady => 9,
            JobStatus::TrimStarted => 10,
            JobStatus::Completed => 11,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Uploaded => "uploaded",
            JobStatus::TranscriptionStarted => "transcription_started",
            JobStatus::TranscriptionComplete => "transcription_complete",
            JobStatus::SentenceAnalysisStarted => "sentence_analysis_started",
            JobStatus::SentenceAnalysisComplete => "sentence_analysis_complete",
            JobStatus::WordAnalysisStarted => "word_analysis_started",
            JobStatus::WordAnalysisComplete => "word_analysis_complete",
            JobStatus::InvalidSegmentsReady => "invalid_segments_ready",
            JobStatus::TrimStarted => "trim_started",
            JobStatus::Completed => "completed",
        }
    }

    /// The status one rank above this one, if any.
    pub fn next(&self) -> Option<JobStatus> {
        let rank = self.rank();
        Self::ALL.into_iter().find(|s| s.rank() == rank + 1)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

impl PartialOrd for JobStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for JobStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("No matching status for: {}", s))
    }
}

/// A unit of pipeline work and the statuses it moves a job through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Upload,
    Transcribe,
    SentenceAnalysis,
    WordAnalysis,
    Merge,
    Trim,
}

impl Stage {
    pub const PIPELINE: [Stage; 6] = [
        Stage::Upload,
        Stage::Transcribe,
        Stage::SentenceAnalysis,
        Stage::WordAnalysis,
        Stage::Merge,
        Stage::Trim,
    ];

    /// The exact status a job must be at to enter this stage. This is also
    /// the checkpoint a failed run rolls back to.
    pub fn required(&self) -> JobStatus {
        match self {
            Stage::Upload => JobStatus::Created,
            Stage::Transcribe => JobStatus::Uploaded,
            Stage::SentenceAnalysis => JobStatus::TranscriptionComplete,
            Stage::WordAnalysis => JobStatus::SentenceAnalysisComplete,
            Stage::Merge => JobStatus::WordAnalysisComplete,
            Stage::Trim => JobStatus::InvalidSegmentsReady,
        }
    }

    /// Status recorded while the stage runs, for stages that have one.
    pub fn started(&self) -> Option<JobStatus> {
        match self {
            Stage::Transcribe => Some(JobStatus::TranscriptionStarted),
            Stage::SentenceAnalysis => Some(JobStatus::SentenceAnalysisStarted),
            Stage::WordAnalysis => Some(JobStatus::WordAnalysisStarted),
            Stage::Trim => Some(JobStatus::TrimStarted),
            Stage::Upload | Stage::Merge => None,
        }
    }

    pub fn completed(&self) -> JobStatus {
        match self {
            Stage::Upload => JobStatus::Uploaded,
            Stage::Transcribe => JobStatus::TranscriptionComplete,
            Stage::SentenceAnalysis => JobStatus::SentenceAnalysisComplete,
            Stage::WordAnalysis => JobStatus::WordAnalysisComplete,
            Stage::Merge => JobStatus::InvalidSegmentsReady,
            Stage::Trim => JobStatus::Completed,
        }
    }

    pub fn checkpoint(&self) -> JobStatus {
        self.required()
    }

    /// The stage a job at `status` would run next, `None` once completed.
    pub fn next_for(status: JobStatus) -> Option<Stage> {
        Self::PIPELINE
            .into_iter()
            .find(|stage| stage.required() == status)
    }

    /// The stage whose in-progress status is `status`.
    pub fn running_at(status: JobStatus) -> Option<Stage> {
        Self::PIPELINE
            .into_iter()
            .find(|stage| stage.started() == Some(status))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Upload => "upload",
            Stage::Transcribe => "transcribe",
            Stage::SentenceAnalysis => "sentence_analysis",
            Stage::WordAnalysis => "word_analysis",
            Stage::Merge => "merge",
            Stage::Trim => "trim",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::PIPELINE
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("Unknown stage: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_rank_not_name() {
        assert!(JobStatus::Created < JobStatus::Uploaded);
        assert!(JobStatus::TrimStarted > JobStatus::InvalidSegmentsReady);
        // Alphabetically "completed" sorts before "created".
        assert!(JobStatus::Completed > JobStatus::Created);
        assert!(JobStatus::WordAnalysisComplete >= JobStatus::TranscriptionComplete);
    }

    #[test]
    fn ranks_are_contiguous() {
        for (i, status) in JobStatus::ALL.iter().enumerate() {
            assert_eq!(status.rank() as usize, i + 1);
        }
        assert_eq!(JobStatus::Created.next(), Some(JobStatus::Uploaded));
        assert_eq!(JobStatus::Completed.next(), None);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
        assert_eq!(
            serde_json::to_string(&JobStatus::InvalidSegmentsReady).unwrap(),
            "\"invalid_segments_ready\""
        );
    }

    #[test]
    fn stages_chain_through_every_status() {
        let mut status = JobStatus::Created;
        for stage in Stage::PIPELINE {
            assert_eq!(Stage::next_for(status), Some(stage));
            if let Some(started) = stage.started() {
                assert_eq!(Stage::running_at(started), Some(stage));
            }
            status = stage.completed();
        }
        assert_eq!(status, JobStatus::Completed);
        assert_eq!(Stage::next_for(status), None);
    }
}
