//! AutoTrim engine: removes repeated takes, filler words and long pauses from
//! recorded videos, driven by transcript analysis.

pub mod analysis;
pub mod commands;
pub mod cut;
pub mod error;
pub mod ffmpeg;
pub mod interval;
pub mod job;
pub mod processor;
pub mod settings;
pub mod transcription;

pub use cut::{Tier, TrimError, TrimReport, Trimmer};
pub use error::ServiceError;
pub use interval::{compute_keep_intervals, IntervalError, KeepInterval, RemovalInterval, RemovalKind};
pub use job::{JobError, JobManager, JobRecord, JobStatus, LeaseOwner, Stage};
pub use processor::{Pipeline, PipelineError, StageHandle, StageOutcome};
pub use settings::Settings;
