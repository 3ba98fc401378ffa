//! Job lifecycle: ordered statuses, durable records and the single-flight
//! guard around every state-advancing operation.

mod lease;
mod record;
mod status;
mod store;

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub use lease::LeaseOwner;
pub use record::{Artifacts, JobRecord, StageFailure, TrimSummary};
pub use status::{JobStatus, Stage};
pub use store::JobStore;

/// Source extensions accepted on upload.
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mov", "mkv"];

#[derive(Debug, Error)]
pub enum JobError {
    #[error("input file not found: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("unsupported file type {0:?}, expected one of mp4, avi, mov, mkv")]
    UnsupportedFormat(String),

    #[error("job {0} not found")]
    NotFound(String),

    #[error("job {0} is already processing")]
    Busy(String),

    #[error("job {job_id} rejected: {reason}")]
    Conflict { job_id: String, reason: String },

    #[error("failed to persist job {job_id}: {message}")]
    Persistence { job_id: String, message: String },
}

impl JobError {
    pub fn persistence(job_id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Persistence {
            job_id: job_id.into(),
            message: err.to_string(),
        }
    }

    fn conflict(job_id: &str, reason: impl Into<String>) -> Self {
        Self::Conflict {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Rejections that left the job untouched.
    pub fn is_conflict(&self) -> bool {
        matches!(self, JobError::Busy(_) | JobError::Conflict { .. })
    }

    pub fn is_input_error(&self) -> bool {
        matches!(self, JobError::InputMissing(_) | JobError::UnsupportedFormat(_))
    }
}

/// Owns every read-modify-write of job records.
///
/// Each mutation runs under a per-job in-process lock and is persisted before
/// the call returns; the in-memory copy is discarded if the save fails.
/// Across processes, state-advancing calls first claim the job's lease file.
#[derive(Debug, Clone)]
pub struct JobManager {
    store: JobStore,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl JobManager {
    pub fn new(store: JobStore) -> Self {
        Self {
            store,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, JobError> {
        Ok(Self::new(JobStore::open(data_dir)?))
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Register a new job for an existing video file.
    pub fn create_job(&self, input_path: &Path) -> Result<JobRecord, JobError> {
        if !input_path.is_file() {
            return Err(JobError::InputMissing(input_path.to_path_buf()));
        }
        let extension = input_path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        if !VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            return Err(JobError::UnsupportedFormat(extension));
        }
        let absolute = std::fs::canonicalize(input_path)
            .map_err(|_| JobError::InputMissing(input_path.to_path_buf()))?;

        let record = JobRecord::new(
            uuid::Uuid::new_v4().to_string(),
            absolute,
            format!(".{}", extension),
        );
        self.store.save(&record)?;
        info!(job_id = %record.job_id, input = %record.input_path.display(), "Job created");
        Ok(record)
    }

    pub fn get(&self, job_id: &str) -> Result<JobRecord, JobError> {
        self.store.load(job_id)
    }

    pub fn list(&self) -> Result<Vec<JobRecord>, JobError> {
        self.store.list()
    }

    /// Move an idle job exactly one rank forward to `target`.
    pub fn advance(&self, job_id: &str, target: JobStatus) -> Result<JobRecord, JobError> {
        self.exclusive(job_id, |record| {
            if record.status.next() != Some(target) {
                return Err(JobError::conflict(
                    job_id,
                    format!("cannot advance from {} to {}", record.status, target),
                ));
            }
            record.status = target;
            Ok(())
        })
    }

    /// Acquire the single-flight flag for `stage`.
    ///
    /// The job must be idle and sitting exactly at the stage's entry status.
    /// The returned lease must be completed or failed; dropping it rolls back.
    pub fn begin(&self, job_id: &str, stage: Stage) -> Result<StageLease, JobError> {
        let owner = LeaseOwner::current();
        if !self.store.claim_lease(job_id, &owner)? {
            return Err(JobError::Busy(job_id.to_string()));
        }
        let claimed = self.modify(job_id, |record| {
            if record.is_processing {
                return Err(JobError::Busy(job_id.to_string()));
            }
            if record.status != stage.required() {
                return Err(JobError::conflict(
                    job_id,
                    format!("{} requires status {}, job is at {}", stage, stage.required(), record.status),
                ));
            }
            record.is_processing = true;
            record.active_stage = Some(stage);
            record.owner = Some(owner.clone());
            if let Some(started) = stage.started() {
                record.status = started;
            }
            Ok(())
        });
        let record = match claimed {
            Ok(record) => record,
            Err(e) => {
                self.release_lease(job_id);
                return Err(e);
            }
        };
        info!(job_id = %job_id, stage = %stage, status = %record.status, pid = owner.pid, "Stage started");

        Ok(StageLease {
            manager: self.clone(),
            job_id: job_id.to_string(),
            stage,
            settled: false,
        })
    }

    /// Reset an idle job whose status lies in `allowed` to `target`.
    ///
    /// `update` runs only once the range check has passed and may still
    /// reject the change; a rejected call leaves the job untouched.
    pub fn set_checkpoint<F>(
        &self,
        job_id: &str,
        allowed: RangeInclusive<JobStatus>,
        target: JobStatus,
        update: F,
    ) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
    {
        self.exclusive(job_id, |record| {
            if !allowed.contains(&record.status) {
                return Err(JobError::conflict(
                    job_id,
                    format!(
                        "status {} is outside {}..={}",
                        record.status,
                        allowed.start(),
                        allowed.end()
                    ),
                ));
            }
            update(record)?;
            record.status = target;
            Ok(())
        })
    }

    /// Roll back every job whose lease holder is no longer running, e.g.
    /// after a crash mid-stage. Jobs held by a live process, this one
    /// included, are left alone. Returns the recovered records.
    pub fn recover_interrupted(&self) -> Result<Vec<JobRecord>, JobError> {
        let mut recovered = Vec::new();
        for record in self.store.list()? {
            let holder = self.store.lease_holder(&record.job_id)?;
            if holder.as_ref().is_some_and(LeaseOwner::is_alive) {
                if record.is_processing {
                    debug!(job_id = %record.job_id, "Job is held by a running process, not recovering");
                }
                continue;
            }
            if !record.is_processing {
                if holder.is_some() {
                    warn!(job_id = %record.job_id, "Clearing stale lease on idle job");
                    self.store.release_lease(&record.job_id)?;
                }
                continue;
            }

            let stage = record
                .active_stage
                .or_else(|| Stage::running_at(record.status));
            let updated = self.modify(&record.job_id, |r| {
                match stage {
                    Some(stage) => {
                        r.status = stage.checkpoint();
                        r.last_error = Some(StageFailure::new(stage, "interrupted"));
                    }
                    None => warn!(job_id = %r.job_id, status = %r.status, "Interrupted job has no known stage, clearing flag only"),
                }
                r.is_processing = false;
                r.active_stage = None;
                r.owner = None;
                Ok(())
            })?;
            self.store.release_lease(&record.job_id)?;
            warn!(
                job_id = %updated.job_id,
                status = %updated.status,
                dead_pid = holder.map(|h| h.pid),
                "Recovered interrupted job"
            );
            recovered.push(updated);
        }
        Ok(recovered)
    }

    /// Run `f` on an idle job while holding its lease for the duration of
    /// the write.
    fn exclusive<F>(&self, job_id: &str, f: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
    {
        if !self.store.claim_lease(job_id, &LeaseOwner::current())? {
            return Err(JobError::Busy(job_id.to_string()));
        }
        let result = self.modify(job_id, |record| {
            if record.is_processing {
                return Err(JobError::Busy(job_id.to_string()));
            }
            f(record)
        });
        self.release_lease(job_id);
        result
    }

    fn modify<F>(&self, job_id: &str, f: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
    {
        let lock = self.lock_for(job_id);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.store.load(job_id).and_then(|mut record| {
                f(&mut record)?;
                record.updated_at = Utc::now();
                self.store.save(&record)?;
                Ok(record)
            })
        };
        drop(lock);
        self.prune_lock(job_id);
        result
    }

    fn lock_for(&self, job_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the job's lock once no caller holds or waits on it.
    fn prune_lock(&self, job_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(job_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(job_id);
        }
    }

    fn release_lease(&self, job_id: &str) {
        if let Err(e) = self.store.release_lease(job_id) {
            error!(job_id = %job_id, error = %e, "Could not release job lease");
        }
    }
}

/// Proof that a stage holds a job's single-flight flag.
#[derive(Debug)]
pub struct StageLease {
    manager: JobManager,
    job_id: String,
    stage: Stage,
    settled: bool,
}

impl StageLease {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// Release the flag and advance to the stage's completed status.
    pub fn complete<F>(mut self, update: F) -> Result<JobRecord, JobError>
    where
        F: FnOnce(&mut JobRecord),
    {
        let stage = self.stage;
        let record = self.manager.modify(&self.job_id, |r| {
            update(r);
            r.status = stage.completed();
            r.is_processing = false;
            r.active_stage = None;
            r.owner = None;
            r.last_error = None;
            Ok(())
        })?;
        self.settled = true;
        self.manager.release_lease(&self.job_id);
        info!(job_id = %self.job_id, stage = %stage, status = %record.status, "Stage complete");
        Ok(record)
    }

    /// Release the flag and roll back to the stage's checkpoint.
    pub fn fail(mut self, message: impl Into<String>) -> Result<JobRecord, JobError> {
        let message = message.into();
        self.settled = true;
        self.rollback(&message)
    }

    fn rollback(&self, message: &str) -> Result<JobRecord, JobError> {
        let stage = self.stage;
        let result = self.manager.modify(&self.job_id, |r| {
            r.status = stage.checkpoint();
            r.is_processing = false;
            r.active_stage = None;
            r.owner = None;
            r.last_error = Some(StageFailure::new(stage, message));
            Ok(())
        });
        // Even if the record could not be written, give up the lease so
        // recovery can repair the job.
        self.manager.release_lease(&self.job_id);
        let record = result?;
        warn!(job_id = %self.job_id, stage = %stage, status = %record.status, error = %message, "Stage failed, rolled back");
        Ok(record)
    }
}

impl Drop for StageLease {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Err(e) = self.rollback("stage abandoned") {
            warn!(job_id = %self.job_id, stage = %self.stage, error = %e, "Could not release abandoned stage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (tempfile::TempDir, JobManager, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("talk.MP4");
        std::fs::write(&video, b"video").unwrap();
        let manager = JobManager::open(dir.path().join("jobs")).unwrap();
        (dir, manager, video)
    }

    fn job_at(manager: &JobManager, video: &Path, status: JobStatus) -> String {
        let record = manager.create_job(video).unwrap();
        manager
            .set_checkpoint(&record.job_id, JobStatus::Created..=JobStatus::Completed, status, |_| Ok(()))
            .unwrap();
        record.job_id
    }

    /// Leave `lease` held on disk by a process that no longer exists.
    #[cfg(unix)]
    fn crash(manager: &JobManager, lease: StageLease) {
        let job_id = lease.job_id().to_string();
        std::mem::forget(lease);
        let gone = LeaseOwner {
            pid: i32::MAX as u32,
            started: None,
        };
        std::fs::write(manager.store().lease_path(&job_id), serde_json::to_vec(&gone).unwrap()).unwrap();
    }

    #[test]
    fn create_validates_input() {
        let (dir, manager, video) = manager();
        let record = manager.create_job(&video).unwrap();
        assert_eq!(record.status, JobStatus::Created);
        assert_eq!(record.file_extension, ".mp4");
        assert!(record.input_path.is_absolute());
        assert!(!record.is_processing);

        let missing = manager.create_job(&dir.path().join("gone.mp4")).unwrap_err();
        assert!(matches!(missing, JobError::InputMissing(_)));

        let text = dir.path().join("notes.txt");
        std::fs::write(&text, b"hi").unwrap();
        let wrong = manager.create_job(&text).unwrap_err();
        assert!(wrong.is_input_error());
    }

    #[test]
    fn created_only_advances_to_uploaded() {
        let (_dir, manager, video) = manager();
        let job_id = manager.create_job(&video).unwrap().job_id;

        let err = manager.advance(&job_id, JobStatus::TrimStarted).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(manager.get(&job_id).unwrap().status, JobStatus::Created);

        let record = manager.advance(&job_id, JobStatus::Uploaded).unwrap();
        assert_eq!(record.status, JobStatus::Uploaded);
        assert_eq!(manager.get(&job_id).unwrap().status, JobStatus::Uploaded);
    }

    #[test]
    fn processing_job_rejects_any_request() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::Uploaded);
        let lease = manager.begin(&job_id, Stage::Transcribe).unwrap();

        for stage in Stage::PIPELINE {
            assert!(matches!(manager.begin(&job_id, stage), Err(JobError::Busy(_))));
        }
        assert!(matches!(
            manager.advance(&job_id, JobStatus::TranscriptionComplete),
            Err(JobError::Busy(_))
        ));

        lease.complete(|_| {}).unwrap();
        let record = manager.get(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::TranscriptionComplete);
        assert!(!record.is_processing);
    }

    #[test]
    fn trim_requires_exact_checkpoint() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::Completed);
        let err = manager.begin(&job_id, Stage::Trim).unwrap_err();
        assert!(err.is_conflict());

        let early = job_at(&manager, &video, JobStatus::WordAnalysisComplete);
        assert!(manager.begin(&early, Stage::Trim).unwrap_err().is_conflict());
    }

    #[test]
    fn begin_persists_started_status() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::InvalidSegmentsReady);
        let lease = manager.begin(&job_id, Stage::Trim).unwrap();

        let stored = manager.store().load(&job_id).unwrap();
        assert_eq!(stored.status, JobStatus::TrimStarted);
        assert!(stored.is_processing);
        assert_eq!(stored.active_stage, Some(Stage::Trim));
        lease.fail("boom").unwrap();
    }

    #[test]
    fn failure_rolls_back_and_records_reason() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::InvalidSegmentsReady);
        let lease = manager.begin(&job_id, Stage::Trim).unwrap();

        let record = lease.fail("all tiers failed").unwrap();
        assert_eq!(record.status, JobStatus::InvalidSegmentsReady);
        assert!(!record.is_processing);
        let failure = record.last_error.unwrap();
        assert_eq!(failure.stage, Stage::Trim);
        assert_eq!(failure.message, "all tiers failed");

        // Retryable from the same checkpoint; success clears the reason.
        let retry = manager.begin(&job_id, Stage::Trim).unwrap();
        let done = retry.complete(|_| {}).unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.last_error.is_none());
    }

    #[test]
    fn dropped_lease_releases_flag() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::Uploaded);
        {
            let _lease = manager.begin(&job_id, Stage::Transcribe).unwrap();
        }
        let record = manager.get(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::Uploaded);
        assert!(!record.is_processing);
        assert_eq!(record.last_error.unwrap().message, "stage abandoned");
    }

    #[cfg(unix)]
    #[test]
    fn recovers_jobs_left_processing() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::SentenceAnalysisComplete);
        let lease = manager.begin(&job_id, Stage::WordAnalysis).unwrap();
        crash(&manager, lease);
        assert!(matches!(manager.begin(&job_id, Stage::WordAnalysis), Err(JobError::Busy(_))));

        let restarted = JobManager::new(manager.store().clone());
        let recovered = restarted.recover_interrupted().unwrap();
        assert_eq!(recovered.len(), 1);

        let record = restarted.get(&job_id).unwrap();
        assert_eq!(record.status, JobStatus::SentenceAnalysisComplete);
        assert!(!record.is_processing);
        assert_eq!(record.last_error.unwrap().message, "interrupted");
        assert!(record.owner.is_none());
        assert!(restarted.begin(&job_id, Stage::WordAnalysis).is_ok());
    }

    #[test]
    fn live_lease_held_by_another_manager_is_not_recovered() {
        let (_dir, first, video) = manager();
        let job_id = job_at(&first, &video, JobStatus::Uploaded);
        let lease = first.begin(&job_id, Stage::Transcribe).unwrap();

        let second = JobManager::new(first.store().clone());
        assert!(second.recover_interrupted().unwrap().is_empty());
        assert!(matches!(second.begin(&job_id, Stage::Transcribe), Err(JobError::Busy(_))));
        assert!(matches!(
            second.advance(&job_id, JobStatus::TranscriptionComplete),
            Err(JobError::Busy(_))
        ));
        let record = second.get(&job_id).unwrap();
        assert!(record.is_processing);
        assert_eq!(record.status, JobStatus::TranscriptionStarted);
        assert_eq!(record.owner, Some(LeaseOwner::current()));

        lease.complete(|_| {}).unwrap();
        assert!(!first.store().lease_path(&job_id).exists());
        let next = second.begin(&job_id, Stage::SentenceAnalysis).unwrap();
        next.fail("stopped").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn stale_lease_on_idle_job_is_cleared() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::Uploaded);
        let gone = LeaseOwner {
            pid: i32::MAX as u32,
            started: None,
        };
        assert!(manager.store().claim_lease(&job_id, &gone).unwrap());
        assert!(matches!(manager.begin(&job_id, Stage::Transcribe), Err(JobError::Busy(_))));

        assert!(manager.recover_interrupted().unwrap().is_empty());
        let lease = manager.begin(&job_id, Stage::Transcribe).unwrap();
        lease.fail("stopped").unwrap();
        assert_eq!(manager.get(&job_id).unwrap().status, JobStatus::Uploaded);
    }

    #[test]
    fn job_locks_are_pruned_after_use() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::Uploaded);
        let lease = manager.begin(&job_id, Stage::Transcribe).unwrap();
        lease.complete(|_| {}).unwrap();
        assert!(manager.locks.lock().unwrap().is_empty());
    }

    #[test]
    fn checkpoint_reset_respects_range() {
        let (_dir, manager, video) = manager();
        let job_id = job_at(&manager, &video, JobStatus::Completed);
        let err = manager
            .set_checkpoint(
                &job_id,
                JobStatus::TranscriptionComplete..=JobStatus::InvalidSegmentsReady,
                JobStatus::InvalidSegmentsReady,
                |_| Ok(()),
            )
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(manager.get(&job_id).unwrap().status, JobStatus::Completed);
    }
}
