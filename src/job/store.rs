use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::warn;

use super::lease::{self, LeaseOwner};
use super::record::JobRecord;
use super::JobError;

const RECORD_FILE: &str = "metadata.json";
const LEASE_FILE: &str = "lease.json";

/// One directory per job under `root`, holding the record and its artifacts.
#[derive(Debug, Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, JobError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| JobError::persistence("store", e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn job_dir(&self, job_id: &str) -> PathBuf {
        self.root.join(job_id)
    }

    pub fn exists(&self, job_id: &str) -> bool {
        self.job_dir(job_id).join(RECORD_FILE).is_file()
    }

    pub fn load(&self, job_id: &str) -> Result<JobRecord, JobError> {
        let path = self.job_dir(job_id).join(RECORD_FILE);
        if !path.is_file() {
            return Err(JobError::NotFound(job_id.to_string()));
        }
        let content = std::fs::read_to_string(&path).map_err(|e| JobError::persistence(job_id, e))?;
        serde_json::from_str(&content).map_err(|e| JobError::persistence(job_id, e))
    }

    /// Write the record atomically; a failed save leaves the previous version intact.
    pub fn save(&self, record: &JobRecord) -> Result<(), JobError> {
        let path = self.job_dir(&record.job_id).join(RECORD_FILE);
        self.write_json(&record.job_id, &path, record)
    }

    /// All readable records, oldest first. Unreadable entries are skipped.
    pub fn list(&self) -> Result<Vec<JobRecord>, JobError> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| JobError::persistence("store", e))?;
        let mut records = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            if !entry.path().join(RECORD_FILE).is_file() {
                continue;
            }
            let job_id = entry.file_name().to_string_lossy().into_owned();
            match self.load(&job_id) {
                Ok(record) => records.push(record),
                Err(e) => warn!(job_id = %job_id, error = %e, "Skipping unreadable job record"),
            }
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    pub fn lease_path(&self, job_id: &str) -> PathBuf {
        self.job_dir(job_id).join(LEASE_FILE)
    }

    /// Take the job's lease for `owner`. Returns `false` if anyone, in this
    /// process or another, already holds it.
    pub fn claim_lease(&self, job_id: &str, owner: &LeaseOwner) -> Result<bool, JobError> {
        if !self.exists(job_id) {
            return Err(JobError::NotFound(job_id.to_string()));
        }
        lease::claim(&self.lease_path(job_id), owner).map_err(|e| JobError::persistence(job_id, e))
    }

    pub fn lease_holder(&self, job_id: &str) -> Result<Option<LeaseOwner>, JobError> {
        lease::holder(&self.lease_path(job_id)).map_err(|e| JobError::persistence(job_id, e))
    }

    pub fn release_lease(&self, job_id: &str) -> Result<(), JobError> {
        lease::release(&self.lease_path(job_id)).map_err(|e| JobError::persistence(job_id, e))
    }

    /// Persist a stage artifact as pretty JSON inside the job directory.
    pub fn write_artifact<T: Serialize>(&self, job_id: &str, name: &str, value: &T) -> Result<PathBuf, JobError> {
        let path = self.job_dir(job_id).join(name);
        self.write_json(job_id, &path, value)?;
        Ok(path)
    }

    pub fn read_artifact<T: DeserializeOwned>(&self, job_id: &str, path: &Path) -> Result<T, JobError> {
        let content = std::fs::read_to_string(path).map_err(|e| JobError::persistence(job_id, e))?;
        serde_json::from_str(&content).map_err(|e| JobError::persistence(job_id, e))
    }

    fn write_json<T: Serialize>(&self, job_id: &str, path: &Path, value: &T) -> Result<(), JobError> {
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir).map_err(|e| JobError::persistence(job_id, e))?;

        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| JobError::persistence(job_id, e))?;
        serde_json::to_writer_pretty(&mut tmp, value).map_err(|e| JobError::persistence(job_id, e))?;
        tmp.flush().map_err(|e| JobError::persistence(job_id, e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| JobError::persistence(job_id, e))?;
        tmp.persist(path).map_err(|e| JobError::persistence(job_id, e.error))?;
        Ok(())
    }
}
