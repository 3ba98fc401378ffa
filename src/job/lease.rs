//! Cross-process ownership of a job's single-flight flag.
//!
//! Holding a job means owning `<job_dir>/lease.json`. The file is created
//! with no-clobber semantics, so two processes can never both claim it, and it
//! names the holder so a later process can tell a crashed holder from a live
//! one.

use std::io::{ErrorKind, Write};
use std::path::Path;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

static CURRENT: Lazy<LeaseOwner> = Lazy::new(|| {
    let pid = std::process::id();
    LeaseOwner {
        pid,
        started: process_start_time(pid),
    }
});

/// The process holding a lease. `started` guards against pid reuse where the
/// platform exposes process start times.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseOwner {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<u64>,
}

impl LeaseOwner {
    pub fn current() -> Self {
        CURRENT.clone()
    }

    /// Whether the owning process is still running.
    pub fn is_alive(&self) -> bool {
        if self.pid == CURRENT.pid {
            return self.started == CURRENT.started;
        }
        process_alive(self.pid, self.started)
    }
}

/// Create `path` holding `owner`, failing with `Ok(false)` if it already exists.
pub(crate) fn claim(path: &Path, owner: &LeaseOwner) -> std::io::Result<bool> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, owner)?;
    tmp.flush()?;
    match tmp.persist_noclobber(path) {
        Ok(_) => Ok(true),
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.error),
    }
}

/// Current holder of `path`. A file that cannot be parsed has no live holder.
pub(crate) fn holder(path: &Path) -> std::io::Result<Option<LeaseOwner>> {
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(serde_json::from_str(&content).unwrap_or(LeaseOwner {
            pid: 0,
            started: None,
        }))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn release(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Start time of `pid` in clock ticks since boot (field 22 of `/proc/<pid>/stat`).
#[cfg(target_os = "linux")]
fn process_start_time(pid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // The command name may contain spaces, so count fields after its closing paren.
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}

#[cfg(not(target_os = "linux"))]
fn process_start_time(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32, started: Option<u64>) -> bool {
    match process_start_time(pid) {
        Some(actual) => started.map_or(true, |expected| expected == actual),
        None => false,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn process_alive(pid: u32, _started: Option<u64>) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // Signal 0 only checks that the process exists.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32, _started: Option<u64>) -> bool {
    // TODO: query the process table on Windows; until then a foreign lease is
    // only cleared by hand.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(LeaseOwner::current().is_alive());
    }

    #[cfg(unix)]
    #[test]
    fn unknown_pid_is_dead() {
        let gone = LeaseOwner {
            pid: i32::MAX as u32,
            started: None,
        };
        assert!(!gone.is_alive());
        let unreadable = LeaseOwner { pid: 0, started: None };
        assert!(!unreadable.is_alive());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn recycled_pid_is_dead() {
        let mut owner = LeaseOwner::current();
        owner.started = owner.started.map(|s| s + 1);
        assert!(!owner.is_alive());
    }

    #[test]
    fn claim_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lease.json");
        let owner = LeaseOwner::current();

        assert!(claim(&path, &owner).unwrap());
        assert!(!claim(&path, &owner).unwrap());
        assert_eq!(holder(&path).unwrap(), Some(owner.clone()));

        release(&path).unwrap();
        assert_eq!(holder(&path).unwrap(), None);
        assert!(claim(&path, &owner).unwrap());
    }
}
