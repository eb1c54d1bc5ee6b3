//! Per-entry-point exclusive lock files.
//!
//! `run`, `monitor`, `feedback` and `reconcile --repair` each take
//! `{lock_dir}/{entry_point}.lock` before touching the ledger. The file is
//! created with `create_new`, so exactly one process wins; it holds the
//! winner's pid and acquisition time and is removed when the guard drops.
//! A stale file is first renamed to a name unique to the claiming process,
//! so two processes taking over the same stale lock cannot both succeed.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;
use tracing::{debug, warn};

use crate::error::{PipelineError, Result};

/// Lock directory plus staleness policy.
#[derive(Debug, Clone)]
pub struct ExclusiveLock {
    dir: PathBuf,
    stale_after: Duration,
}

/// Held lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    entry_point: String,
    pid: u32,
}

impl ExclusiveLock {
    pub fn new(dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            stale_after,
        }
    }

    /// Take the lock for `entry_point` or fail with `ConcurrencyConflict`.
    ///
    /// A lock whose holder process is gone, or which is older than the
    /// staleness limit, is taken over with a warning.
    pub fn acquire(&self, entry_point: &str) -> Result<LockGuard> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{entry_point}.lock"));
        let pid = std::process::id();

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{pid}")?;
                    writeln!(file, "{}", Utc::now().to_rfc3339())?;
                    file.sync_all()?;

                    debug!(entry_point, pid, path = %path.display(), "Lock acquired");
                    return Ok(LockGuard {
                        path,
                        entry_point: entry_point.to_string(),
                        pid,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_holder(&path);
                    if attempt == 0 && self.is_stale(&path, holder.pid) {
                        warn!(
                            entry_point,
                            holder = %holder,
                            "Taking over stale lock"
                        );
                        if claim_stale(&path, &holder)? {
                            continue;
                        }
                    }
                    return Err(PipelineError::ConcurrencyConflict {
                        entry_point: entry_point.to_string(),
                        holder: holder.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(PipelineError::ConcurrencyConflict {
            entry_point: entry_point.to_string(),
            holder: read_holder(&path).to_string(),
        })
    }

    fn is_stale(&self, path: &Path, holder_pid: Option<u32>) -> bool {
        if let Some(pid) = holder_pid {
            if !pid_alive(pid) {
                return true;
            }
        }

        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age >= self.stale_after)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the file if it is still ours
        if read_holder(&self.path).pid != Some(self.pid) {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(entry_point = %self.entry_point, "Lock released"),
            Err(e) => warn!(
                entry_point = %self.entry_point,
                error = %e,
                "Failed to remove lock file"
            ),
        }
    }
}

#[derive(Debug, PartialEq)]
struct Holder {
    pid: Option<u32>,
    since: Option<String>,
}

impl std::fmt::Display for Holder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.pid, &self.since) {
            (Some(pid), Some(since)) => write!(f, "pid {pid} since {since}"),
            (Some(pid), None) => write!(f, "pid {pid}"),
            _ => f.write_str("unknown holder"),
        }
    }
}

fn read_holder(path: &Path) -> Holder {
    let contents = fs::read_to_string(path).unwrap_or_default();
    let mut lines = contents.lines();
    Holder {
        pid: lines.next().and_then(|l| l.trim().parse().ok()),
        since: lines.next().map(|l| l.trim().to_string()),
    }
}

/// Move a stale lock out of the way. Returns `false` when the file at
/// `path` no longer belongs to `seen`, leaving any new holder in place.
fn claim_stale(path: &Path, seen: &Holder) -> Result<bool> {
    let claimed = path.with_extension(format!("lock.stale.{}", Uuid::new_v4()));
    match fs::rename(path, &claimed) {
        Ok(()) => {}
        // Someone else claimed it first; retry create_new
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    if read_holder(&claimed) != *seen {
        // A fresh holder replaced the stale file before the rename; put it back
        let restored = fs::hard_link(&claimed, path);
        fs::remove_file(&claimed)?;
        if let Err(e) = restored {
            warn!(path = %path.display(), error = %e, "Could not restore lock taken by another process");
        }
        return Ok(false);
    }

    fs::remove_file(&claimed)?;
    Ok(true)
}

#[cfg(target_os = "linux")]
fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn pid_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_second_acquire_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ExclusiveLock::new(dir.path(), HOUR);

        let guard = lock.acquire("monitor").unwrap();
        let err = lock.acquire("monitor").unwrap_err();
        assert!(matches!(err, PipelineError::ConcurrencyConflict { .. }));

        // Other entry points are independent
        let other = lock.acquire("feedback").unwrap();
        assert_eq!(other.path, dir.path().join("feedback.lock"));

        drop(guard);
        assert!(lock.acquire("monitor").is_ok());
    }

    #[test]
    fn test_release_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let lock = ExclusiveLock::new(dir.path(), HOUR);

        {
            let _guard = lock.acquire("run").unwrap();
            assert!(dir.path().join("run.lock").exists());
        }
        assert!(!dir.path().join("run.lock").exists());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dead_holder_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("run.lock"), "4294967294\n2025-03-10T00:00:00Z\n").unwrap();

        let lock = ExclusiveLock::new(dir.path(), HOUR);
        let guard = lock.acquire("run").unwrap();
        assert_eq!(read_holder(&guard.path).pid, Some(std::process::id()));
    }

    #[test]
    fn test_replaced_stale_lock_is_left_to_new_holder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "4294967294\n2025-03-10T00:00:00Z\n").unwrap();
        let seen = read_holder(&path);

        // Another process takes over between our read and our claim
        fs::write(&path, "1\n2025-03-10T00:00:05Z\n").unwrap();
        assert!(!claim_stale(&path, &seen).unwrap());
        assert_eq!(read_holder(&path).pid, Some(1));

        // Nothing but the live lock is left behind
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        let current = read_holder(&path);
        assert!(claim_stale(&path, &current).unwrap());
        assert!(!path.exists());
    }
}
