use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RalphError;
use crate::log_warn;

/// A lock guard that releases the run lock on drop.
///
/// Enforces the one-engine-per-working-directory rule: no two assistant
/// subprocesses may ever be live for the same backlog.
#[must_use = "lock is released when RunLock is dropped"]
pub struct RunLock {
    lock: fslock::LockFile,
    pid_path: PathBuf,
}

impl std::fmt::Debug for RunLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLock")
            .field("pid_path", &self.pid_path)
            .finish()
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.lock.unlock() {
            log_warn!("Warning: Failed to release run lock: {}", e);
        }
        if let Err(e) = fs::remove_file(&self.pid_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    "Warning: Failed to remove PID file {}: {}",
                    self.pid_path.display(),
                    e
                );
            }
        }
    }
}

/// Attempt to acquire the run lock under `<working_dir>/.ralph/`.
///
/// The file lock is taken first (atomic mutual exclusion), then a PID file
/// is written for diagnostics. On contention the PID file is consulted to
/// produce an actionable error about the holding process.
pub fn try_acquire(runtime_dir: &Path) -> Result<RunLock, String> {
    fs::create_dir_all(runtime_dir)
        .map_err(|e| format!("Failed to create {}: {}", runtime_dir.display(), e))?;

    let lock_path = runtime_dir.join("ralph.lock");
    let pid_path = runtime_dir.join("ralph.pid");

    let mut lock = fslock::LockFile::open(&lock_path)
        .map_err(|e| format!("Failed to open lock file {}: {}", lock_path.display(), e))?;

    let acquired = lock
        .try_lock()
        .map_err(|e| format!("Failed to acquire run lock: {}", e))?;

    if !acquired {
        return Err(RalphError::LockHeld(describe_holder(&lock_path, &pid_path)).into());
    }

    // We hold the lock -- safe to write PID
    fs::write(&pid_path, std::process::id().to_string())
        .map_err(|e| format!("Failed to write PID file: {}", e))?;

    Ok(RunLock { lock, pid_path })
}

fn describe_holder(lock_path: &Path, pid_path: &Path) -> String {
    let holder_pid = fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse::<i32>().ok());

    match holder_pid {
        Some(pid) if is_pid_alive(pid) => {
            format!("Another ralph run is active in this directory (PID {})", pid)
        }
        Some(pid) => format!(
            "Run lock is held but recorded PID {} is not alive. \
             Remove {} and {} to recover",
            pid,
            lock_path.display(),
            pid_path.display()
        ),
        None => format!(
            "Another ralph run holds the lock. If this is stale, remove {}",
            lock_path.display()
        ),
    }
}

fn is_pid_alive(pid: i32) -> bool {
    // signal 0 checks if the process exists without sending a signal
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}
