use std::fs;
use std::path::{Path, PathBuf};

use crate::log_warn;
use crate::types::{RunnerState, RunnerStatus};

/// Owner of the runner status file. Single writer (the run loop); the file
/// is rewritten on every state transition and removed on clean exit.
pub struct StatusFile {
    path: PathBuf,
    status: RunnerStatus,
}

/// Well-known default location observers poll: `<tmpdir>/ralph-status-<pid>.json`.
pub fn default_status_path() -> PathBuf {
    std::env::temp_dir().join(format!("ralph-status-{}.json", std::process::id()))
}

impl StatusFile {
    pub fn create(path: Option<PathBuf>, model: &str) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        let status = RunnerStatus {
            state: RunnerState::Running,
            iteration: 0,
            story_id: None,
            model: model.to_string(),
            start_time: now.clone(),
            last_activity: now,
            error: None,
            retry_in: None,
            pid: std::process::id(),
        };
        let this = Self {
            path: path.unwrap_or_else(default_status_path),
            status,
        };
        this.write();
        this
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> &RunnerStatus {
        &self.status
    }

    /// Record a state transition and rewrite the file. Advisory: a failed
    /// write is logged, never surfaced, so observers can't stall the loop.
    pub fn transition(
        &mut self,
        state: RunnerState,
        iteration: u32,
        story_id: Option<&str>,
        error: Option<&str>,
        retry_in: Option<u64>,
    ) {
        self.status.state = state;
        self.status.iteration = iteration;
        self.status.story_id = story_id.map(|s| s.to_string());
        self.status.error = error.map(|e| e.to_string());
        self.status.retry_in = retry_in;
        self.status.last_activity = chrono::Utc::now().to_rfc3339();
        self.write();
    }

    fn write(&self) {
        let mut json = match serde_json::to_string_pretty(&self.status) {
            Ok(j) => j,
            Err(e) => {
                log_warn!("Warning: Failed to serialize status: {}", e);
                return;
            }
        };
        json.push('\n');
        if let Err(e) = fs::write(&self.path, json) {
            log_warn!(
                "Warning: Failed to write status file {}: {}",
                self.path.display(),
                e
            );
        }
    }

    /// Remove the status file. Called once on clean exit; the final
    /// terminal state was already written by then.
    pub fn remove(self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log_warn!(
                    "Warning: Failed to remove status file {}: {}",
                    self.path.display(),
                    e
                );
            }
        }
    }
}

/// Read a status file, if present and parseable. Used by observers
/// (`ralph status`).
pub fn read_status(path: &Path) -> Option<RunnerStatus> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
