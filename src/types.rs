use serde::{Deserialize, Serialize};

// --- Stories ---

/// One entry in a story's ordered acceptance-criteria list.
///
/// Order is stable and meaningful for display. The engine never rewrites
/// it; only the assistant subprocess edits `checked`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct AcceptanceCriterion {
    pub text: String,
    #[serde(default)]
    pub checked: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub acceptance_criteria: Vec<AcceptanceCriterion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default)]
    pub passes: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Story {
    /// The type prefix segment before the first `-` (e.g. `US`, `BUG`,
    /// `AUDIT`). The prefix is the only semantic part of an id the engine
    /// interprets.
    pub fn type_prefix(&self) -> &str {
        story_type_prefix(&self.id)
    }
}

/// Extract the type prefix from a story id. Ids without a `-` are their
/// own prefix.
pub fn story_type_prefix(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

// --- Backlog index ---

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BacklogIndex {
    #[serde(rename = "$schema", default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default)]
    pub story_order: Vec<String>,
    #[serde(default)]
    pub pending: Vec<String>,
    #[serde(default)]
    pub blocked: Vec<String>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_story: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<String>,
}

impl BacklogIndex {
    /// True when nothing remains to schedule or unblock.
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.blocked.is_empty()
    }

    /// True when no story is schedulable but blocked stories remain.
    pub fn is_all_blocked(&self) -> bool {
        self.pending.is_empty() && !self.blocked.is_empty()
    }
}

// --- Update queue ---

/// Transient merge document written by external agents (`update.json`).
/// Consumed exactly once on first read, then deleted.
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct UpdateQueue {
    pub new_stories: Vec<Story>,
    /// Partial story documents, shallow-merged by `id`.
    pub update_stories: Vec<serde_json::Value>,
    pub move_to_pending: Vec<String>,
    /// Pairs of `[id, reason]`.
    pub move_to_blocked: Vec<(String, String)>,
    pub remove_stories: Vec<String>,
    pub story_order: Vec<String>,
    pub pending: Vec<String>,
}

impl UpdateQueue {
    pub fn is_empty(&self) -> bool {
        self.new_stories.is_empty()
            && self.update_stories.is_empty()
            && self.move_to_pending.is_empty()
            && self.move_to_blocked.is_empty()
            && self.remove_stories.is_empty()
            && self.story_order.is_empty()
            && self.pending.is_empty()
    }
}

/// Outcome of one `apply_update_queue` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub applied: bool,
    /// Human-readable change descriptions, or a single `Error: ...` entry
    /// when the queue could not be parsed.
    pub changes: Vec<String>,
}

impl UpdateOutcome {
    pub fn none() -> Self {
        Self {
            applied: false,
            changes: Vec::new(),
        }
    }
}

// --- Runner status ---

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Running,
    CrReview,
    Error,
    Retry,
    Complete,
    Interrupted,
    Terminated,
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunnerState::Running => write!(f, "running"),
            RunnerState::CrReview => write!(f, "cr_review"),
            RunnerState::Error => write!(f, "error"),
            RunnerState::Retry => write!(f, "retry"),
            RunnerState::Complete => write!(f, "complete"),
            RunnerState::Interrupted => write!(f, "interrupted"),
            RunnerState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Live status record published for external observers. Single writer
/// (the run loop); rewritten on every transition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunnerStatus {
    pub state: RunnerState,
    pub iteration: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    pub model: String,
    pub start_time: String,
    pub last_activity: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_in: Option<u64>,
    pub pid: u32,
}

// --- Iteration results ---

/// Classified outcome of a single driver iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The backlog is drained (or a PRD-complete promise was emitted).
    Complete,
    /// Nothing schedulable, blocked stories remain.
    AllBlocked,
    /// No story available and the backlog is not cleanly complete.
    NoStory,
    /// The head story had a live blocker and was moved to blocked.
    Blocked,
    /// The assistant ran and exited cleanly.
    Success,
    /// The assistant failed; carries the retry class name.
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct IterationResult {
    pub iteration: u32,
    pub story_id: Option<String>,
    pub success: bool,
    pub has_complete: bool,
    pub has_blocked: bool,
    pub duration_ms: u64,
    pub error: Option<String>,
}

// --- Subprocess results ---

/// What the supervisor returns after one assistant run, in both pipe and
/// pty mode.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub session_id: Option<String>,
}

impl SpawnResult {
    /// Combined stdout+stderr view handed to the classifier.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_prefix_extraction() {
        assert_eq!(story_type_prefix("US-001"), "US");
        assert_eq!(story_type_prefix("AUDIT-12"), "AUDIT");
        assert_eq!(story_type_prefix("noprefix"), "noprefix");
        assert_eq!(story_type_prefix(""), "");
    }

    #[test]
    fn index_completion_predicates() {
        let mut ix = BacklogIndex::default();
        assert!(ix.is_complete());
        assert!(!ix.is_all_blocked());

        ix.blocked.push("B-1".to_string());
        assert!(!ix.is_complete());
        assert!(ix.is_all_blocked());

        ix.pending.push("US-1".to_string());
        assert!(!ix.is_complete());
        assert!(!ix.is_all_blocked());
    }

    #[test]
    fn update_queue_empty_detection() {
        assert!(UpdateQueue::default().is_empty());
        let q = UpdateQueue {
            move_to_pending: vec!["US-1".to_string()],
            ..Default::default()
        };
        assert!(!q.is_empty());
    }

    #[test]
    fn combined_output_joins_streams() {
        let r = SpawnResult {
            exit_code: 0,
            stdout: "out".to_string(),
            stderr: "err".to_string(),
            duration_ms: 1,
            session_id: None,
        };
        assert_eq!(r.combined_output(), "out\nerr");
    }
}
