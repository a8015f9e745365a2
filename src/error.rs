use std::time::Duration;

/// Error enum for the iteration engine.
///
/// Categories:
/// - Retryable: transient subprocess/transport failure, worth retrying
/// - Fatal: halt the run loop, unrecoverable
/// - Skip: log and continue, the next iteration re-reads state
#[derive(Debug, thiserror::Error)]
pub enum RalphError {
    // Retryable
    #[error("Assistant timed out after {0:?}")]
    SubprocessTimeout(Duration),

    #[error("Transport error ({class}): {detail}")]
    Transport { class: String, detail: String },

    // Fatal -- halt the run loop
    #[error("Backlog index unreadable at {0}")]
    IndexUnreadable(String),

    #[error("Failed to spawn assistant: {0}")]
    Spawn(String),

    #[error("Run lock held by another ralph instance: {0}")]
    LockHeld(String),

    // Skip -- log and continue
    #[error("Story not found: {0}")]
    StoryNotFound(String),

    #[error("No story available")]
    NoStory,

    #[error("Update queue malformed: {0}")]
    UpdateQueueMalformed(String),

    // Not an error in the usual sense; unwinds the loop gracefully
    #[error("Shutdown requested")]
    Interrupted,
}

impl RalphError {
    /// Returns true if the failure is transient and the same iteration
    /// should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RalphError::SubprocessTimeout(_) | RalphError::Transport { .. }
        )
    }

    /// Returns true if the error is unrecoverable and the run loop should
    /// halt.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RalphError::IndexUnreadable(_) | RalphError::Spawn(_) | RalphError::LockHeld(_)
        )
    }
}

/// Bridge: allows `?` to convert `RalphError` into `String` in code that
/// uses `Result<T, String>` surfaces (backlog, driver, runner).
impl From<RalphError> for String {
    fn from(err: RalphError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classes() {
        assert!(RalphError::SubprocessTimeout(Duration::from_secs(600)).is_retryable());
        assert!(RalphError::Transport {
            class: "connection_reset".to_string(),
            detail: "ECONNRESET".to_string(),
        }
        .is_retryable());
        assert!(!RalphError::Spawn("no such binary".to_string()).is_retryable());
        assert!(!RalphError::NoStory.is_retryable());
    }

    #[test]
    fn fatal_classes() {
        assert!(RalphError::IndexUnreadable("/tmp/prd".to_string()).is_fatal());
        assert!(RalphError::Spawn("denied".to_string()).is_fatal());
        assert!(!RalphError::StoryNotFound("US-1".to_string()).is_fatal());
        assert!(!RalphError::Interrupted.is_fatal());
    }

    #[test]
    fn string_bridge_preserves_message() {
        let s: String = RalphError::NoStory.into();
        assert_eq!(s, "No story available");
    }
}
