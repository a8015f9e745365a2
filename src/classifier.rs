use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

/// Authoritative completion marker emitted by the assistant.
pub const PROMISE_COMPLETE: &str = "<promise>PRD_COMPLETE</promise>";
/// Authoritative all-blocked marker emitted by the assistant.
pub const PROMISE_ALL_BLOCKED: &str = "<promise>ALL_BLOCKED</promise>";

/// Named family of transient errors with a bounded retry budget and
/// cooldown, matched in order of specificity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    NoMessages,
    ConnectionReset,
    Timeout,
    RateLimit,
    ServerError,
    Unknown,
}

impl ErrorClass {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorClass::NoMessages => "no_messages",
            ErrorClass::ConnectionReset => "connection_reset",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::ServerError => "server_error",
            ErrorClass::Unknown => "unknown",
        }
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            ErrorClass::NoMessages => 3,
            _ => 5,
        }
    }

    pub fn backoff(&self) -> Duration {
        match self {
            ErrorClass::NoMessages => Duration::from_secs(30),
            _ => Duration::from_secs(15),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "no_messages" => Some(ErrorClass::NoMessages),
            "connection_reset" => Some(ErrorClass::ConnectionReset),
            "timeout" => Some(ErrorClass::Timeout),
            "rate_limit" => Some(ErrorClass::RateLimit),
            "server_error" => Some(ErrorClass::ServerError),
            "unknown" => Some(ErrorClass::Unknown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Classification of one iteration's combined subprocess output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signals {
    pub has_complete: bool,
    pub has_blocked: bool,
    pub error: Option<ErrorClass>,
}

fn completion_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"\bPRD_COMPLETE\b").unwrap(),
            Regex::new(r"<PRD_COMPLETE>").unwrap(),
            Regex::new(r"(?i)all stories (are )?complete").unwrap(),
            Regex::new(r"(?i)\bPRD (is )?complete").unwrap(),
            // Final-story marker: a JSON `passes` flip in the output.
            Regex::new(r#""passes"\s*:\s*true"#).unwrap(),
        ]
    })
}

fn blocked_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?m)^\s*BLOCKED\s*$").unwrap(),
            Regex::new(r"<BLOCKED>").unwrap(),
            Regex::new(r"\bALL_BLOCKED\b").unwrap(),
            Regex::new(r"(?i)all stories (are )?blocked").unwrap(),
            Regex::new(r"(?i)story is blocked by").unwrap(),
            Regex::new(r"(?i)manual intervention required").unwrap(),
        ]
    })
}

struct ErrorPattern {
    class: ErrorClass,
    regex: Regex,
}

fn error_patterns() -> &'static [ErrorPattern] {
    static PATTERNS: OnceLock<Vec<ErrorPattern>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            ErrorPattern {
                class: ErrorClass::NoMessages,
                regex: Regex::new(r"(?i)no messages returned").unwrap(),
            },
            ErrorPattern {
                class: ErrorClass::ConnectionReset,
                regex: Regex::new(r"ECONNRESET|EAGAIN|(?i)fetch failed").unwrap(),
            },
            ErrorPattern {
                class: ErrorClass::Timeout,
                regex: Regex::new(r"ETIMEDOUT|(?i)socket hang up").unwrap(),
            },
            ErrorPattern {
                class: ErrorClass::RateLimit,
                regex: Regex::new(r"(?i)rate limit|overloaded").unwrap(),
            },
            ErrorPattern {
                class: ErrorClass::ServerError,
                regex: Regex::new(r"(?i)(?:error:?\s*|http[/ ]?|status(?:\s+code)?[:\s]+)5\d\d\b")
                    .unwrap(),
            },
            ErrorPattern {
                class: ErrorClass::Unknown,
                regex: Regex::new(r"\bError\b").unwrap(),
            },
        ]
    })
}

/// True when the text contains any completion signal.
pub fn has_completion_signal(text: &str) -> bool {
    text.contains(PROMISE_COMPLETE) || completion_patterns().iter().any(|p| p.is_match(text))
}

/// True when the text contains any blocked signal.
pub fn has_blocked_signal(text: &str) -> bool {
    text.contains(PROMISE_ALL_BLOCKED) || blocked_patterns().iter().any(|p| p.is_match(text))
}

/// True when the assistant emitted the authoritative PRD-complete tag.
pub fn has_complete_promise(text: &str) -> bool {
    text.contains(PROMISE_COMPLETE)
}

/// True when the assistant emitted the authoritative all-blocked tag.
pub fn has_blocked_promise(text: &str) -> bool {
    text.contains(PROMISE_ALL_BLOCKED)
}

/// Name the most specific retryable error class present in the text, if any.
pub fn classify_error(text: &str) -> Option<ErrorClass> {
    error_patterns()
        .iter()
        .find(|p| p.regex.is_match(text))
        .map(|p| p.class)
}

/// Scan combined stdout+stderr for completion, blocked, and error signals.
///
/// Classification is monotone: adding text never removes a signal that was
/// already present.
pub fn classify(text: &str) -> Signals {
    Signals {
        has_complete: has_completion_signal(text),
        has_blocked: has_blocked_signal(text),
        error: classify_error(text),
    }
}
