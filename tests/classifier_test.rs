use ralph::classifier::{
    classify, classify_error, has_blocked_promise, has_blocked_signal, has_complete_promise,
    has_completion_signal, ErrorClass,
};

// =============================================================================
// Completion signals
// =============================================================================

#[test]
fn completion_token_as_word() {
    assert!(has_completion_signal("final state: PRD_COMPLETE"));
    assert!(has_completion_signal("<PRD_COMPLETE>"));
}

#[test]
fn completion_token_not_inside_identifier() {
    assert!(!has_completion_signal("NOT_A_PRD_COMPLETEX marker"));
}

#[test]
fn completion_phrases() {
    assert!(has_completion_signal("All stories are complete."));
    assert!(has_completion_signal("all stories complete"));
    assert!(has_completion_signal("The PRD is complete"));
    assert!(has_completion_signal("PRD complete"));
}

#[test]
fn completion_json_passes_marker() {
    assert!(has_completion_signal(r#"wrote {"passes": true} to disk"#));
    assert!(has_completion_signal(r#""passes":true"#));
    assert!(!has_completion_signal(r#""passes": false"#));
}

#[test]
fn plain_output_has_no_completion() {
    assert!(!has_completion_signal("working on US-001, 2/5 criteria"));
}

// =============================================================================
// Blocked signals
// =============================================================================

#[test]
fn blocked_alone_on_line() {
    assert!(has_blocked_signal("progress so far\nBLOCKED\nmore text"));
    assert!(has_blocked_signal("  BLOCKED  \n"));
}

#[test]
fn blocked_embedded_in_line_is_not_a_signal() {
    assert!(!has_blocked_signal("the task was BLOCKED by something"));
}

#[test]
fn blocked_tags_and_tokens() {
    assert!(has_blocked_signal("<BLOCKED>"));
    assert!(has_blocked_signal("status: ALL_BLOCKED"));
}

#[test]
fn blocked_phrases() {
    assert!(has_blocked_signal("All stories are blocked"));
    assert!(has_blocked_signal("this story is blocked by US-003"));
    assert!(has_blocked_signal("Manual intervention required"));
}

// =============================================================================
// Promise tags
// =============================================================================

#[test]
fn promise_tags_are_exact() {
    assert!(has_complete_promise("done <promise>PRD_COMPLETE</promise>"));
    assert!(has_blocked_promise("<promise>ALL_BLOCKED</promise>"));
    assert!(!has_complete_promise("<promise>ALL_BLOCKED</promise>"));
    assert!(!has_blocked_promise("<promise>PRD_COMPLETE</promise>"));
}

#[test]
fn promise_tags_imply_signals() {
    assert!(has_completion_signal("<promise>PRD_COMPLETE</promise>"));
    assert!(has_blocked_signal("<promise>ALL_BLOCKED</promise>"));
}

// =============================================================================
// Error classes
// =============================================================================

#[test]
fn error_class_patterns() {
    assert_eq!(
        classify_error("API Error: No messages returned"),
        Some(ErrorClass::NoMessages)
    );
    assert_eq!(
        classify_error("read ECONNRESET"),
        Some(ErrorClass::ConnectionReset)
    );
    assert_eq!(
        classify_error("fetch failed after 3 attempts"),
        Some(ErrorClass::ConnectionReset)
    );
    assert_eq!(classify_error("ETIMEDOUT"), Some(ErrorClass::Timeout));
    assert_eq!(
        classify_error("socket hang up"),
        Some(ErrorClass::Timeout)
    );
    assert_eq!(
        classify_error("429 rate limit exceeded"),
        Some(ErrorClass::RateLimit)
    );
    assert_eq!(
        classify_error("the API is overloaded"),
        Some(ErrorClass::RateLimit)
    );
    assert_eq!(
        classify_error("Error: 503 Service Unavailable"),
        Some(ErrorClass::ServerError)
    );
    assert_eq!(
        classify_error("status: 502"),
        Some(ErrorClass::ServerError)
    );
    assert_eq!(
        classify_error("Error: something else went wrong"),
        Some(ErrorClass::Unknown)
    );
    assert_eq!(classify_error("all fine here"), None);
}

#[test]
fn error_classes_match_in_specificity_order() {
    // no_messages wins over connection_reset when both are present
    assert_eq!(
        classify_error("No messages returned; read ECONNRESET"),
        Some(ErrorClass::NoMessages)
    );
    // a named transport class wins over the generic Error fallback
    assert_eq!(
        classify_error("Error: read ECONNRESET"),
        Some(ErrorClass::ConnectionReset)
    );
}

#[test]
fn retry_budgets_per_class() {
    assert_eq!(ErrorClass::NoMessages.max_retries(), 3);
    assert_eq!(ErrorClass::NoMessages.backoff().as_secs(), 30);
    for class in [
        ErrorClass::ConnectionReset,
        ErrorClass::Timeout,
        ErrorClass::RateLimit,
        ErrorClass::ServerError,
        ErrorClass::Unknown,
    ] {
        assert_eq!(class.max_retries(), 5);
        assert_eq!(class.backoff().as_secs(), 15);
    }
}

// =============================================================================
// Monotonicity: adding text never removes a previously-true signal
// =============================================================================

#[test]
fn classification_is_monotone_over_appended_text() {
    let bases = [
        "PRD_COMPLETE\n",
        "<promise>ALL_BLOCKED</promise>\n",
        "BLOCKED\n",
        "read ECONNRESET\n",
        "All stories are complete\n",
    ];
    let suffixes = ["", "more output\n", "Error: 503\n", "BLOCKED\nPRD_COMPLETE\n"];

    for base in bases {
        let before = classify(base);
        for suffix in suffixes {
            let after = classify(&format!("{}{}", base, suffix));
            if before.has_complete {
                assert!(after.has_complete, "lost completion: {:?}+{:?}", base, suffix);
            }
            if before.has_blocked {
                assert!(after.has_blocked, "lost blocked: {:?}+{:?}", base, suffix);
            }
            if before.error.is_some() {
                assert!(after.error.is_some(), "lost error: {:?}+{:?}", base, suffix);
            }
        }
    }
}
