mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use ralph::agent::{MockAgentRunner, Transport};
use ralph::notify::testing::RecordingNotifier;
use ralph::notify::Notifier;
use ralph::prompt::{Composer, ProjectRegistry};
use ralph::runner::{run_loop, HaltReason, RunParams};
use ralph::status::read_status;
use ralph::types::{RunnerState, SpawnResult};

fn success(stdout: &str) -> Result<SpawnResult, String> {
    Ok(SpawnResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
        duration_ms: 10,
        session_id: None,
    })
}

fn failure(stderr: &str) -> Result<SpawnResult, String> {
    Ok(SpawnResult {
        exit_code: 1,
        stdout: String::new(),
        stderr: stderr.to_string(),
        duration_ms: 10,
        session_id: None,
    })
}

fn composer_for(workdir: &Path) -> Composer {
    Composer::with_registry(
        &workdir.join("contexts"),
        &workdir.join("prompts"),
        ProjectRegistry::default(),
    )
}

fn params_for(workdir: &Path, prd_dir: &Path, status_path: PathBuf, iterations: u32) -> RunParams {
    RunParams {
        iterations,
        gap_seconds: 0,
        model: "sonnet".to_string(),
        working_dir: workdir.to_path_buf(),
        prd_dir: prd_dir.to_path_buf(),
        timeout: Duration::from_secs(60),
        max_turns: None,
        transport: Transport::Pipe,
        terminal_size: None,
        notify_topic: "test".to_string(),
        project_name: "ralph-test".to_string(),
        status_path: Some(status_path),
    }
}

#[tokio::test]
async fn linear_drain_stops_after_exactly_two_iterations() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&["US-A", "US-B"], &[], &[]);
    let mut a = common::make_story("US-A");
    a.passes = true; // the assistant's file edit, pre-staged
    let mut b = common::make_story("US-B");
    b.passes = true;
    let prd = common::setup_prd_dir(&index, &[a, b]);

    let runner = Arc::new(MockAgentRunner::new(vec![
        success("finished US-A"),
        success("finished US-B"),
    ]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            10,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::Complete);
    assert_eq!(summary.iterations_run, 2);
    assert_eq!(summary.stories_completed, vec!["US-A", "US-B"]);
    assert_eq!(summary.results.len(), 2);
    assert!(summary.results[1].has_complete);
    assert!(recorder
        .event_names()
        .contains(&"prd-complete".to_string()));

    common::assert_invariants(prd.path());
}

#[tokio::test]
async fn budget_exhaustion_halts_with_max_iterations() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&["US-A"], &[], &[]);
    let prd = common::setup_prd_dir(&index, &[common::make_story("US-A")]);

    let runner = Arc::new(MockAgentRunner::new(vec![
        success("progress"),
        success("more progress"),
    ]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            2,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::MaxIterations);
    assert_eq!(summary.iterations_run, 2);
    assert!(summary.stories_completed.is_empty());
    assert!(recorder
        .event_names()
        .contains(&"max-iterations".to_string()));
}

#[tokio::test(start_paused = true)]
async fn retryable_error_repeats_iteration_until_budget_exhausted() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&["US-A"], &[], &[]);
    let prd = common::setup_prd_dir(&index, &[common::make_story("US-A")]);

    // connection_reset allows 5 attempts total
    let runner = Arc::new(MockAgentRunner::new(vec![
        failure("read ECONNRESET"),
        failure("read ECONNRESET"),
        failure("read ECONNRESET"),
        failure("read ECONNRESET"),
        failure("read ECONNRESET"),
    ]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            1,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::MaxIterations);
    assert_eq!(summary.results.len(), 5);
    // Retries repeat the same iteration number
    assert!(summary.results.iter().all(|r| r.iteration == 1));
    // 4 retries, then the attempt that exhausted the budget
    let events = recorder.event_names();
    assert_eq!(events.iter().filter(|e| *e == "retry").count(), 4);
    assert_eq!(events.iter().filter(|e| *e == "error").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_counter_resets_after_success() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&["US-A"], &[], &[]);
    let prd = common::setup_prd_dir(&index, &[common::make_story("US-A")]);

    // no_messages allows 3 attempts total; a success in between must reset
    // the counter so iteration 2 gets a fresh budget.
    let runner = Arc::new(MockAgentRunner::new(vec![
        failure("No messages returned"),
        success("progress"),
        failure("No messages returned"),
        failure("No messages returned"),
        failure("No messages returned"),
    ]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            2,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::MaxIterations);
    let iterations: Vec<u32> = summary.results.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![1, 1, 2, 2, 2]);
    // 1 retry before the success + 2 in iteration 2's fresh budget
    let events = recorder.event_names();
    assert_eq!(events.iter().filter(|e| *e == "retry").count(), 3);
}

#[tokio::test]
async fn missing_story_file_advances_without_retry() {
    let workdir = TempDir::new().unwrap();
    // The index schedules US-A but its story file does not exist.
    let index = common::make_index(&["US-A"], &[], &[]);
    let prd = common::setup_prd_dir(&index, &[]);

    // The assistant is never spawned; an unexpected retry would also hang
    // this (real-time) test on the class backoff sleep.
    let runner = Arc::new(MockAgentRunner::new(vec![]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            1,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::MaxIterations);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].iteration, 1);
    assert_eq!(
        summary.results[0].error.as_deref(),
        Some("Story not found: US-A")
    );

    let events = recorder.event_names();
    assert_eq!(events.iter().filter(|e| *e == "retry").count(), 0);
    assert_eq!(events.iter().filter(|e| *e == "error").count(), 1);
}

#[tokio::test]
async fn all_blocked_backlog_halts_and_notifies() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&[], &["US-A"], &[]);
    let prd = common::setup_prd_dir(&index, &[common::make_blocked_story("US-A", "stuck")]);

    let runner = Arc::new(MockAgentRunner::new(vec![]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            10,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::AllBlocked);
    assert_eq!(summary.results.len(), 1);
    assert!(summary.results[0].has_blocked);
    assert!(recorder.event_names().contains(&"blocked".to_string()));
}

#[tokio::test]
async fn pre_cancelled_token_stops_before_any_iteration() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&["US-A"], &[], &[]);
    let prd = common::setup_prd_dir(&index, &[common::make_story("US-A")]);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let status_path = workdir.path().join("status.json");
    let runner = Arc::new(MockAgentRunner::new(vec![]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(workdir.path(), prd.path(), status_path.clone(), 10),
        &composer_for(workdir.path()),
        runner,
        notifier,
        cancel,
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::ShutdownRequested);
    assert!(summary.results.is_empty());

    // Terminal state stays on disk for post-mortem observers
    let status = read_status(&status_path).unwrap();
    assert_eq!(status.state, RunnerState::Interrupted);
}

#[tokio::test]
async fn status_file_removed_on_clean_exit() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&[], &[], &[]);
    let prd = common::setup_prd_dir(&index, &[]);

    let status_path = workdir.path().join("status.json");
    let runner = Arc::new(MockAgentRunner::new(vec![]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(workdir.path(), prd.path(), status_path.clone(), 10),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    assert_eq!(summary.halt_reason, HaltReason::Complete);
    assert!(!status_path.exists());
}

#[tokio::test]
async fn results_stream_through_channel_in_order() {
    let workdir = TempDir::new().unwrap();
    let index = common::make_index(&["US-A"], &[], &[]);
    let mut a = common::make_story("US-A");
    a.passes = true;
    let prd = common::setup_prd_dir(&index, &[a]);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let runner = Arc::new(MockAgentRunner::new(vec![success("done")]));
    let recorder = Arc::new(RecordingNotifier::default());
    let notifier: Arc<dyn Notifier> = recorder.clone();

    let summary = run_loop(
        params_for(
            workdir.path(),
            prd.path(),
            workdir.path().join("status.json"),
            10,
        ),
        &composer_for(workdir.path()),
        runner,
        notifier,
        CancellationToken::new(),
        Some(tx),
    )
    .await
    .unwrap();

    let mut streamed = Vec::new();
    while let Ok(result) = rx.try_recv() {
        streamed.push(result);
    }
    assert_eq!(streamed, summary.results);
}
