use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::{
    is_shutdown_requested, is_terminate_requested, kill_all_children, AgentRunner, Transport,
};
use crate::backlog;
use crate::classifier::ErrorClass;
use crate::driver::{self, IterationParams};
use crate::notify::{Notifier, NotifyPayload};
use crate::prompt::Composer;
use crate::status::StatusFile;
use crate::types::{IterationOutcome, IterationResult, RunnerState};
use crate::{log_error, log_info, log_warn};

/// Parameters for one run of the loop.
pub struct RunParams {
    /// Maximum number of assistant iterations.
    pub iterations: u32,
    /// Inter-iteration delay.
    pub gap_seconds: u64,
    pub model: String,
    pub working_dir: PathBuf,
    pub prd_dir: PathBuf,
    pub timeout: Duration,
    pub max_turns: Option<u32>,
    pub transport: Transport,
    pub terminal_size: Option<(u16, u16)>,
    /// Notification topic; empty disables the port.
    pub notify_topic: String,
    pub project_name: String,
    /// Status file location override (defaults to the well-known tmp path).
    pub status_path: Option<PathBuf>,
}

/// Why the loop stopped.
#[derive(Debug, PartialEq, Eq)]
pub enum HaltReason {
    /// Backlog drained (or the assistant promised PRD_COMPLETE).
    Complete,
    /// Pending empty, blocked non-empty (or an ALL_BLOCKED promise).
    AllBlocked,
    /// Iteration budget exhausted.
    MaxIterations,
    /// SIGINT/SIGTERM or caller cancellation.
    ShutdownRequested,
}

/// Result of a run, returned to the caller for summary display.
#[derive(Debug)]
pub struct RunSummary {
    pub iterations_run: u32,
    pub stories_completed: Vec<String>,
    pub halt_reason: HaltReason,
    pub results: Vec<IterationResult>,
}

/// Run the iteration loop to completion.
///
/// Emits `IterationResult`s in order on `results_tx` as they are produced
/// (the caller drains the channel), and returns them again in the summary.
///
/// Retry accounting: an error outcome whose class permits retry and whose
/// counter is under the class budget writes `retry` status, sleeps the
/// class cooldown, and repeats the same iteration number. A successful
/// iteration resets the counter. Exhausted budgets and non-retryable
/// errors log and advance to the next iteration.
pub async fn run_loop(
    params: RunParams,
    composer: &Composer,
    runner: Arc<impl AgentRunner>,
    notifier: Arc<dyn Notifier>,
    cancel: CancellationToken,
    results_tx: Option<mpsc::UnboundedSender<IterationResult>>,
) -> Result<RunSummary, String> {
    let mut status = StatusFile::create(params.status_path.clone(), &params.model);
    let notify = NotifySender {
        notifier,
        topic: params.notify_topic.clone(),
        project: params.project_name.clone(),
        model: params.model.clone(),
        prd_dir: params.prd_dir.clone(),
    };

    let mut iteration: u32 = 1;
    let mut retry_count: u32 = 0;
    let mut iterations_run: u32 = 0;
    let mut stories_completed: Vec<String> = Vec::new();
    let mut results: Vec<IterationResult> = Vec::new();

    log_info!(
        "Run loop started (iterations={}, gap={}s, model={})",
        params.iterations,
        params.gap_seconds,
        params.model
    );

    let halt_reason = 'outer: loop {
        if cancel.is_cancelled() || is_shutdown_requested() {
            break HaltReason::ShutdownRequested;
        }

        if iteration > params.iterations {
            log_info!("Iteration budget exhausted ({})", params.iterations);
            notify.max_iterations(iteration - 1, None);
            break HaltReason::MaxIterations;
        }

        let iteration_params = IterationParams {
            iteration,
            working_dir: &params.working_dir,
            prd_dir: &params.prd_dir,
            model: &params.model,
            timeout: params.timeout,
            max_turns: params.max_turns,
            transport: params.transport,
            terminal_size: params.terminal_size,
        };

        let driven = driver::run_iteration(
            &iteration_params,
            composer,
            runner.as_ref(),
            &mut status,
            &cancel,
        )
        .await;

        let mut result = driven.result;

        match driven.outcome {
            IterationOutcome::Complete => {
                emit(&results_tx, &mut results, result);
                notify.prd_complete(iteration, None);
                break HaltReason::Complete;
            }
            IterationOutcome::AllBlocked => {
                emit(&results_tx, &mut results, result);
                notify.blocked(iteration, None);
                break HaltReason::AllBlocked;
            }
            IterationOutcome::NoStory => {
                // Unreadable index or inconsistent state: fatal for this
                // iteration, not retryable. The next pass re-reads.
                log_error!(
                    "Iteration {}: {}",
                    iteration,
                    result.error.as_deref().unwrap_or("No story available")
                );
                notify.error(iteration, result.story_id.as_deref());
                emit(&results_tx, &mut results, result);
                iterations_run += 1;
                iteration += 1;
            }
            IterationOutcome::Blocked => {
                // Head story moved out of pending; the next iteration may
                // find a schedulable story or detect all-blocked.
                emit(&results_tx, &mut results, result);
            }
            IterationOutcome::Success => {
                retry_count = 0;
                iterations_run += 1;
                if let Some(id) = &result.story_id {
                    let completed_now = backlog::read_story(&params.prd_dir, id)
                        .map(|s| s.passes)
                        .unwrap_or(false);
                    if completed_now {
                        stories_completed.push(id.clone());
                    }
                }

                // Detect drain right after the iteration that emptied the
                // backlog so the loop stops without burning another slot.
                let drained = backlog::read_index(&params.prd_dir)
                    .map(|ix| ix.is_complete())
                    .unwrap_or(false);
                if drained {
                    result.has_complete = true;
                    emit(&results_tx, &mut results, result);
                    notify.prd_complete(iteration, None);
                    break HaltReason::Complete;
                }

                notify.iteration_complete(iteration, result.story_id.as_deref());
                emit(&results_tx, &mut results, result);
                iteration += 1;
            }
            IterationOutcome::Error(class_name) => {
                if class_name == "interrupted" {
                    emit(&results_tx, &mut results, result);
                    break HaltReason::ShutdownRequested;
                }

                let retryable = ErrorClass::from_name(&class_name);
                match retryable {
                    // retry_count + 1 is the attempt that just failed; the
                    // class budget bounds total attempts.
                    Some(class) if retry_count + 1 < class.max_retries() => {
                        retry_count += 1;
                        let backoff = class.backoff();
                        log_warn!(
                            "Iteration {}: {} (retry {}/{} in {}s)",
                            iteration,
                            result.error.as_deref().unwrap_or(class.name()),
                            retry_count,
                            class.max_retries(),
                            backoff.as_secs()
                        );
                        status.transition(
                            RunnerState::Retry,
                            iteration,
                            result.story_id.as_deref(),
                            result.error.as_deref(),
                            Some(backoff.as_secs()),
                        );
                        notify.retry(iteration, result.story_id.as_deref());
                        emit(&results_tx, &mut results, result);

                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = cancel.cancelled() => break 'outer HaltReason::ShutdownRequested,
                        }
                        // Same iteration number; the counter does not advance.
                        continue;
                    }
                    Some(class) => {
                        log_error!(
                            "Iteration {}: {} -- retries exhausted ({}), abandoning iteration",
                            iteration,
                            result.error.as_deref().unwrap_or(class.name()),
                            class.max_retries()
                        );
                        retry_count = 0;
                        notify.error(iteration, result.story_id.as_deref());
                        emit(&results_tx, &mut results, result);
                        iterations_run += 1;
                        iteration += 1;
                    }
                    None => {
                        // Spawn failures and other non-retryable classes.
                        log_error!(
                            "Iteration {}: {}",
                            iteration,
                            result.error.as_deref().unwrap_or("unknown error")
                        );
                        notify.error(iteration, result.story_id.as_deref());
                        emit(&results_tx, &mut results, result);
                        iterations_run += 1;
                        iteration += 1;
                    }
                }
            }
        }

        // Inter-iteration delay, interruptible by cancellation.
        if params.gap_seconds > 0 {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(params.gap_seconds)) => {}
                _ = cancel.cancelled() => break HaltReason::ShutdownRequested,
            }
        }
    };

    finalize_status(&mut status, &halt_reason, iteration);
    kill_all_children();

    match halt_reason {
        HaltReason::Complete | HaltReason::MaxIterations | HaltReason::AllBlocked => {
            status.remove();
        }
        HaltReason::ShutdownRequested => {
            // Leave the terminal state on disk for post-mortem observers.
        }
    }

    Ok(RunSummary {
        iterations_run,
        stories_completed,
        halt_reason,
        results,
    })
}

fn finalize_status(status: &mut StatusFile, halt_reason: &HaltReason, iteration: u32) {
    match halt_reason {
        HaltReason::Complete | HaltReason::MaxIterations => {
            status.transition(RunnerState::Complete, iteration, None, None, None);
        }
        HaltReason::AllBlocked => {
            status.transition(
                RunnerState::Error,
                iteration,
                None,
                Some("All stories blocked"),
                None,
            );
        }
        HaltReason::ShutdownRequested => {
            let state = if is_terminate_requested() {
                RunnerState::Terminated
            } else {
                RunnerState::Interrupted
            };
            status.transition(state, iteration, None, None, None);
        }
    }
}

fn emit(
    tx: &Option<mpsc::UnboundedSender<IterationResult>>,
    results: &mut Vec<IterationResult>,
    result: IterationResult,
) {
    if let Some(tx) = tx {
        let _ = tx.send(result.clone());
    }
    results.push(result);
}

/// Bundles the notifier with the per-run payload fields so call sites stay
/// small. Skips every event when no topic is configured.
struct NotifySender {
    notifier: Arc<dyn Notifier>,
    topic: String,
    project: String,
    model: String,
    prd_dir: PathBuf,
}

impl NotifySender {
    fn payload(&self, iteration: u32, story_id: Option<&str>, message: &str) -> NotifyPayload {
        let (pending, blocked) = backlog::read_index(&self.prd_dir)
            .map(|ix| (ix.pending.len(), ix.blocked.len()))
            .unwrap_or((0, 0));
        NotifyPayload {
            project: self.project.clone(),
            iteration,
            story_id: story_id.map(|s| s.to_string()),
            model: self.model.clone(),
            pending,
            blocked,
            message: message.to_string(),
        }
    }

    fn iteration_complete(&self, iteration: u32, story_id: Option<&str>) {
        if self.topic.is_empty() {
            return;
        }
        let payload = self.payload(iteration, story_id, "iteration finished");
        self.notifier.iteration_complete(&self.topic, &payload);
    }

    fn prd_complete(&self, iteration: u32, story_id: Option<&str>) {
        if self.topic.is_empty() {
            return;
        }
        let payload = self.payload(iteration, story_id, "all stories complete");
        self.notifier.prd_complete(&self.topic, &payload);
    }

    fn error(&self, iteration: u32, story_id: Option<&str>) {
        if self.topic.is_empty() {
            return;
        }
        let payload = self.payload(iteration, story_id, "iteration failed");
        self.notifier.error(&self.topic, &payload);
    }

    fn retry(&self, iteration: u32, story_id: Option<&str>) {
        if self.topic.is_empty() {
            return;
        }
        let payload = self.payload(iteration, story_id, "retrying after transient error");
        self.notifier.retry(&self.topic, &payload);
    }

    fn blocked(&self, iteration: u32, story_id: Option<&str>) {
        if self.topic.is_empty() {
            return;
        }
        let payload = self.payload(iteration, story_id, "no progress without intervention");
        self.notifier.blocked(&self.topic, &payload);
    }

    fn max_iterations(&self, iteration: u32, story_id: Option<&str>) {
        if self.topic.is_empty() {
            return;
        }
        let payload = self.payload(iteration, story_id, "iteration budget exhausted");
        self.notifier.max_iterations(&self.topic, &payload);
    }
}
