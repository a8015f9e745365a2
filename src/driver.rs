use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::{AgentInvocation, AgentRunner, Transport};
use crate::backlog::{self, AutoBlockResolution};
use crate::classifier::{self, ErrorClass};
use crate::error::RalphError;
use crate::prompt::{ComposeParams, Composer};
use crate::status::StatusFile;
use crate::types::{
    story_type_prefix, IterationOutcome, IterationResult, RunnerState, SpawnResult,
};
use crate::{log_debug, log_info, log_warn};

/// Story type prefixes that publish `cr_review` instead of `running`.
const REVIEW_PREFIXES: &[&str] = &["AUDIT"];

/// Inputs for one driver iteration.
pub struct IterationParams<'a> {
    pub iteration: u32,
    pub working_dir: &'a Path,
    pub prd_dir: &'a Path,
    pub model: &'a str,
    pub timeout: Duration,
    pub max_turns: Option<u32>,
    pub transport: Transport,
    pub terminal_size: Option<(u16, u16)>,
}

/// What one iteration produced: the observer-facing result plus the
/// classified outcome the run loop dispatches on.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverOutcome {
    pub result: IterationResult,
    pub outcome: IterationOutcome,
}

fn result_for(
    iteration: u32,
    story_id: Option<&str>,
    success: bool,
    has_complete: bool,
    has_blocked: bool,
    duration_ms: u64,
    error: Option<String>,
) -> IterationResult {
    IterationResult {
        iteration,
        story_id: story_id.map(|s| s.to_string()),
        success,
        has_complete,
        has_blocked,
        duration_ms,
        error,
    }
}

/// Run one full iteration: merge the update queue, choose the head story,
/// compose prompts, supervise the assistant, classify its output, and
/// persist any resulting backlog transition.
///
/// The driver never mutates acceptance-criteria `checked` flags; those are
/// edited by the assistant inside the working directory. The only
/// transitions persisted here go through `complete_story`,
/// `auto_block_story_if_needed`, and the update queue.
pub async fn run_iteration(
    params: &IterationParams<'_>,
    composer: &Composer,
    runner: &impl AgentRunner,
    status: &mut StatusFile,
    cancel: &CancellationToken,
) -> DriverOutcome {
    let iteration = params.iteration;

    // Missing backlog directory: an empty backlog, complete on first touch.
    if !params.prd_dir.exists() {
        return DriverOutcome {
            result: result_for(iteration, None, true, true, false, 0, None),
            outcome: IterationOutcome::Complete,
        };
    }

    // Merge any peer-written update document before choosing work.
    let update = backlog::apply_update_queue(params.prd_dir);
    for change in &update.changes {
        if change.starts_with("Error:") {
            log_warn!("[update-queue] {}", change);
        } else {
            log_info!("[update-queue] {}", change);
        }
    }

    let Some(index) = backlog::read_index(params.prd_dir) else {
        return DriverOutcome {
            result: result_for(
                iteration,
                None,
                false,
                false,
                false,
                0,
                Some(RalphError::NoStory.into()),
            ),
            outcome: IterationOutcome::NoStory,
        };
    };

    if index.is_complete() {
        return DriverOutcome {
            result: result_for(iteration, None, true, true, false, 0, None),
            outcome: IterationOutcome::Complete,
        };
    }

    let Some(story_id) = index.next_story.clone() else {
        if index.is_all_blocked() {
            return DriverOutcome {
                result: result_for(iteration, None, false, false, true, 0, None),
                outcome: IterationOutcome::AllBlocked,
            };
        }
        return DriverOutcome {
            result: result_for(
                iteration,
                None,
                false,
                false,
                false,
                0,
                Some(RalphError::NoStory.into()),
            ),
            outcome: IterationOutcome::NoStory,
        };
    };

    let Some(mut story) = backlog::read_story(params.prd_dir, &story_id) else {
        // Missing or unparseable story file: fatal for this iteration, no
        // mutation, never retried. The tag must not name a retry class.
        return DriverOutcome {
            result: result_for(
                iteration,
                Some(&story_id),
                false,
                false,
                false,
                0,
                Some(RalphError::StoryNotFound(story_id.clone()).into()),
            ),
            outcome: IterationOutcome::Error("story_not_found".to_string()),
        };
    };

    // Head story carries a live blocker while still in pending: resolve.
    if story.blocked_by.is_some() {
        match backlog::auto_block_story_if_needed(params.prd_dir, &story_id) {
            Ok(AutoBlockResolution::Blocked) => {
                log_info!(
                    "[{}] Blocked on {} -- moved out of pending",
                    story_id,
                    story.blocked_by.as_deref().unwrap_or("?")
                );
                return DriverOutcome {
                    result: result_for(iteration, Some(&story_id), false, false, true, 0, None),
                    outcome: IterationOutcome::Blocked,
                };
            }
            Ok(AutoBlockResolution::Unblocked) => {
                // Blocker already satisfied: refresh the head story.
                if let Some(refreshed) = backlog::read_story(params.prd_dir, &story_id) {
                    story = refreshed;
                }
            }
            Err(e) => {
                return DriverOutcome {
                    result: result_for(
                        iteration,
                        Some(&story_id),
                        false,
                        false,
                        false,
                        0,
                        Some(e),
                    ),
                    outcome: IterationOutcome::Error("backlog_error".to_string()),
                };
            }
        }
    }

    status.transition(
        runner_state_for_story(&story_id),
        iteration,
        Some(&story_id),
        None,
        None,
    );

    let (checked, total) = backlog::criteria_progress(&story);
    log_info!(
        "[{}] Iteration {}: {} ({}/{} criteria)",
        story_id,
        iteration,
        story.title,
        checked,
        total
    );

    let composed = composer.compose(&ComposeParams {
        story_id: &story_id,
        model: params.model,
        working_dir: params.working_dir,
        prd_dir: params.prd_dir,
        extra_contexts: &[],
    });

    let invocation = AgentInvocation {
        model: params.model.to_string(),
        system_context: composed.system_context,
        story_prompt: composed.story_prompt,
        working_dir: params.working_dir.to_path_buf(),
        max_turns: params.max_turns,
        transport: params.transport,
        terminal_size: params.terminal_size,
    };

    log_debug!("[{}] Spawning assistant (model: {})", story_id, params.model);

    // The supervisor owns graceful shutdown: it polls the signal flag and
    // terminates the process group through the SIGTERM window. The run must
    // be awaited to completion, never dropped mid-flight; the token only
    // shapes the outcome afterwards.
    let spawn_result = runner.run(&invocation, params.timeout).await;

    let spawn = match spawn_result {
        Ok(s) => s,
        Err(e) if e.contains("Shutdown requested") || cancel.is_cancelled() => {
            return DriverOutcome {
                result: result_for(
                    iteration,
                    Some(&story_id),
                    false,
                    false,
                    false,
                    0,
                    Some("Interrupted".to_string()),
                ),
                outcome: IterationOutcome::Error("interrupted".to_string()),
            };
        }
        Err(e) => {
            // Spawn failure: non-retryable, fatal for this iteration.
            return DriverOutcome {
                result: result_for(iteration, Some(&story_id), false, false, false, 0, Some(e)),
                outcome: IterationOutcome::Error("spawn".to_string()),
            };
        }
    };

    apply_spawn_outcome(params, &story_id, spawn)
}

/// Fold a finished subprocess run into the iteration outcome, persisting
/// the completion transition when the assistant marked the story passing.
fn apply_spawn_outcome(
    params: &IterationParams<'_>,
    story_id: &str,
    spawn: SpawnResult,
) -> DriverOutcome {
    let iteration = params.iteration;
    let combined = spawn.combined_output();
    let signals = classifier::classify(&combined);

    // Promise tags are authoritative and override the exit code.
    if classifier::has_complete_promise(&combined) {
        persist_completion_if_passing(params, story_id);
        return DriverOutcome {
            result: result_for(
                iteration,
                Some(story_id),
                true,
                true,
                signals.has_blocked,
                spawn.duration_ms,
                None,
            ),
            outcome: IterationOutcome::Complete,
        };
    }
    if classifier::has_blocked_promise(&combined) {
        return DriverOutcome {
            result: result_for(
                iteration,
                Some(story_id),
                spawn.exit_code == 0,
                signals.has_complete,
                true,
                spawn.duration_ms,
                None,
            ),
            outcome: IterationOutcome::AllBlocked,
        };
    }

    if spawn.exit_code == 0 {
        persist_completion_if_passing(params, story_id);
        return DriverOutcome {
            result: result_for(
                iteration,
                Some(story_id),
                true,
                signals.has_complete,
                signals.has_blocked,
                spawn.duration_ms,
                None,
            ),
            outcome: IterationOutcome::Success,
        };
    }

    // Failed run: name the retry class. Timeouts arrive as exit -1 with a
    // sentinel stderr.
    let class = if spawn.exit_code == -1 && spawn.stderr.contains("timed out") {
        ErrorClass::Timeout
    } else {
        classifier::classify_error(&combined).unwrap_or(ErrorClass::Unknown)
    };

    DriverOutcome {
        result: result_for(
            iteration,
            Some(story_id),
            false,
            signals.has_complete,
            signals.has_blocked,
            spawn.duration_ms,
            Some(format!(
                "{}: assistant exited with code {}",
                class.name(),
                spawn.exit_code
            )),
        ),
        outcome: IterationOutcome::Error(class.name().to_string()),
    }
}

/// Re-read the story and persist `complete_story` when the assistant set
/// `passes`. The re-read keeps assistant-side edits; the engine's rewrite
/// wins last-writer on the fields it sets.
fn persist_completion_if_passing(params: &IterationParams<'_>, story_id: &str) {
    let Some(latest) = backlog::read_story(params.prd_dir, story_id) else {
        return;
    };
    if !latest.passes {
        return;
    }
    if let Err(e) = backlog::complete_story(params.prd_dir, story_id, params.model) {
        log_warn!("[{}] Failed to persist completion: {}", story_id, e);
    } else {
        log_info!("[{}] Story complete", story_id);
    }
}

fn runner_state_for_story(story_id: &str) -> RunnerState {
    if REVIEW_PREFIXES.contains(&story_type_prefix(story_id)) {
        RunnerState::CrReview
    } else {
        RunnerState::Running
    }
}
