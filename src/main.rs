use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ralph::agent::{install_signal_handlers, is_shutdown_requested, CliAgentRunner, Transport};
use ralph::backlog;
use ralph::config;
use ralph::lock;
use ralph::log::{parse_log_level, LogLevel};
use ralph::notify::{Notifier, NullNotifier, StderrNotifier};
use ralph::prompt::Composer;
use ralph::runner::{self, HaltReason, RunParams};
use ralph::status::read_status;
use ralph::{log_info, log_warn};

#[derive(Parser)]
#[command(name = "ralph", about = "Autonomous backlog iteration engine")]
struct Cli {
    /// Working directory the assistant operates in (defaults to current)
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Path to config file (defaults to {workdir}/ralph.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log verbosity level (quiet, error, warn, info, debug)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the iteration loop until the backlog drains or the budget ends
    Run {
        /// Maximum number of iterations (overrides config)
        #[arg(long)]
        iterations: Option<u32>,
        /// Seconds to sleep between iterations (overrides config)
        #[arg(long)]
        gap: Option<u64>,
        /// Model identifier (overrides config)
        #[arg(long)]
        model: Option<String>,
        /// Stream assistant output through a pseudo-terminal
        #[arg(long)]
        pty: bool,
        /// Suppress engine output (assistant output still streams in pty mode)
        #[arg(long, short)]
        quiet: bool,
    },
    /// Show backlog and live runner status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match parse_log_level(&cli.log_level) {
        Ok(level) => ralph::log::set_log_level(level),
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }

    let result = match cli.command {
        Commands::Run {
            iterations,
            gap,
            model,
            pty,
            quiet,
        } => {
            handle_run(
                &cli.workdir,
                cli.config.as_deref(),
                iterations,
                gap,
                model,
                pty,
                quiet,
            )
            .await
        }
        Commands::Status => handle_status(&cli.workdir, cli.config.as_deref()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn handle_run(
    workdir: &Path,
    config_path: Option<&Path>,
    iterations: Option<u32>,
    gap: Option<u64>,
    model: Option<String>,
    pty: bool,
    quiet: bool,
) -> Result<(), String> {
    if quiet {
        ralph::log::set_log_level(LogLevel::Quiet);
    }

    install_signal_handlers()?;

    log_info!("--- Ralph ---");
    log_info!("");

    // One engine per working directory
    log_info!("[pre] Acquiring run lock...");
    let runtime_dir = workdir.join(".ralph");
    let _lock = lock::try_acquire(&runtime_dir)?;

    let config = config::load_config_from(config_path, workdir)?;

    let model = model.unwrap_or_else(|| config.agent.model.clone());
    let iterations = iterations.unwrap_or(config.execution.iterations);
    let gap_seconds = gap.unwrap_or(config.execution.gap_seconds);
    let transport = if pty {
        Transport::Pty
    } else {
        config.execution.transport.into()
    };

    let prd_dir = config.prd_dir(workdir);
    let log_path = next_run_log_path(&runtime_dir);
    let agent_runner = Arc::new(CliAgentRunner::new(transport == Transport::Pty, Some(log_path)));

    log_info!("[pre] Verifying assistant CLI...");
    agent_runner.verify_backend_available(&model)?;

    let composer = Composer::new(
        &config.contexts_dir(workdir),
        &config.prompts_dir(workdir),
    )?;

    // Config summary
    log_info!("");
    log_info!("[config] Model: {}", model);
    log_info!(
        "[config] Execution: iterations={}, gap={}s, timeout={}min, transport={:?}",
        iterations,
        gap_seconds,
        config.execution.timeout_minutes,
        transport,
    );
    log_info!("[config] Backlog: {}", prd_dir.display());

    // Backlog summary
    if let Some(index) = backlog::read_index(&prd_dir) {
        log_info!(
            "[backlog] {} stories: {} pending, {} blocked, {} completed",
            index.story_order.len(),
            index.pending.len(),
            index.blocked.len(),
            index.completed.len(),
        );
        if let Some(next) = &index.next_story {
            log_info!("[backlog] Next up: {}", next);
        }
    } else {
        log_warn!("[backlog] No readable index at {}", prd_dir.display());
    }
    log_info!("");

    let notifier: Arc<dyn Notifier> = if config.notify.topic.is_empty() {
        Arc::new(NullNotifier)
    } else {
        Arc::new(StderrNotifier)
    };

    // Bridge the signal flag into a CancellationToken for in-flight work
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        loop {
            if is_shutdown_requested() {
                cancel_clone.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    let params = RunParams {
        iterations,
        gap_seconds,
        model,
        working_dir: workdir.to_path_buf(),
        prd_dir,
        timeout: Duration::from_secs(config.execution.timeout_minutes as u64 * 60),
        max_turns: config.max_turns(),
        transport,
        terminal_size: terminal_size_from_env(),
        notify_topic: config.notify.topic.clone(),
        project_name: config.project.name.clone(),
        status_path: None,
    };

    let summary = runner::run_loop(params, &composer, agent_runner, notifier, cancel, None).await?;

    log_info!("\n--- Run Summary ---");
    log_info!("Iterations run: {}", summary.iterations_run);
    if !summary.stories_completed.is_empty() {
        log_info!("Stories completed: {}", summary.stories_completed.join(", "));
    }
    log_info!("Halt reason: {:?}", summary.halt_reason);

    if summary.halt_reason == HaltReason::AllBlocked {
        log_warn!("All remaining stories are blocked; manual intervention required.");
    }

    Ok(())
}

fn handle_status(workdir: &Path, config_path: Option<&Path>) -> Result<(), String> {
    let config = config::load_config_from(config_path, workdir)?;
    let prd_dir = config.prd_dir(workdir);

    match backlog::read_index(&prd_dir) {
        Some(index) => {
            println!(
                "Backlog: {} stories ({} pending, {} blocked, {} completed)",
                index.story_order.len(),
                index.pending.len(),
                index.blocked.len(),
                index.completed.len(),
            );
            if let Some(next) = &index.next_story {
                match backlog::read_story(&prd_dir, next) {
                    Some(story) => {
                        let (checked, total) = backlog::criteria_progress(&story);
                        println!("Next: {} -- {} ({}/{} criteria)", next, story.title, checked, total);
                    }
                    None => println!("Next: {} (story file missing)", next),
                }
            }
            for id in &index.blocked {
                let reason = backlog::read_story(&prd_dir, id)
                    .and_then(|s| s.blocked_by)
                    .unwrap_or_else(|| "?".to_string());
                println!("Blocked: {} ({})", id, reason);
            }
        }
        None => println!("No readable backlog at {}", prd_dir.display()),
    }

    // Live runner status files from any ralph process on this host
    let mut found = false;
    if let Ok(entries) = std::fs::read_dir(std::env::temp_dir()) {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("ralph-status-") || !name.ends_with(".json") {
                continue;
            }
            if let Some(status) = read_status(&entry.path()) {
                found = true;
                println!(
                    "Runner (pid {}): {} iteration={} story={} model={}",
                    status.pid,
                    status.state,
                    status.iteration,
                    status.story_id.as_deref().unwrap_or("-"),
                    status.model,
                );
            }
        }
    }
    if !found {
        println!("No live runner.");
    }

    Ok(())
}

/// Per-run log file under `.ralph/logs/`, numbered by timestamp.
fn next_run_log_path(runtime_dir: &Path) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    runtime_dir.join("logs").join(format!("run-{}.log", stamp))
}

/// Caller's terminal size from the environment, for the pty transport.
fn terminal_size_from_env() -> Option<(u16, u16)> {
    let cols = std::env::var("COLUMNS").ok()?.parse().ok()?;
    let rows = std::env::var("LINES").ok()?.parse().ok()?;
    Some((cols, rows))
}
