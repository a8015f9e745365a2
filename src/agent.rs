use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, PtySize};

use crate::error::RalphError;
use crate::pipeline::{EventKind, OutputPipeline};
use crate::types::SpawnResult;
use crate::{log_debug, log_warn};

/// Maximum time to wait for graceful shutdown after SIGTERM before SIGKILL.
const SIGTERM_GRACE_PERIOD_MS: u64 = 500;

/// Polling interval when waiting for a process group to exit after SIGTERM.
const KILL_POLL_INTERVAL_MS: u64 = 50;

/// Default per-subprocess timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Fallback pty dimensions when the caller's terminal size is unknown.
const PTY_FALLBACK_COLS: u16 = 120;
const PTY_FALLBACK_ROWS: u16 = 40;

/// Global shutdown flag shared with signal handlers.
fn shutdown_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Set only by SIGTERM, so the final status can distinguish `terminated`
/// from `interrupted`.
fn terminate_flag() -> &'static Arc<AtomicBool> {
    static FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();
    FLAG.get_or_init(|| Arc::new(AtomicBool::new(false)))
}

/// Check if a shutdown has been requested via signal.
pub fn is_shutdown_requested() -> bool {
    shutdown_flag().load(Ordering::Relaxed)
}

/// Check if the shutdown came from SIGTERM rather than SIGINT.
pub fn is_terminate_requested() -> bool {
    terminate_flag().load(Ordering::Relaxed)
}

/// Install signal handlers for SIGTERM and SIGINT that set the shutdown flag.
///
/// Call once at program startup. Subsequent calls are safe (re-registers
/// handlers).
pub fn install_signal_handlers() -> Result<(), String> {
    let flag = Arc::clone(shutdown_flag());
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&flag))
        .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(
        signal_hook::consts::SIGTERM,
        Arc::clone(terminate_flag()),
    )
    .map_err(|e| format!("Failed to register SIGTERM handler: {}", e))?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, flag)
        .map_err(|e| format!("Failed to register SIGINT handler: {}", e))?;
    Ok(())
}

// --- Process Registry ---

/// Global registry of active child process group IDs.
///
/// Uses `std::sync::Mutex` (not tokio's) because operations are fast
/// (insert/remove/iterate) with no I/O under the lock.
fn process_registry() -> &'static Arc<std::sync::Mutex<HashSet<Pid>>> {
    static REGISTRY: OnceLock<Arc<std::sync::Mutex<HashSet<Pid>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Arc::new(std::sync::Mutex::new(HashSet::new())))
}

/// Register a child process group in the global registry.
pub fn register_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.insert(pgid);
    }
}

/// Unregister a child process group from the global registry.
pub fn unregister_child(pgid: Pid) {
    if let Ok(mut registry) = process_registry().lock() {
        registry.remove(&pgid);
    }
}

/// Kill all registered child process groups.
///
/// Sends SIGTERM to all registered PGIDs, waits for the grace window,
/// then SIGKILLs any survivors. Clears the registry when done.
pub fn kill_all_children() {
    use nix::sys::signal::{killpg, Signal};

    let pgids: Vec<Pid> = {
        let Ok(registry) = process_registry().lock() else {
            return;
        };
        registry.iter().copied().collect()
    };

    if pgids.is_empty() {
        return;
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + Duration::from_millis(SIGTERM_GRACE_PERIOD_MS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while Instant::now() < deadline {
        let all_gone = pgids
            .iter()
            .all(|&pgid| matches!(killpg(pgid, None), Err(nix::errno::Errno::ESRCH)));
        if all_gone {
            break;
        }
        std::thread::sleep(poll_interval);
    }

    for &pgid in &pgids {
        let _ = killpg(pgid, Signal::SIGKILL);
    }

    if let Ok(mut registry) = process_registry().lock() {
        registry.clear();
    }
}

/// Kill a process group by PID. Sends SIGTERM, polls through the graceful
/// window, then SIGKILL if still alive.
///
/// The blocking poll-and-sleep loop runs on the tokio blocking thread pool
/// via `spawn_blocking` to avoid stalling async worker threads.
async fn kill_process_group(pgid: i32) {
    tokio::task::spawn_blocking(move || kill_process_group_blocking(pgid))
        .await
        .unwrap_or_else(|e| log_warn!("kill_process_group task panicked: {}", e));
}

fn kill_process_group_blocking(pgid: i32) {
    use nix::sys::signal::{killpg, Signal};

    let pgid = Pid::from_raw(pgid);

    if let Err(nix::errno::Errno::ESRCH) = killpg(pgid, Signal::SIGTERM) {
        return; // already gone
    }

    let deadline = Instant::now() + Duration::from_millis(SIGTERM_GRACE_PERIOD_MS);
    let poll_interval = Duration::from_millis(KILL_POLL_INTERVAL_MS);

    while Instant::now() < deadline {
        // Signal 0 checks if the process group exists without sending one
        match killpg(pgid, None) {
            Err(nix::errno::Errno::ESRCH) => return,
            _ => std::thread::sleep(poll_interval),
        }
    }

    let _ = killpg(pgid, Signal::SIGKILL);
}

// --- Backend dispatch ---

/// Backend CLI families the supervisor knows how to exec. Selection is
/// purely by model identifier; no runtime probing beyond a PATH lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentBackend {
    Claude,
    OpenCode,
}

impl AgentBackend {
    /// Map a model identifier to its backend. Provider-qualified ids
    /// (`provider/model`) route to opencode; bare ids (`opus`, `sonnet`,
    /// `haiku`, ...) route to the primary backend.
    pub fn for_model(model: &str) -> Self {
        if model.contains('/') {
            AgentBackend::OpenCode
        } else {
            AgentBackend::Claude
        }
    }

    pub fn binary_name(&self) -> &'static str {
        match self {
            AgentBackend::Claude => "claude",
            AgentBackend::OpenCode => "opencode",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            AgentBackend::Claude => "Claude CLI",
            AgentBackend::OpenCode => "OpenCode CLI",
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            AgentBackend::Claude => "Install: https://docs.anthropic.com/en/docs/claude-code",
            AgentBackend::OpenCode => "Install: https://github.com/opencode-ai/opencode",
        }
    }

    pub fn version_args(&self) -> Vec<&'static str> {
        vec!["--version"]
    }

    /// Build the argument vector for one invocation. The story prompt is
    /// always the trailing payload.
    pub fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        match self {
            AgentBackend::Claude => {
                let mut args = vec![
                    "-p".to_string(),
                    "--dangerously-skip-permissions".to_string(),
                    "--model".to_string(),
                    invocation.model.clone(),
                ];
                if !invocation.system_context.is_empty() {
                    args.push("--append-system-prompt".to_string());
                    args.push(invocation.system_context.clone());
                }
                if let Some(n) = invocation.max_turns {
                    args.push("--max-turns".to_string());
                    args.push(n.to_string());
                }
                args.push(invocation.story_prompt.clone());
                args
            }
            AgentBackend::OpenCode => {
                let mut args = vec![
                    "run".to_string(),
                    "--model".to_string(),
                    invocation.model.clone(),
                    "--quiet".to_string(),
                ];
                args.push(invocation.story_prompt.clone());
                args
            }
        }
    }
}

/// Resolve a binary on PATH (a `which`-equivalent lookup). Performed at
/// spawn time; failure is a structured spawn error.
pub fn resolve_binary(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

// --- Invocation ---

/// Transport for one assistant run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Batched: stdout/stderr captured to pipes, returned on exit.
    #[default]
    Pipe,
    /// Streaming: attached to a pseudo-terminal, output forked through the
    /// display/log pipeline while still being captured.
    Pty,
}

/// Everything the supervisor needs to exec one assistant run.
#[derive(Debug, Clone)]
pub struct AgentInvocation {
    pub model: String,
    pub system_context: String,
    pub story_prompt: String,
    pub working_dir: PathBuf,
    pub max_turns: Option<u32>,
    pub transport: Transport,
    /// Caller's terminal size for pty mode; 120x40 fallback when absent.
    pub terminal_size: Option<(u16, u16)>,
}

/// Trait for running the assistant. Enables mocking in driver/runner tests.
pub trait AgentRunner: Send + Sync {
    fn run(
        &self,
        invocation: &AgentInvocation,
        timeout: Duration,
    ) -> impl std::future::Future<Output = Result<SpawnResult, String>> + Send;
}

/// Real implementation that spawns a backend CLI as a child process.
pub struct CliAgentRunner {
    /// Echo display batches to stdout in pty mode (the default live UI).
    pub echo_output: bool,
    /// Per-run log file for the escape-stripped stream, pty mode only.
    pub log_path: Option<PathBuf>,
}

impl CliAgentRunner {
    pub fn new(echo_output: bool, log_path: Option<PathBuf>) -> Self {
        Self {
            echo_output,
            log_path,
        }
    }

    /// Verify that the backend CLI for the given model is available on PATH.
    /// Fails fast before the loop starts.
    pub fn verify_backend_available(&self, model: &str) -> Result<(), String> {
        let backend = AgentBackend::for_model(model);
        let output = std::process::Command::new(backend.binary_name())
            .args(backend.version_args())
            .output()
            .map_err(|e| {
                format!(
                    "{} not found on PATH. {} ({})",
                    backend.display_name(),
                    backend.install_hint(),
                    e
                )
            })?;

        if !output.status.success() {
            return Err(format!(
                "{} found but `{} --version` failed",
                backend.display_name(),
                backend.binary_name()
            ));
        }

        Ok(())
    }
}

impl AgentRunner for CliAgentRunner {
    async fn run(
        &self,
        invocation: &AgentInvocation,
        timeout: Duration,
    ) -> Result<SpawnResult, String> {
        match invocation.transport {
            Transport::Pipe => run_pipe(invocation, timeout).await,
            Transport::Pty => {
                run_pty(
                    invocation.clone(),
                    timeout,
                    self.echo_output,
                    self.log_path.clone(),
                )
                .await
            }
        }
    }
}

// --- Pipe mode ---

/// Spawn the assistant with stdout/stderr captured to pipes and wait for
/// exit, enforcing the timeout. On expiry the process group is killed and
/// the result carries `exit_code = -1` with stderr replaced.
async fn run_pipe(invocation: &AgentInvocation, timeout: Duration) -> Result<SpawnResult, String> {
    let backend = AgentBackend::for_model(&invocation.model);
    let binary = resolve_binary(backend.binary_name()).ok_or_else(|| {
        String::from(RalphError::Spawn(format!(
            "{} not found on PATH. {}",
            backend.binary_name(),
            backend.install_hint()
        )))
    })?;

    let mut cmd = tokio::process::Command::new(binary);
    cmd.args(backend.build_args(invocation));
    cmd.current_dir(&invocation.working_dir);
    cmd.env("RALPH_NON_INTERACTIVE", "1");
    run_pipe_command(cmd, timeout).await
}

/// Spawn a configured command with stdout/stderr piped and supervise it to
/// exit. Shared by `run_pipe` and subprocess tests: the caller configures
/// the `Command` (program, args, cwd, env); this function owns stdio
/// wiring, process-group isolation, the timeout, and signal checking.
pub async fn run_pipe_command(
    mut cmd: tokio::process::Command,
    timeout: Duration,
) -> Result<SpawnResult, String> {
    cmd.stdin(std::process::Stdio::inherit());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    // SAFETY: pre_exec runs between fork() and exec() where only
    // async-signal-safe functions are permitted. setpgid is
    // async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                .map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let start = Instant::now();
    log_debug!("[agent] Spawning assistant...");
    let mut child = cmd
        .spawn()
        .map_err(|e| String::from(RalphError::Spawn(e.to_string())))?;

    let child_pid = child
        .id()
        .ok_or_else(|| "Failed to get child PID".to_string())? as i32;
    let pgid = Pid::from_raw(child_pid);
    log_debug!("[agent] Assistant spawned (pid={})", child_pid);
    register_child(pgid);

    // Drain the pipes concurrently so a chatty assistant can't fill them
    // and deadlock against wait().
    let stdout_task = child.stdout.take().map(read_to_string_task);
    let stderr_task = child.stderr.take().map(read_to_string_task);

    let mut interval = tokio::time::interval(Duration::from_millis(100));
    let deadline = start + timeout;

    let exit_status = loop {
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| {
                    unregister_child(pgid);
                    format!("Error waiting for assistant: {}", e)
                })?;
            }
            _ = interval.tick() => {
                if is_shutdown_requested() {
                    // Forward the signal, wait the graceful window, force.
                    kill_process_group(child_pid).await;
                    let _ = child.wait().await;
                    unregister_child(pgid);
                    return Err("Shutdown requested".to_string());
                }
                if Instant::now() >= deadline {
                    log_debug!(
                        "[agent] TIMEOUT after {}s -- killing process group",
                        timeout.as_secs()
                    );
                    kill_process_group(child_pid).await;
                    let _ = child.wait().await;
                    unregister_child(pgid);
                    let stdout = join_reader(stdout_task).await;
                    return Ok(SpawnResult {
                        exit_code: -1,
                        session_id: extract_session_id(&stdout),
                        stdout,
                        stderr: "Process timed out".to_string(),
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
        }
    };

    unregister_child(pgid);
    log_debug!("[agent] Assistant exited (status={:?})", exit_status.code());

    let stdout = join_reader(stdout_task).await;
    let stderr = join_reader(stderr_task).await;

    if is_shutdown_requested() {
        return Err("Shutdown requested".to_string());
    }

    Ok(SpawnResult {
        exit_code: exit_status.code().unwrap_or(-1),
        session_id: extract_session_id(&stdout),
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn read_to_string_task<R>(reader: R) -> tokio::task::JoinHandle<String>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    use tokio::io::AsyncReadExt;
    tokio::spawn(async move {
        let mut reader = reader;
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf).await;
        buf
    })
}

async fn join_reader(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(t) => t.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Pull a session id out of assistant output when present.
fn extract_session_id(output: &str) -> Option<String> {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| regex::Regex::new(r#""session_id"\s*:\s*"([^"]+)""#).unwrap());
    re.captures(output)
        .map(|caps| caps[1].to_string())
}

// --- Pty mode ---

/// Spawn the assistant attached to a pseudo-terminal, forking output
/// through the display/log pipeline. Required whenever output must flow to
/// a live UI while still being captured; preserves progress escape
/// sequences on the display stream.
async fn run_pty(
    invocation: AgentInvocation,
    timeout: Duration,
    echo_output: bool,
    log_path: Option<PathBuf>,
) -> Result<SpawnResult, String> {
    tokio::task::spawn_blocking(move || run_pty_blocking(&invocation, timeout, echo_output, log_path))
        .await
        .map_err(|e| format!("Pty task panicked: {}", e))?
}

fn run_pty_blocking(
    invocation: &AgentInvocation,
    timeout: Duration,
    echo_output: bool,
    log_path: Option<PathBuf>,
) -> Result<SpawnResult, String> {
    use std::io::Read;

    let backend = AgentBackend::for_model(&invocation.model);
    let binary = resolve_binary(backend.binary_name()).ok_or_else(|| {
        String::from(RalphError::Spawn(format!(
            "{} not found on PATH. {}",
            backend.binary_name(),
            backend.install_hint()
        )))
    })?;

    let (cols, rows) = invocation
        .terminal_size
        .unwrap_or((PTY_FALLBACK_COLS, PTY_FALLBACK_ROWS));

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| pty_error_with_hint("Failed to open pty", &e.to_string()))?;

    let mut cmd = CommandBuilder::new(binary);
    for arg in backend.build_args(invocation) {
        cmd.arg(arg);
    }
    cmd.cwd(&invocation.working_dir);
    cmd.env("RALPH_NON_INTERACTIVE", "1");

    let start = Instant::now();
    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| pty_error_with_hint("Failed to spawn assistant", &e.to_string()))?;
    drop(pair.slave);

    let pgid = child.process_id().map(|pid| Pid::from_raw(pid as i32));
    if let Some(pgid) = pgid {
        register_child(pgid);
    }

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("Failed to clone pty reader: {}", e))?;

    // Reader thread feeds raw chunks to the pipeline over a channel.
    let (tx, rx) = std::sync::mpsc::channel::<Vec<u8>>();
    let reader_thread = std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(n) if n > 0 => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let log_file = log_path.unwrap_or_else(|| std::env::temp_dir().join("ralph-run.log"));
    let display: crate::pipeline::DisplaySink = if echo_output {
        Box::new(|event| {
            use std::io::Write;
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(event.data.as_bytes());
            let _ = stdout.flush();
        })
    } else {
        Box::new(|_| {})
    };
    let mut pipeline = OutputPipeline::new(&log_file, display);

    let mut captured = crate::pipeline::AnsiStripper::new();
    let mut stripped_output = Vec::new();

    let deadline = start + timeout;
    let poll = Duration::from_millis(50);
    let mut exit_code: Option<i32> = None;
    let mut timed_out = false;
    let mut interrupted = false;

    loop {
        match rx.recv_timeout(poll) {
            Ok(chunk) => {
                pipeline.handle_chunk(&chunk);
                stripped_output.extend(captured.feed(&chunk));
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                pipeline.tick();
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                // Reader closed: the child's side of the pty is gone.
                let status = child
                    .wait()
                    .map_err(|e| format!("Error waiting for assistant: {}", e))?;
                exit_code = Some(status.exit_code() as i32);
                break;
            }
        }

        if is_shutdown_requested() {
            interrupted = true;
            if let Some(pgid) = pgid {
                kill_process_group_blocking(pgid.as_raw());
            } else {
                let _ = child.kill();
            }
            let _ = child.wait();
            break;
        }

        if Instant::now() >= deadline {
            timed_out = true;
            if let Some(pgid) = pgid {
                kill_process_group_blocking(pgid.as_raw());
            } else {
                let _ = child.kill();
            }
            let _ = child.wait();
            break;
        }

        if let Ok(Some(status)) = child.try_wait() {
            // Drain whatever the reader still has buffered.
            while let Ok(chunk) = rx.recv_timeout(Duration::from_millis(20)) {
                pipeline.handle_chunk(&chunk);
                stripped_output.extend(captured.feed(&chunk));
            }
            exit_code = Some(status.exit_code() as i32);
            break;
        }
    }

    drop(pair.master);
    let _ = reader_thread.join();
    if let Some(pgid) = pgid {
        unregister_child(pgid);
    }

    let stdout = String::from_utf8_lossy(&stripped_output).into_owned();
    let duration_ms = start.elapsed().as_millis() as u64;

    if interrupted {
        pipeline.finish(EventKind::Error, "interrupted");
        return Err("Shutdown requested".to_string());
    }

    if timed_out {
        pipeline.finish(EventKind::Error, "timeout");
        return Ok(SpawnResult {
            exit_code: -1,
            session_id: extract_session_id(&stdout),
            stdout,
            stderr: "Process timed out".to_string(),
            duration_ms,
        });
    }

    let exit_code = exit_code.unwrap_or(-1);
    pipeline.finish(EventKind::Exit, &exit_code.to_string());

    Ok(SpawnResult {
        exit_code,
        session_id: extract_session_id(&stdout),
        stdout,
        stderr: String::new(),
        duration_ms,
    })
}

/// Shape a pty spawn failure, adding a hint when the host runtime is known
/// to be incompatible with the pty backend.
fn pty_error_with_hint(context: &str, detail: &str) -> String {
    let mut message = format!("{}: {}", context, detail);
    if detail.contains("not supported") || detail.contains("ENOSYS") {
        message.push_str(". The pty transport is unavailable on this host; retry with the pipe transport");
    }
    message
}

// --- Mock runner ---

/// Mock agent runner for driver and run-loop tests.
///
/// Returns predefined results from a configurable sequence. Each call to
/// `run` returns the next result in the sequence.
pub struct MockAgentRunner {
    results: tokio::sync::Mutex<Vec<Result<SpawnResult, String>>>,
}

impl MockAgentRunner {
    /// Create a new mock with a sequence of results to return.
    ///
    /// Results are returned in order (first call gets first result, etc.).
    pub fn new(results: Vec<Result<SpawnResult, String>>) -> Self {
        let mut reversed = results;
        reversed.reverse();
        Self {
            results: tokio::sync::Mutex::new(reversed),
        }
    }
}

impl AgentRunner for MockAgentRunner {
    async fn run(
        &self,
        _invocation: &AgentInvocation,
        _timeout: Duration,
    ) -> Result<SpawnResult, String> {
        let mut results = self.results.lock().await;
        results
            .pop()
            .unwrap_or_else(|| Err("MockAgentRunner: no more results in sequence".to_string()))
    }
}
