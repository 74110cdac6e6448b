//! Agent session runner.
//!
//! Owns exactly one agent subprocess per invocation, tees its stream-json
//! stdout to an on-disk NDJSON log, and synthesizes a terminal
//! [`SessionResult`] once both the output stream has closed and the process
//! has exited.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// How long after process exit the reader may keep the stream open before
/// the watchdog force-closes it. Some platforms fail to deliver EOF.
const STREAM_CLOSE_WATCHDOG: Duration = Duration::from_secs(10);

/// Grace period between the polite and the forceful kill signal.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Result subtypes the runner can produce.
pub const SUBTYPE_SUCCESS: &str = "success";
pub const SUBTYPE_PROCESS_ERROR: &str = "process_error";

/// Terminal outcome of one agent session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    /// `success`, `error_max_turns`, `error_during_execution`,
    /// `process_error`, or whatever subtype the agent reported.
    pub subtype: String,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub output_summary: String,
    pub session_id: Option<String>,
    pub exit_code: Option<i32>,
}

impl SessionResult {
    pub fn is_success(&self) -> bool {
        self.subtype == SUBTYPE_SUCCESS
    }

    fn process_error(summary: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            subtype: SUBTYPE_PROCESS_ERROR.to_string(),
            cost_usd: None,
            num_turns: None,
            output_summary: summary.into(),
            session_id: None,
            exit_code,
        }
    }
}

/// Inputs for spawning one agent session.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub prompt: String,
    pub worktree_path: PathBuf,
    pub max_turns: u32,
    pub invocation_id: i64,
    /// Orca's own root; the NDJSON log lands at `<root>/logs/<id>.ndjson`.
    pub project_root: PathBuf,
    /// Path or name of the agent executable.
    pub executable: String,
    pub system_prompt_suffix: Option<String>,
    pub disallowed_tools: Vec<String>,
    /// Resume an earlier session instead of starting fresh.
    pub resume_session_id: Option<String>,
    /// When set, the agent's cached per-project settings for this repo and
    /// its sibling worktrees are erased before launch.
    pub repo_path: Option<PathBuf>,
}

/// Shared mutable session state between the handle and the driver task.
#[derive(Debug, Default)]
struct SessionState {
    session_id: std::sync::Mutex<Option<String>>,
    killed: AtomicBool,
}

/// What the stream parser has accumulated so far.
#[derive(Debug, Default)]
struct StreamOutcome {
    result_received: bool,
    subtype: String,
    cost_usd: Option<f64>,
    num_turns: Option<i64>,
    summary: String,
}

/// Live reference to a running agent subprocess.
///
/// Cheap to clone; all clones observe the same session. `done` semantics:
/// [`SessionHandle::wait_done`] resolves exactly once per session with the
/// final result and is safe to await from any number of clones.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub invocation_id: i64,
    pid: Option<u32>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    state: Arc<SessionState>,
    done_rx: watch::Receiver<Option<SessionResult>>,
}

impl SessionHandle {
    /// The agent-reported session identifier, once discovered.
    pub fn session_id(&self) -> Option<String> {
        self.state
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// The final result if the session has already ended.
    pub fn result(&self) -> Option<SessionResult> {
        self.done_rx.borrow().clone()
    }

    /// Wait for the session to end. Resolves exactly once per session.
    pub async fn wait_done(&self) -> SessionResult {
        let mut rx = self.done_rx.clone();
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                // Driver task died without reporting; synthesize a failure so
                // callers still resolve.
                return SessionResult::process_error("session driver disappeared", None);
            }
        }
    }

    /// Two-phase termination: polite signal, 5-second grace, forceful
    /// signal. Returns the final result either way.
    pub async fn kill(&self) -> SessionResult {
        if let Some(result) = self.result() {
            return result;
        }

        self.state.killed.store(true, Ordering::Relaxed);
        self.signal(Signal::Term);

        match tokio::time::timeout(KILL_GRACE, self.wait_done()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    invocation_id = self.invocation_id,
                    "agent ignored polite termination, killing"
                );
                self.signal(Signal::Kill);
                self.wait_done().await
            }
        }
    }

    /// Send a new user turn to the running session's stdin.
    ///
    /// Returns false when the session has ended, was killed, or its stdin
    /// is gone. Write failures also return false and drop the pipe so a
    /// broken pipe can never surface later as an unhandled error.
    pub async fn prompt(&self, text: &str) -> bool {
        if self.result().is_some() || self.state.killed.load(Ordering::Relaxed) {
            return false;
        }

        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return false;
        };

        let line = serde_json::json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        })
        .to_string();

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };

        match write.await {
            Ok(()) => true,
            Err(e) => {
                warn!(invocation_id = self.invocation_id, error = %e, "failed to write user prompt to agent stdin");
                *guard = None;
                false
            }
        }
    }

    fn signal(&self, signal: Signal) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            let signo = match signal {
                Signal::Term => libc::SIGTERM,
                Signal::Kill => libc::SIGKILL,
            };
            // SAFETY: pid came from a child this process spawned.
            let ret = unsafe { libc::kill(pid as i32, signo) };
            if ret != 0 {
                debug!(pid, signo, "signal delivery failed (process already gone?)");
            }
        }
        #[cfg(not(unix))]
        let _ = signal;
    }
}

enum Signal {
    Term,
    Kill,
}

/// Launch an agent session.
///
/// Never fails: spawn errors produce a handle whose `done` has already
/// resolved with a `process_error` result, so the caller's completion path
/// is uniform.
pub fn spawn_session(req: SpawnRequest) -> SessionHandle {
    let state = Arc::new(SessionState::default());
    let stdin_slot = Arc::new(Mutex::new(None));
    let (done_tx, done_rx) = watch::channel(None::<SessionResult>);

    let handle_template = |pid| SessionHandle {
        invocation_id: req.invocation_id,
        pid,
        stdin: Arc::clone(&stdin_slot),
        state: Arc::clone(&state),
        done_rx: done_rx.clone(),
    };

    let log_file = match open_log_file(&req.project_root, req.invocation_id) {
        Ok(file) => file,
        Err(e) => {
            let _ = done_tx.send(Some(SessionResult::process_error(
                format!("spawn error: {e}"),
                None,
            )));
            return handle_template(None);
        }
    };

    if let Some(ref repo) = req.repo_path {
        clear_project_settings_cache(repo);
    }

    let mut cmd = Command::new(&req.executable);
    if let Some(ref session) = req.resume_session_id {
        cmd.arg("--resume").arg(session);
    }
    cmd.arg("-p")
        .arg(&req.prompt)
        .arg("--output-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--max-turns")
        .arg(req.max_turns.to_string())
        .arg("--dangerously-skip-permissions");
    if let Some(ref suffix) = req.system_prompt_suffix {
        cmd.arg("--append-system-prompt").arg(suffix);
    }
    if !req.disallowed_tools.is_empty() {
        cmd.arg("--disallowedTools")
            .arg(req.disallowed_tools.join(","));
    }

    cmd.current_dir(&req.worktree_path);
    // The agent refuses to start when it believes it is nested inside
    // another session of itself.
    cmd.env_remove("CLAUDECODE");
    cmd.env_remove("CLAUDE_CODE_ENTRYPOINT");

    cmd.stdin(std::process::Stdio::piped());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::null());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let _ = done_tx.send(Some(SessionResult::process_error(
                format!("spawn error: {e}"),
                None,
            )));
            return handle_template(None);
        }
    };

    let pid = child.id();
    let stdout = child.stdout.take();
    {
        // The slot is freshly created and unshared; try_lock cannot fail.
        if let Ok(mut guard) = stdin_slot.try_lock() {
            *guard = child.stdin.take();
        }
    }

    let handle = handle_template(pid);

    let reader_state = Arc::clone(&state);
    let driver_state = Arc::clone(&state);
    let invocation_id = req.invocation_id;

    tokio::spawn(async move {
        let outcome = Arc::new(std::sync::Mutex::new(StreamOutcome::default()));
        let reader_outcome = Arc::clone(&outcome);

        let reader = tokio::spawn(async move {
            let Some(stdout) = stdout else {
                return;
            };
            let mut log_file = log_file;
            let mut lines = BufReader::new(stdout).lines();

            while let Ok(Some(line)) = lines.next_line().await {
                // Tee first: the log must contain every line the agent
                // produced, parseable or not.
                if let Err(e) = writeln!(log_file, "{line}") {
                    warn!(invocation_id, error = %e, "failed to append agent log line");
                }

                match parse_stream_line(&line) {
                    LineEvent::SessionId(id) => {
                        let mut slot = reader_state
                            .session_id
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        *slot = Some(id);
                    }
                    LineEvent::Result(fields) => {
                        let mut out = reader_outcome
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        out.result_received = true;
                        out.subtype = fields.subtype;
                        out.cost_usd = fields.cost_usd;
                        out.num_turns = fields.num_turns;
                        out.summary = fields.summary;
                    }
                    LineEvent::Ignored => {}
                    LineEvent::Invalid => {
                        if !line.trim().is_empty() {
                            warn!(invocation_id, "non-JSON line in agent output");
                        }
                    }
                }
            }
            // Dropping the file here closes the log exactly once, after the
            // stream has closed.
        });

        let status = child.wait().await;

        // The stream should close at (or just before) process exit. Give it
        // the watchdog window, then force-close it.
        let mut reader = reader;
        if tokio::time::timeout(STREAM_CLOSE_WATCHDOG, &mut reader)
            .await
            .is_err()
        {
            warn!(
                invocation_id,
                "agent output stream did not close after exit, force-closing"
            );
            reader.abort();
        }

        let exit_code = status.as_ref().ok().and_then(|s| s.code());
        let exited_cleanly = status.as_ref().map(|s| s.success()).unwrap_or(false);

        let session_id = driver_state
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let out = {
            let guard = outcome.lock().unwrap_or_else(|e| e.into_inner());
            StreamOutcome {
                result_received: guard.result_received,
                subtype: guard.subtype.clone(),
                cost_usd: guard.cost_usd,
                num_turns: guard.num_turns,
                summary: guard.summary.clone(),
            }
        };

        let result = if out.result_received {
            SessionResult {
                subtype: out.subtype,
                cost_usd: out.cost_usd,
                num_turns: out.num_turns,
                output_summary: out.summary,
                session_id,
                exit_code,
            }
        } else if !exited_cleanly {
            SessionResult {
                session_id,
                ..SessionResult::process_error(
                    match exit_code {
                        Some(code) => {
                            format!("process exited with code {code} before emitting a result")
                        }
                        None => "process was killed before emitting a result".to_string(),
                    },
                    exit_code,
                )
            }
        } else {
            SessionResult {
                subtype: SUBTYPE_SUCCESS.to_string(),
                cost_usd: None,
                num_turns: None,
                output_summary: "process exited cleanly with no result message".to_string(),
                session_id,
                exit_code,
            }
        };

        info!(
            invocation_id,
            subtype = %result.subtype,
            cost_usd = ?result.cost_usd,
            "agent session ended"
        );
        let _ = done_tx.send(Some(result));
    });

    handle
}

fn open_log_file(project_root: &Path, invocation_id: i64) -> std::io::Result<std::fs::File> {
    let logs_dir = project_root.join("logs");
    std::fs::create_dir_all(&logs_dir)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(logs_dir.join(format!("{invocation_id}.ndjson")))
}

/// Path of the NDJSON log for an invocation.
pub fn log_path(project_root: &Path, invocation_id: i64) -> PathBuf {
    project_root
        .join("logs")
        .join(format!("{invocation_id}.ndjson"))
}

/// Erase the agent's cached per-project settings for a repo and its sibling
/// worktrees.
///
/// The agent keys its project cache by a munged absolute path. After a
/// worktree is recreated at the same path, a stale cache entry makes the
/// agent mis-key the project, so every entry for the repo or a
/// `<repo>-<suffix>` sibling is removed. Best-effort.
fn clear_project_settings_cache(repo: &Path) {
    let Some(home) = dirs_home() else {
        return;
    };
    let projects_dir = home.join(".claude").join("projects");
    let Ok(entries) = std::fs::read_dir(&projects_dir) else {
        return;
    };

    let munged = munge_project_path(repo);
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        if name_str == munged || name_str.starts_with(&format!("{munged}-")) {
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(entry = name_str, "cleared stale agent project cache"),
                Err(e) => {
                    debug!(entry = name_str, error = %e, "could not clear agent project cache")
                }
            }
        }
    }
}

fn munge_project_path(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '.' { '-' } else { c })
        .collect()
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

// ---------------------------------------------------------------------------
// Stream parsing
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
struct ResultFields {
    subtype: String,
    cost_usd: Option<f64>,
    num_turns: Option<i64>,
    summary: String,
}

#[derive(Debug, PartialEq)]
enum LineEvent {
    /// `system`/`init` message carrying the session identifier.
    SessionId(String),
    /// Terminal `result` message.
    Result(ResultFields),
    /// Recognised but uninteresting (assistant chatter, tool output).
    Ignored,
    /// Not JSON.
    Invalid,
}

/// Classify one line of the agent's stream-json output.
fn parse_stream_line(line: &str) -> LineEvent {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineEvent::Ignored;
    }

    let Ok(v) = serde_json::from_str::<Value>(trimmed) else {
        return LineEvent::Invalid;
    };

    match v.get("type").and_then(Value::as_str).unwrap_or("") {
        "system" | "init" => match v.get("session_id").and_then(Value::as_str) {
            Some(id) => LineEvent::SessionId(id.to_string()),
            None => LineEvent::Ignored,
        },
        "result" => LineEvent::Result(parse_result_message(&v)),
        _ => LineEvent::Ignored,
    }
}

fn parse_result_message(v: &Value) -> ResultFields {
    let subtype = v
        .get("subtype")
        .and_then(Value::as_str)
        .unwrap_or(SUBTYPE_SUCCESS)
        .to_string();

    let cost_usd = v
        .get("total_cost_usd")
        .and_then(Value::as_f64)
        .or_else(|| v.get("cost_usd").and_then(Value::as_f64));

    let num_turns = v.get("num_turns").and_then(Value::as_i64);

    let summary = match subtype.as_str() {
        SUBTYPE_SUCCESS => v
            .get("result")
            .and_then(Value::as_str)
            .map(truncate_summary)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "completed successfully".to_string()),
        "error_max_turns" => "max turns reached".to_string(),
        "error_during_execution" => {
            let joined = v
                .get("errors")
                .and_then(Value::as_array)
                .map(|errors| {
                    errors
                        .iter()
                        .map(|e| match e.as_str() {
                            Some(s) => s.to_string(),
                            None => e.to_string(),
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_default();
            if joined.is_empty() {
                "error during execution".to_string()
            } else {
                joined
            }
        }
        other => format!("result subtype: {other}"),
    };

    ResultFields {
        subtype,
        cost_usd,
        num_turns,
        summary,
    }
}

fn truncate_summary(text: &str) -> String {
    text.chars().take(500).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
