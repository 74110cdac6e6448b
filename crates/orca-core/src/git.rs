//! Wrapped `git` subprocess invocation with retry and transient-error
//! classification.
//!
//! Git is always run with an argument vector, never through a shell. The
//! retry wrapper absorbs the two transient failure families we see in the
//! field: children killed by a signal, and the Windows DLL-initialization
//! failure status that anti-virus interference produces under load.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Windows `STATUS_DLL_INIT_FAILED`, as git reports it.
pub const DLL_INIT_FAILED: i64 = 0xC000_0142;
/// The same status read back as a signed 32-bit exit code.
pub const DLL_INIT_FAILED_SIGNED: i64 = -1_073_741_502;

/// Consecutive transient failures across all callers in this process.
/// After [`TRANSIENT_PAUSE_THRESHOLD`], retries pause for 30 seconds.
static CONSECUTIVE_TRANSIENT: AtomicU32 = AtomicU32::new(0);

const TRANSIENT_PAUSE_THRESHOLD: u32 = 6;
const TRANSIENT_PAUSE: Duration = Duration::from_secs(30);
const RETRY_BACKOFF: [Duration; 2] = [Duration::from_secs(2), Duration::from_secs(4)];

/// Errors from a git invocation.
#[derive(Debug, Error)]
pub enum GitError {
    /// The git binary could not be started at all.
    #[error("failed to run git {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Git exited with a non-zero status.
    #[error("git {command} failed (exit {code:?}, signal {signal:?}): {stderr}")]
    Exit {
        command: String,
        code: Option<i64>,
        signal: Option<i32>,
        stderr: String,
    },
}

impl GitError {
    /// Transient failures are retried; everything else is permanent.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Spawn { .. } => false,
            Self::Exit { code, signal, .. } => {
                signal.is_some() || code.as_ref().map(is_dll_init_code).unwrap_or(false)
            }
        }
    }

    /// The DLL-initialization family specifically; the scheduler reacts to
    /// this with a per-repo cooldown rather than a task failure.
    pub fn is_dll_init_failure(&self) -> bool {
        matches!(self, Self::Exit { code: Some(code), .. } if is_dll_init_code(code))
    }

    /// The child was killed by a signal.
    pub fn is_signal_killed(&self) -> bool {
        matches!(self, Self::Exit { signal: Some(_), .. })
    }
}

fn is_dll_init_code(code: &i64) -> bool {
    *code == DLL_INIT_FAILED || *code == DLL_INIT_FAILED_SIGNED
}

/// Run git once in `repo` and return trimmed stdout.
pub fn run_git(repo: &Path, args: &[&str]) -> Result<String, GitError> {
    let command_label = args.join(" ");

    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .map_err(|e| GitError::Spawn {
            command: command_label.clone(),
            source: e,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            output.status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        return Err(GitError::Exit {
            command: command_label,
            code: output.status.code().map(i64::from),
            signal,
            stderr,
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Run git with up to three attempts, backing off 2 s then 4 s between
/// transient failures. Permanent failures surface immediately.
///
/// A process-wide counter tracks consecutive transient failures across all
/// callers; once it reaches six, the wrapper pauses 30 seconds before the
/// next retry to let the platform recover. Any success resets the counter.
pub fn run_git_with_retry(repo: &Path, args: &[&str]) -> Result<String, GitError> {
    let mut last_err = None;

    for attempt in 0..3 {
        if attempt > 0 {
            if CONSECUTIVE_TRANSIENT.load(Ordering::Relaxed) >= TRANSIENT_PAUSE_THRESHOLD {
                warn!(
                    command = args.join(" "),
                    "repeated transient git failures, pausing before retry"
                );
                std::thread::sleep(TRANSIENT_PAUSE);
            }
            std::thread::sleep(RETRY_BACKOFF[attempt - 1]);
        }

        match run_git(repo, args) {
            Ok(stdout) => {
                CONSECUTIVE_TRANSIENT.store(0, Ordering::Relaxed);
                return Ok(stdout);
            }
            Err(e) if e.is_transient() => {
                let seen = CONSECUTIVE_TRANSIENT.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    command = args.join(" "),
                    attempt = attempt + 1,
                    consecutive = seen,
                    error = %e,
                    "transient git failure"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.expect("retry loop exits with an error after three transient failures"))
}

/// Remove `.git/index.lock` if its mtime is older than `max_age`.
///
/// Best-effort: a lock we cannot stat or unlink is logged and left alone.
pub fn clear_stale_index_lock(repo: &Path, max_age: Duration) {
    let lock_path = repo.join(".git").join("index.lock");

    let Ok(metadata) = std::fs::metadata(&lock_path) else {
        return;
    };

    let age = metadata
        .modified()
        .ok()
        .and_then(|mtime| mtime.elapsed().ok());

    match age {
        Some(age) if age > max_age => {
            match std::fs::remove_file(&lock_path) {
                Ok(()) => {
                    warn!(path = %lock_path.display(), age_secs = age.as_secs(), "removed stale index lock");
                }
                Err(e) => {
                    warn!(path = %lock_path.display(), error = %e, "failed to remove stale index lock");
                }
            }
        }
        Some(_) => {
            debug!(path = %lock_path.display(), "index lock present but fresh, leaving it");
        }
        None => {}
    }
}

#[cfg(test)]
pub(crate) fn reset_transient_counter() {
    CONSECUTIVE_TRANSIENT.store(0, Ordering::Relaxed);
}
