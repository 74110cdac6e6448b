//! Periodic garbage collection of stale worktrees and branches.
//!
//! Runs off the scheduler's hot path. For every repository the task table
//! references: prune stale worktree registrations, remove leftover
//! `<repo>-<task>` worktrees (registered or not), and delete aged-out
//! `orca/*` branches that nothing references any more.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orca_db::models::Invocation;
use orca_db::queries::invocations::list_running_invocations;
use orca_db::queries::tasks::{get_task, list_repo_paths, list_tasks};
use orca_db::SqlitePool;

use crate::git::run_git;
use crate::settings::SharedSettings;
use crate::worktree::WorktreeProvisioner;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub worktrees_removed: usize,
    pub strays_removed: usize,
    pub branches_deleted: usize,
}

/// Run one full cleanup sweep across every repo in the task table.
pub async fn run_cleanup(
    pool: &SqlitePool,
    provisioner: &WorktreeProvisioner,
    branch_max_age_min: i64,
) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let running = list_running_invocations(pool).await?;

    let protected_paths: HashSet<PathBuf> = running
        .iter()
        .filter_map(|inv| inv.worktree_path.as_deref())
        .map(PathBuf::from)
        .collect();

    for repo_str in list_repo_paths(pool).await? {
        let repo = PathBuf::from(&repo_str);
        if !repo.is_dir() {
            debug!(repo = %repo_str, "repo path missing, skipping cleanup");
            continue;
        }

        if let Err(e) = run_git(&repo, &["worktree", "prune"]) {
            warn!(repo = %repo_str, error = %e, "worktree prune failed");
        }

        sweep_worktrees(&repo, provisioner, &protected_paths, &mut report);
        sweep_stray_directories(&repo, provisioner, &protected_paths, &mut report);
        sweep_branches(pool, &repo, &running, branch_max_age_min, &mut report).await?;
    }

    if report != CleanupReport::default() {
        info!(
            worktrees = report.worktrees_removed,
            strays = report.strays_removed,
            branches = report.branches_deleted,
            "cleanup sweep complete"
        );
    }

    Ok(report)
}

/// Spawn the periodic cleanup loop.
pub fn start_cleanup_loop(
    pool: SqlitePool,
    provisioner: WorktreeProvisioner,
    settings: SharedSettings,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let (interval_min, branch_age) = {
                let settings = settings.read().await;
                (settings.cleanup_interval_min, settings.cleanup_branch_max_age_min)
            };

            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_secs(interval_min * 60)) => {}
                _ = cancel.cancelled() => return,
            }

            if let Err(e) = run_cleanup(&pool, &provisioner, branch_age).await {
                warn!(error = %e, "cleanup sweep failed");
            }
        }
    });
}

/// Remove registered worktrees matching the `<repo-basename>-*` pattern
/// that are neither the repo itself nor protected by a running invocation.
fn sweep_worktrees(
    repo: &Path,
    provisioner: &WorktreeProvisioner,
    protected: &HashSet<PathBuf>,
    report: &mut CleanupReport,
) {
    let registered = match provisioner.registered_worktrees(repo) {
        Ok(paths) => paths,
        Err(e) => {
            warn!(repo = %repo.display(), error = %e, "cannot list worktrees");
            return;
        }
    };

    for path in registered {
        if !matches_worktree_pattern(repo, &path) {
            continue;
        }
        if is_protected(&path, protected) {
            debug!(path = %path.display(), "worktree protected by running invocation");
            continue;
        }
        match provisioner.remove(&path, Some(repo)) {
            Ok(()) => {
                info!(path = %path.display(), "removed stale worktree");
                report.worktrees_removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove worktree"),
        }
    }
}

/// Sweep the repo's parent directory for pattern-matching directories that
/// are not registered worktrees (crash leftovers).
fn sweep_stray_directories(
    repo: &Path,
    provisioner: &WorktreeProvisioner,
    protected: &HashSet<PathBuf>,
    report: &mut CleanupReport,
) {
    let Some(parent) = repo.parent() else {
        return;
    };
    let registered: HashSet<PathBuf> = provisioner
        .registered_worktrees(repo)
        .unwrap_or_default()
        .into_iter()
        .collect();

    let Ok(entries) = std::fs::read_dir(parent) else {
        return;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !matches_worktree_pattern(repo, &path) {
            continue;
        }
        if registered.contains(&path) || is_protected(&path, protected) {
            continue;
        }
        match std::fs::remove_dir_all(&path) {
            Ok(()) => {
                info!(path = %path.display(), "removed stray worktree directory");
                report.strays_removed += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove stray directory"),
        }
    }
}

/// Delete `orca/*` branches that nothing references: no running invocation,
/// no non-terminal task, no open PR, and older than the age floor.
async fn sweep_branches(
    pool: &SqlitePool,
    repo: &Path,
    running: &[Invocation],
    branch_max_age_min: i64,
    report: &mut CleanupReport,
) -> Result<()> {
    let listing = match run_git(
        repo,
        &["branch", "--list", "orca/*", "--format=%(refname:short)"],
    ) {
        Ok(listing) => listing,
        Err(e) => {
            warn!(repo = %repo.display(), error = %e, "cannot list orca branches");
            return Ok(());
        }
    };

    let running_branches: HashSet<&str> = running
        .iter()
        .filter_map(|inv| inv.branch.as_deref())
        .collect();

    let tasks = list_tasks(pool).await?;

    for branch in listing.lines().map(str::trim).filter(|b| !b.is_empty()) {
        if running_branches.contains(branch) {
            continue;
        }

        // A task referencing the branch (by naming convention or by its PR
        // branch) protects it while the task is still live.
        let task_ref = branch_task_id(branch);
        let referenced = match task_ref {
            Some(ref task_id) => get_task(pool, task_id)
                .await?
                .map(|t| !t.status.is_terminal())
                .unwrap_or(false),
            None => false,
        } || tasks
            .iter()
            .any(|t| !t.status.is_terminal() && t.pr_branch.as_deref() == Some(branch));
        if referenced {
            continue;
        }

        if has_open_pr(repo, branch) {
            continue;
        }

        // Unknown ages delete (fail-open): a branch whose tip date git
        // cannot report is treated as abandoned.
        if let Some(committed_at) = branch_age(repo, branch) {
            if Utc::now() - committed_at < ChronoDuration::minutes(branch_max_age_min) {
                continue;
            }
        }

        match run_git(repo, &["branch", "-D", branch]) {
            Ok(_) => {
                info!(branch, "deleted stale branch");
                report.branches_deleted += 1;
            }
            Err(e) => warn!(branch, error = %e, "failed to delete branch"),
        }
    }

    Ok(())
}

/// `<repo-basename>-*`, excluding the repo itself.
fn matches_worktree_pattern(repo: &Path, path: &Path) -> bool {
    if path == repo {
        return false;
    }
    let Some(repo_name) = repo.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.starts_with(&format!("{repo_name}-"))
}

fn is_protected(path: &Path, protected: &HashSet<PathBuf>) -> bool {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    protected.iter().any(|p| {
        p == path || p.canonicalize().map(|c| c == canonical).unwrap_or(false)
    })
}

/// Task id encoded in an `orca/<task>-inv-<n>` branch name.
fn branch_task_id(branch: &str) -> Option<String> {
    let rest = branch.strip_prefix("orca/")?;
    let inv_pos = rest.rfind("-inv-")?;
    Some(rest[..inv_pos].to_string())
}

/// Commit time of a branch tip, if git can report one.
fn branch_age(repo: &Path, branch: &str) -> Option<DateTime<Utc>> {
    let output = run_git(repo, &["log", "-1", "--format=%ct", branch]).ok()?;
    let epoch: i64 = output.trim().parse().ok()?;
    DateTime::from_timestamp(epoch, 0)
}

/// Whether the branch has an open pull request. Fail-open: when the
/// external listing call errors, the branch is treated as PR-free.
fn has_open_pr(repo: &Path, branch: &str) -> bool {
    let output = Command::new("gh")
        .args(["pr", "list", "--head", branch, "--state", "open", "--json", "number"])
        .current_dir(repo)
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            serde_json::from_str::<serde_json::Value>(stdout.trim())
                .ok()
                .and_then(|v| v.as_array().map(|a| !a.is_empty()))
                .unwrap_or(false)
        }
        _ => false,
    }
}
