//! Per-invocation git worktree provisioning.
//!
//! Each agent session runs in its own worktree, giving filesystem isolation
//! without a full clone. The worktree for a task lives next to the main
//! repository at `<parent>/<repo-basename>-<task-id>` on a branch named
//! `orca/<task-id>-inv-<invocation-id>` (or on a tracking branch of the
//! review base ref when one is supplied).
//!
//! Git does not support concurrent worktree mutation on one repository, so
//! all mutating operations are serialised through an internal mutex.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use crate::git::{clear_stale_index_lock, run_git, run_git_with_retry, GitError};

/// Errors that can occur during worktree provisioning.
#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error("failed to remove stray directory {path}: {source}")]
    StrayRemoval {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {path}: {source}")]
    EnvCopy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("package install failed in {path}: {message}")]
    Install { path: PathBuf, message: String },

    #[error("cannot derive repository root for worktree {0}")]
    UnknownRepoRoot(PathBuf),
}

impl WorktreeError {
    /// Forward the git driver's transient classification; everything that
    /// is not a git failure is permanent.
    pub fn as_git(&self) -> Option<&GitError> {
        match self {
            Self::Git(e) => Some(e),
            _ => None,
        }
    }
}

/// Inputs for provisioning one invocation's worktree.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub repo_root: PathBuf,
    pub task_id: String,
    pub invocation_id: i64,
    /// Review/fix flow: check out `origin/<base_ref>` on a tracking branch
    /// of the same name instead of cutting a fresh branch.
    pub base_ref: Option<String>,
}

/// A provisioned worktree ready for an agent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionedWorktree {
    pub path: PathBuf,
    pub branch: String,
}

/// Creates, resets, and removes per-invocation worktrees.
#[derive(Debug, Clone)]
pub struct WorktreeProvisioner {
    /// Serialises mutating git operations across concurrent dispatches.
    git_lock: Arc<Mutex<()>>,
    /// Age past which an `index.lock` is considered abandoned.
    stale_lock_max_age: Duration,
}

impl Default for WorktreeProvisioner {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl WorktreeProvisioner {
    pub fn new(stale_lock_max_age: Duration) -> Self {
        Self {
            git_lock: Arc::new(Mutex::new(())),
            stale_lock_max_age,
        }
    }

    /// Worktree path convention: a sibling of the repository.
    pub fn target_path(repo_root: &Path, task_id: &str) -> PathBuf {
        let basename = repo_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("repo");
        let dir_name = format!("{basename}-{task_id}");
        repo_root
            .parent()
            .map(|p| p.join(&dir_name))
            .unwrap_or_else(|| PathBuf::from(dir_name))
    }

    /// Branch convention for a fresh invocation.
    pub fn branch_name(task_id: &str, invocation_id: i64) -> String {
        format!("orca/{task_id}-inv-{invocation_id}")
    }

    /// Create (or reconcile) the worktree for an invocation.
    pub fn create(&self, req: &CreateRequest) -> Result<ProvisionedWorktree, WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let repo = req.repo_root.as_path();
        let path = Self::target_path(repo, &req.task_id);
        let branch = match &req.base_ref {
            Some(base) => base.clone(),
            None => Self::branch_name(&req.task_id, req.invocation_id),
        };

        // Stale bookkeeping first: pruning and lock removal are best-effort.
        if let Err(e) = run_git(repo, &["worktree", "prune"]) {
            warn!(repo = %repo.display(), error = %e, "worktree prune failed");
        }
        clear_stale_index_lock(repo, self.stale_lock_max_age);

        run_git_with_retry(repo, &["fetch", "origin"])?;

        // An already-registered worktree at the target path is reconciled in
        // place rather than recreated. Canonicalize for comparison: porcelain
        // output resolves symlinks (macOS /private/var vs /var).
        let canonical_target = path.canonicalize().unwrap_or_else(|_| path.clone());
        let registered = self.registered_worktrees(repo)?.iter().any(|p| {
            p.canonicalize().unwrap_or_else(|_| p.clone()) == canonical_target
        });
        if registered {
            info!(path = %path.display(), "worktree already registered, resetting");
            self.reset_to(&path, req.base_ref.as_deref())?;
            return Ok(ProvisionedWorktree { path, branch });
        }

        // A stray directory (crash leftover) blocks `worktree add`; remove it
        // with busy-waits to tolerate transient file locks on Windows.
        if path.exists() {
            remove_stray_dir(&path)?;
        }

        // A local branch of the target name from a previous attempt would
        // also block the add. Deleting a branch that does not exist fails;
        // that failure is expected and swallowed.
        let _ = run_git(repo, &["branch", "-D", &branch]);

        let path_str = path.to_string_lossy();
        match &req.base_ref {
            Some(base) => {
                let start = format!("origin/{base}");
                run_git(
                    repo,
                    &["worktree", "add", "-b", &branch, &path_str, &start],
                )?;
            }
            None => {
                run_git(
                    repo,
                    &["worktree", "add", "-b", &branch, &path_str, "origin/main"],
                )?;
            }
        }

        copy_env_files(repo, &path)?;
        install_packages(&path)?;

        info!(path = %path.display(), branch = %branch, "worktree created");
        Ok(ProvisionedWorktree { path, branch })
    }

    /// Reset a worktree to its remote base: fetch, then hard-reset.
    pub fn reset(&self, worktree_path: &Path) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.reset_to(worktree_path, None)
    }

    fn reset_to(&self, worktree_path: &Path, base_ref: Option<&str>) -> Result<(), WorktreeError> {
        run_git_with_retry(worktree_path, &["fetch", "origin"])?;
        let target = match base_ref {
            Some(base) => format!("origin/{base}"),
            None => "origin/main".to_string(),
        };
        run_git(worktree_path, &["reset", "--hard", &target])?;
        Ok(())
    }

    /// Remove a worktree with a three-level fallback.
    ///
    /// 1. Resolve the common git dir from inside the worktree and run
    ///    `git worktree remove --force` from the owning repository.
    /// 2. Derive the repository root from the worktree's basename and try
    ///    the same removal from there.
    /// 3. Delete the directory tree directly and prune.
    ///
    /// `repo_root` short-circuits the derivation when the caller knows the
    /// owning repository (the scheduler always does).
    pub fn remove(
        &self,
        worktree_path: &Path,
        repo_root: Option<&Path>,
    ) -> Result<(), WorktreeError> {
        let _lock = self.git_lock.lock().unwrap_or_else(|e| e.into_inner());

        let path_str = worktree_path.to_string_lossy();

        if let Some(root) = repo_root.map(Path::to_path_buf).or_else(|| resolve_repo_root(worktree_path)) {
            match run_git(&root, &["worktree", "remove", "--force", &path_str]) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(path = %worktree_path.display(), error = %e, "worktree remove failed, trying derived root");
                }
            }
        }

        if let Some(derived) = derive_repo_root(worktree_path) {
            match run_git(&derived, &["worktree", "remove", "--force", &path_str]) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(path = %worktree_path.display(), error = %e, "worktree remove from derived root failed, deleting directly");
                }
            }
            if worktree_path.exists() {
                std::fs::remove_dir_all(worktree_path).map_err(|e| {
                    WorktreeError::StrayRemoval {
                        path: worktree_path.to_path_buf(),
                        source: e,
                    }
                })?;
            }
            let _ = run_git(&derived, &["worktree", "prune"]);
            return Ok(());
        }

        // No repository found at all; the directory itself can still go.
        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path).map_err(|e| WorktreeError::StrayRemoval {
                path: worktree_path.to_path_buf(),
                source: e,
            })?;
            return Ok(());
        }

        Err(WorktreeError::UnknownRepoRoot(worktree_path.to_path_buf()))
    }

    /// Paths of all worktrees registered to `repo`, parsed from porcelain
    /// output.
    pub fn registered_worktrees(&self, repo: &Path) -> Result<Vec<PathBuf>, WorktreeError> {
        let stdout = run_git(repo, &["worktree", "list", "--porcelain"])?;
        Ok(parse_worktree_paths(&stdout))
    }
}

/// Parse the `worktree <path>` lines of `git worktree list --porcelain`.
fn parse_worktree_paths(output: &str) -> Vec<PathBuf> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("worktree "))
        .map(PathBuf::from)
        .collect()
}

/// Resolve the owning repository root from inside a worktree via the common
/// git directory.
fn resolve_repo_root(worktree_path: &Path) -> Option<PathBuf> {
    let common = run_git(worktree_path, &["rev-parse", "--git-common-dir"]).ok()?;
    let common_path = if Path::new(&common).is_absolute() {
        PathBuf::from(common)
    } else {
        worktree_path.join(common)
    };
    // The common dir is `<repo>/.git`; its parent is the repo root.
    common_path.parent().map(Path::to_path_buf)
}

/// Derive the repository root from a worktree path of the form
/// `<parent>/<repo>-<suffix>[-<suffix>...]` by stripping hyphen-separated
/// suffixes until an existing sibling directory is found.
///
/// Known to mis-resolve when a longer-prefix sibling worktree exists; the
/// explicit repo root passed by the scheduler is always preferred.
pub fn derive_repo_root(worktree_path: &Path) -> Option<PathBuf> {
    let parent = worktree_path.parent()?;
    let basename = worktree_path.file_name()?.to_str()?;

    let segments: Vec<&str> = basename.split('-').collect();
    for end in (1..segments.len()).rev() {
        let candidate_name = segments[..end].join("-");
        let candidate = parent.join(&candidate_name);
        if candidate.is_dir() {
            return Some(candidate);
        }
    }
    None
}

/// Copy every dotenv-style file (`.env`, `.env.local`, ...) from the repo
/// root into the worktree. Agents need the untracked environment to run
/// the project's tooling.
fn copy_env_files(repo: &Path, worktree: &Path) -> Result<(), WorktreeError> {
    let entries = match std::fs::read_dir(repo) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(repo = %repo.display(), error = %e, "cannot scan repo root for env files");
            return Ok(());
        }
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name_str) = name.to_str() else {
            continue;
        };
        if !name_str.starts_with(".env") {
            continue;
        }
        let source = entry.path();
        if !source.is_file() {
            continue;
        }
        std::fs::copy(&source, worktree.join(&name)).map_err(|e| WorktreeError::EnvCopy {
            path: source.clone(),
            source: e,
        })?;
    }

    Ok(())
}

/// Run the package install tool synchronously when a manifest is present.
fn install_packages(worktree: &Path) -> Result<(), WorktreeError> {
    if !worktree.join("package.json").exists() {
        return Ok(());
    }

    info!(path = %worktree.display(), "installing packages");
    let output = Command::new("npm")
        .arg("install")
        .current_dir(worktree)
        .output()
        .map_err(|e| WorktreeError::Install {
            path: worktree.to_path_buf(),
            message: format!("failed to run npm: {e}"),
        })?;

    if !output.status.success() {
        return Err(WorktreeError::Install {
            path: worktree.to_path_buf(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(())
}

/// Remove a stray (unregistered) directory, retrying to tolerate transient
/// file locks. Three attempts with 2-second waits.
fn remove_stray_dir(path: &Path) -> Result<(), WorktreeError> {
    let mut last_err = None;
    for attempt in 0..3 {
        if attempt > 0 {
            std::thread::sleep(Duration::from_secs(2));
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if !path.exists() => {
                let _ = e;
                return Ok(());
            }
            Err(e) => {
                warn!(path = %path.display(), attempt = attempt + 1, error = %e, "stray directory removal failed");
                last_err = Some(e);
            }
        }
    }

    Err(WorktreeError::StrayRemoval {
        path: path.to_path_buf(),
        source: last_err.expect("three failed attempts leave an error"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create an upstream repo plus a clone whose `origin` points at it.
    /// Returns (tempdir holding both, clone path).
    fn create_cloned_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let upstream = dir.path().join("upstream");
        std::fs::create_dir(&upstream).unwrap();

        let run = |args: &[&str], cwd: &Path| {
            let output = Command::new("git")
                .args(args)
                .current_dir(cwd)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init", "-b", "main"], &upstream);
        run(&["config", "user.email", "test@orca.dev"], &upstream);
        run(&["config", "user.name", "Orca Test"], &upstream);
        std::fs::write(upstream.join("README.md"), "# Upstream\n").unwrap();
        std::fs::write(upstream.join(".env"), "SECRET=1\n").unwrap();
        std::fs::write(upstream.join(".env.local"), "LOCAL=1\n").unwrap();
        run(&["add", "-f", "."], &upstream);
        run(&["commit", "-m", "initial"], &upstream);

        let clone = dir.path().join("webapp");
        let output = Command::new("git")
            .args(["clone", upstream.to_str().unwrap(), clone.to_str().unwrap()])
            .output()
            .expect("git clone failed");
        assert!(output.status.success());
        run(&["config", "user.email", "test@orca.dev"], &clone);
        run(&["config", "user.name", "Orca Test"], &clone);

        (dir, clone)
    }

    #[test]
    fn target_path_is_a_sibling_of_the_repo() {
        let path = WorktreeProvisioner::target_path(Path::new("/srv/repos/webapp"), "ORC-7");
        assert_eq!(path, PathBuf::from("/srv/repos/webapp-ORC-7"));
    }

    #[test]
    fn branch_name_encodes_task_and_invocation() {
        assert_eq!(
            WorktreeProvisioner::branch_name("ORC-7", 42),
            "orca/ORC-7-inv-42"
        );
    }

    #[test]
    fn create_provisions_worktree_and_branch() {
        let (_dir, repo) = create_cloned_repo();
        let provisioner = WorktreeProvisioner::default();

        let wt = provisioner
            .create(&CreateRequest {
                repo_root: repo.clone(),
                task_id: "ORC-1".to_string(),
                invocation_id: 1,
                base_ref: None,
            })
            .expect("create failed");

        assert_eq!(wt.branch, "orca/ORC-1-inv-1");
        assert!(wt.path.exists());
        assert!(wt.path.join("README.md").exists());

        let branch = run_git(&wt.path, &["branch", "--show-current"]).unwrap();
        assert_eq!(branch, "orca/ORC-1-inv-1");
    }

    #[test]
    fn create_copies_env_files() {
        let (_dir, repo) = create_cloned_repo();
        // The clone checks the committed .env files out already; overwrite
        // one locally so the copy is observable.
        std::fs::write(repo.join(".env"), "SECRET=rotated\n").unwrap();

        let provisioner = WorktreeProvisioner::default();
        let wt = provisioner
            .create(&CreateRequest {
                repo_root: repo.clone(),
                task_id: "ORC-2".to_string(),
                invocation_id: 3,
                base_ref: None,
            })
            .unwrap();

        let copied = std::fs::read_to_string(wt.path.join(".env")).unwrap();
        assert_eq!(copied, "SECRET=rotated\n");
        assert!(wt.path.join(".env.local").exists());
    }

    #[test]
    fn create_on_registered_path_resets_in_place() {
        let (_dir, repo) = create_cloned_repo();
        let provisioner = WorktreeProvisioner::default();

        let req = CreateRequest {
            repo_root: repo.clone(),
            task_id: "ORC-3".to_string(),
            invocation_id: 1,
            base_ref: None,
        };
        let first = provisioner.create(&req).unwrap();

        // Dirty the worktree, then re-create: the dirt must be reset away.
        std::fs::write(first.path.join("scratch.txt"), "leftover\n").unwrap();
        run_git(&first.path, &["add", "scratch.txt"]).unwrap();

        let second = provisioner.create(&req).unwrap();
        assert_eq!(first.path, second.path);
        assert!(!second.path.join("scratch.txt").exists());
    }

    #[test]
    fn create_replaces_stray_unregistered_directory() {
        let (_dir, repo) = create_cloned_repo();
        let provisioner = WorktreeProvisioner::default();

        let stray = WorktreeProvisioner::target_path(&repo, "ORC-4");
        std::fs::create_dir_all(&stray).unwrap();
        std::fs::write(stray.join("junk.txt"), "crash leftover\n").unwrap();

        let wt = provisioner
            .create(&CreateRequest {
                repo_root: repo.clone(),
                task_id: "ORC-4".to_string(),
                invocation_id: 9,
                base_ref: None,
            })
            .unwrap();

        assert!(!wt.path.join("junk.txt").exists());
        assert!(wt.path.join("README.md").exists());
    }

    #[test]
    fn create_with_base_ref_tracks_remote_branch() {
        let (dir, repo) = create_cloned_repo();
        let upstream = dir.path().join("upstream");

        // Publish a review branch upstream.
        run_git(&upstream, &["checkout", "-b", "fix/login"]).unwrap();
        std::fs::write(upstream.join("fix.txt"), "fix\n").unwrap();
        run_git(&upstream, &["add", "fix.txt"]).unwrap();
        run_git(&upstream, &["commit", "-m", "fix"]).unwrap();
        run_git(&upstream, &["checkout", "main"]).unwrap();

        let provisioner = WorktreeProvisioner::default();
        let wt = provisioner
            .create(&CreateRequest {
                repo_root: repo.clone(),
                task_id: "ORC-5".to_string(),
                invocation_id: 2,
                base_ref: Some("fix/login".to_string()),
            })
            .unwrap();

        assert_eq!(wt.branch, "fix/login");
        assert!(wt.path.join("fix.txt").exists());
    }

    #[test]
    fn remove_unregisters_and_deletes() {
        let (_dir, repo) = create_cloned_repo();
        let provisioner = WorktreeProvisioner::default();

        let wt = provisioner
            .create(&CreateRequest {
                repo_root: repo.clone(),
                task_id: "ORC-6".to_string(),
                invocation_id: 1,
                base_ref: None,
            })
            .unwrap();

        provisioner.remove(&wt.path, Some(&repo)).unwrap();
        assert!(!wt.path.exists());
        assert!(!provisioner
            .registered_worktrees(&repo)
            .unwrap()
            .contains(&wt.path));
    }

    #[test]
    fn remove_without_explicit_root_uses_fallbacks() {
        let (_dir, repo) = create_cloned_repo();
        let provisioner = WorktreeProvisioner::default();

        let wt = provisioner
            .create(&CreateRequest {
                repo_root: repo.clone(),
                task_id: "ORC-7".to_string(),
                invocation_id: 1,
                base_ref: None,
            })
            .unwrap();

        provisioner.remove(&wt.path, None).unwrap();
        assert!(!wt.path.exists());
    }

    #[test]
    fn remove_plain_directory_falls_back_to_direct_delete() {
        let (_dir, repo) = create_cloned_repo();
        let provisioner = WorktreeProvisioner::default();

        let stray = WorktreeProvisioner::target_path(&repo, "ORC-8");
        std::fs::create_dir_all(&stray).unwrap();

        provisioner.remove(&stray, None).unwrap();
        assert!(!stray.exists());
    }

    #[test]
    fn derive_repo_root_strips_suffixes() {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().join("webapp");
        std::fs::create_dir(&repo).unwrap();

        let derived = derive_repo_root(&tmp.path().join("webapp-ORC-12"));
        assert_eq!(derived, Some(repo.clone()));

        let derived = derive_repo_root(&tmp.path().join("webapp-ORC-12-extra"));
        assert_eq!(derived, Some(repo));

        assert_eq!(derive_repo_root(&tmp.path().join("other-ORC-12")), None);
    }

    #[test]
    fn parse_worktree_paths_reads_porcelain_blocks() {
        let input = "\
worktree /srv/repos/webapp
HEAD abc123
branch refs/heads/main

worktree /srv/repos/webapp-ORC-1
HEAD def456
branch refs/heads/orca/ORC-1-inv-1
";
        let paths = parse_worktree_paths(input);
        assert_eq!(
            paths,
            vec![
                PathBuf::from("/srv/repos/webapp"),
                PathBuf::from("/srv/repos/webapp-ORC-1"),
            ]
        );
    }
}
