//! Integration tests for the worktree/branch garbage collector, against
//! real git repositories.

use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::Utc;

use orca_core::cleanup::run_cleanup;
use orca_core::git::run_git;
use orca_core::worktree::{CreateRequest, WorktreeProvisioner};
use orca_db::models::TaskStatus;
use orca_db::queries::invocations::{insert_invocation, update_invocation, InvocationUpdate};
use orca_test_utils::{create_test_store, seed_task_with};

/// Upstream repo plus a clone with `origin` set, under one tempdir.
fn create_cloned_repo(dir: &Path) -> PathBuf {
    let upstream = dir.join("upstream");
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
    run(&["add", "."], &upstream);
    run(&["commit", "-m", "initial"], &upstream);

    let clone = dir.join("webapp");
    let output = Command::new("git")
        .args(["clone", upstream.to_str().unwrap(), clone.to_str().unwrap()])
        .output()
        .expect("git clone failed");
    assert!(output.status.success());
    run(&["config", "user.email", "test@orca.dev"], &clone);
    run(&["config", "user.name", "Orca Test"], &clone);

    clone
}

fn branch_exists(repo: &Path, branch: &str) -> bool {
    run_git(repo, &["rev-parse", "--verify", &format!("refs/heads/{branch}")]).is_ok()
}

#[tokio::test]
async fn stale_worktree_and_branch_are_collected() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = create_cloned_repo(tmp.path());
    let pool = create_test_store().await;
    let provisioner = WorktreeProvisioner::default();

    // A finished task whose worktree was left behind (failed-session
    // forensics path).
    seed_task_with(&pool, "ORC-1", repo.to_str().unwrap(), TaskStatus::Done, 0).await;
    let invocation_id = insert_invocation(&pool, "ORC-1", Utc::now()).await.unwrap();
    let worktree = provisioner
        .create(&CreateRequest {
            repo_root: repo.clone(),
            task_id: "ORC-1".to_string(),
            invocation_id,
            base_ref: None,
        })
        .unwrap();
    update_invocation(
        &pool,
        invocation_id,
        &InvocationUpdate {
            status: Some(orca_db::models::InvocationStatus::Failed),
            worktree_path: Some(worktree.path.to_string_lossy().to_string()),
            branch: Some(worktree.branch.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert!(worktree.path.exists());
    assert!(branch_exists(&repo, &worktree.branch));

    // Zero age floor: everything unreferenced goes.
    let report = run_cleanup(&pool, &provisioner, 0).await.unwrap();

    assert_eq!(report.worktrees_removed, 1);
    assert!(!worktree.path.exists());
    assert!(
        !branch_exists(&repo, &worktree.branch),
        "aged-out branch of a terminal task should be deleted"
    );
}

#[tokio::test]
async fn running_invocation_protects_worktree_and_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = create_cloned_repo(tmp.path());
    let pool = create_test_store().await;
    let provisioner = WorktreeProvisioner::default();

    seed_task_with(&pool, "ORC-1", repo.to_str().unwrap(), TaskStatus::Running, 0).await;
    let invocation_id = insert_invocation(&pool, "ORC-1", Utc::now()).await.unwrap();
    let worktree = provisioner
        .create(&CreateRequest {
            repo_root: repo.clone(),
            task_id: "ORC-1".to_string(),
            invocation_id,
            base_ref: None,
        })
        .unwrap();
    update_invocation(
        &pool,
        invocation_id,
        &InvocationUpdate {
            worktree_path: Some(worktree.path.to_string_lossy().to_string()),
            branch: Some(worktree.branch.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let report = run_cleanup(&pool, &provisioner, 0).await.unwrap();

    assert_eq!(report.worktrees_removed, 0);
    assert_eq!(report.branches_deleted, 0);
    assert!(worktree.path.exists(), "running invocation protects its worktree");
    assert!(branch_exists(&repo, &worktree.branch));
}

#[tokio::test]
async fn non_terminal_task_protects_its_branch() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = create_cloned_repo(tmp.path());
    let pool = create_test_store().await;
    let provisioner = WorktreeProvisioner::default();

    // The task is still in review; its invocation is finished.
    seed_task_with(&pool, "ORC-1", repo.to_str().unwrap(), TaskStatus::InReview, 0).await;
    let invocation_id = insert_invocation(&pool, "ORC-1", Utc::now()).await.unwrap();
    let worktree = provisioner
        .create(&CreateRequest {
            repo_root: repo.clone(),
            task_id: "ORC-1".to_string(),
            invocation_id,
            base_ref: None,
        })
        .unwrap();
    update_invocation(
        &pool,
        invocation_id,
        &InvocationUpdate {
            status: Some(orca_db::models::InvocationStatus::Completed),
            branch: Some(worktree.branch.clone()),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    // Remove the worktree first so only the branch question remains.
    provisioner.remove(&worktree.path, Some(&repo)).unwrap();

    run_cleanup(&pool, &provisioner, 0).await.unwrap();

    assert!(
        branch_exists(&repo, &worktree.branch),
        "branch of an in-review task must survive cleanup"
    );
}

#[tokio::test]
async fn crash_leftover_directories_are_swept() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = create_cloned_repo(tmp.path());
    let pool = create_test_store().await;
    let provisioner = WorktreeProvisioner::default();

    seed_task_with(&pool, "ORC-1", repo.to_str().unwrap(), TaskStatus::Done, 0).await;

    // An unregistered directory matching the worktree pattern.
    let stray = repo.parent().unwrap().join("webapp-ORC-9");
    std::fs::create_dir_all(&stray).unwrap();
    std::fs::write(stray.join("junk.txt"), "leftover\n").unwrap();

    let report = run_cleanup(&pool, &provisioner, 0).await.unwrap();

    assert_eq!(report.strays_removed, 1);
    assert!(!stray.exists());
}

#[tokio::test]
async fn young_branches_survive_the_age_floor() {
    let tmp = tempfile::tempdir().unwrap();
    let repo = create_cloned_repo(tmp.path());
    let pool = create_test_store().await;
    let provisioner = WorktreeProvisioner::default();

    seed_task_with(&pool, "ORC-1", repo.to_str().unwrap(), TaskStatus::Done, 0).await;
    let invocation_id = insert_invocation(&pool, "ORC-1", Utc::now()).await.unwrap();
    let worktree = provisioner
        .create(&CreateRequest {
            repo_root: repo.clone(),
            task_id: "ORC-1".to_string(),
            invocation_id,
            base_ref: None,
        })
        .unwrap();
    provisioner.remove(&worktree.path, Some(&repo)).unwrap();

    // Default 60-minute floor: a branch committed seconds ago stays.
    run_cleanup(&pool, &provisioner, 60).await.unwrap();

    assert!(branch_exists(&repo, &worktree.branch));
}
