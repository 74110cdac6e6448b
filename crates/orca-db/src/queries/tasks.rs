//! Query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Task, TaskStatus};

/// Fields for a new task row. Counters start at zero and timestamps are
/// assigned here so every insert path stamps them the same way.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub prompt: String,
    pub repo_path: String,
    pub status: TaskStatus,
    pub priority: i64,
    pub parent_id: Option<String>,
    pub is_parent: bool,
}

/// Optional field updates applied in a single UPDATE statement.
///
/// `None` leaves the column untouched. `updated_at` is always stamped.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub prompt: Option<String>,
    pub repo_path: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<i64>,
    pub retry_count: Option<i64>,
    pub review_count: Option<i64>,
    pub pr_branch: Option<Option<String>>,
    pub parent_id: Option<Option<String>>,
    pub is_parent: Option<bool>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

/// Insert a new task row. Returns the inserted task.
pub async fn insert_task(pool: &SqlitePool, new: &NewTask) -> Result<Task> {
    let now = Utc::now();
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks \
           (id, prompt, repo_path, status, priority, retry_count, review_count, \
            pr_branch, parent_id, is_parent, created_at, updated_at, completed_at) \
         VALUES (?, ?, ?, ?, ?, 0, 0, NULL, ?, ?, ?, ?, NULL) \
         RETURNING *",
    )
    .bind(&new.id)
    .bind(&new.prompt)
    .bind(&new.repo_path)
    .bind(new.status)
    .bind(new.priority)
    .bind(&new.parent_id)
    .bind(new.is_parent)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert task {}", new.id))?;

    Ok(task)
}

/// Fetch a single task by external identifier.
pub async fn get_task(pool: &SqlitePool, id: &str) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks, most urgent first (priority ascending, then creation
/// time ascending).
pub async fn list_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks ORDER BY priority ASC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list tasks")?;

    Ok(tasks)
}

/// List tasks in the `ready` state, oldest first.
pub async fn list_ready_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'ready' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list ready tasks")?;

    Ok(tasks)
}

/// List tasks waiting on CI.
pub async fn list_awaiting_ci_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'awaiting_ci' ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list awaiting-ci tasks")?;

    Ok(tasks)
}

/// Count tasks currently occupying a concurrency slot (`dispatched` or
/// `running`).
pub async fn count_active_tasks(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE status IN ('dispatched', 'running')",
    )
    .fetch_one(pool)
    .await
    .context("failed to count active tasks")?;

    Ok(row.0)
}

/// Count distinct tasks that have an invocation in the `running` status.
pub async fn count_tasks_with_running_invocation(pool: &SqlitePool) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(DISTINCT task_id) FROM invocations WHERE status = 'running'",
    )
    .fetch_one(pool)
    .await
    .context("failed to count tasks with running invocations")?;

    Ok(row.0)
}

/// Update the status of a task, stamping `updated_at` and setting
/// `completed_at` when the new status is terminal.
pub async fn update_task_status(pool: &SqlitePool, id: &str, status: TaskStatus) -> Result<()> {
    let now = Utc::now();
    let completed_at = status.is_terminal().then_some(now);
    let result = sqlx::query(
        "UPDATE tasks SET status = ?, updated_at = ?, \
         completed_at = COALESCE(?, completed_at) WHERE id = ?",
    )
    .bind(status)
    .bind(now)
    .bind(completed_at)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update task status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Apply a partial field update in one statement.
pub async fn update_task_fields(pool: &SqlitePool, id: &str, update: &TaskUpdate) -> Result<()> {
    let mut builder = sqlx::QueryBuilder::new("UPDATE tasks SET updated_at = ");
    builder.push_bind(Utc::now());

    if let Some(ref prompt) = update.prompt {
        builder.push(", prompt = ").push_bind(prompt);
    }
    if let Some(ref repo_path) = update.repo_path {
        builder.push(", repo_path = ").push_bind(repo_path);
    }
    if let Some(status) = update.status {
        builder.push(", status = ").push_bind(status);
    }
    if let Some(priority) = update.priority {
        builder.push(", priority = ").push_bind(priority);
    }
    if let Some(retry_count) = update.retry_count {
        builder.push(", retry_count = ").push_bind(retry_count);
    }
    if let Some(review_count) = update.review_count {
        builder.push(", review_count = ").push_bind(review_count);
    }
    if let Some(ref pr_branch) = update.pr_branch {
        builder.push(", pr_branch = ").push_bind(pr_branch.clone());
    }
    if let Some(ref parent_id) = update.parent_id {
        builder.push(", parent_id = ").push_bind(parent_id.clone());
    }
    if let Some(is_parent) = update.is_parent {
        builder.push(", is_parent = ").push_bind(is_parent);
    }
    if let Some(completed_at) = update.completed_at {
        builder.push(", completed_at = ").push_bind(completed_at);
    }

    builder.push(" WHERE id = ").push_bind(id);

    let result = builder
        .build()
        .execute(pool)
        .await
        .context("failed to update task fields")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}

/// Increment the retry counter. Returns the new value.
pub async fn increment_retry(pool: &SqlitePool, id: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "UPDATE tasks SET retry_count = retry_count + 1, updated_at = ? \
         WHERE id = ? RETURNING retry_count",
    )
    .bind(Utc::now())
    .bind(id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to increment retry for task {id}"))?;

    Ok(row.0)
}

/// Delete a task row. Deleting a missing task is a no-op.
pub async fn delete_task(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM tasks WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .context("failed to delete task")?;

    Ok(())
}

/// Distinct repository paths referenced by any task. Used by the cleanup
/// sweep.
pub async fn list_repo_paths(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT repo_path FROM tasks ORDER BY repo_path")
            .fetch_all(pool)
            .await
            .context("failed to list repo paths")?;

    Ok(rows.into_iter().map(|(p,)| p).collect())
}

/// Task counts grouped by status, for `/api/status` and `/api/metrics`.
pub async fn count_by_status(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT status, COUNT(*) FROM tasks GROUP BY status")
            .fetch_all(pool)
            .await
            .context("failed to count tasks by status")?;

    Ok(rows)
}
