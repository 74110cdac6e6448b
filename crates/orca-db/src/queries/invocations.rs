//! Query functions for the `invocations` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::{Invocation, InvocationStatus};

/// Optional field updates applied in a single UPDATE statement.
#[derive(Debug, Clone, Default)]
pub struct InvocationUpdate {
    pub status: Option<InvocationStatus>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub log_path: Option<String>,
    pub session_id: Option<String>,
    pub output_summary: Option<String>,
}

/// Insert a new invocation in the `running` status. Returns the assigned
/// identifier.
pub async fn insert_invocation(
    pool: &SqlitePool,
    task_id: &str,
    started_at: DateTime<Utc>,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO invocations (task_id, status, started_at) \
         VALUES (?, 'running', ?) RETURNING id",
    )
    .bind(task_id)
    .bind(started_at)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert invocation for task {task_id}"))?;

    Ok(row.0)
}

/// Fetch a single invocation by identifier.
pub async fn get_invocation(pool: &SqlitePool, id: i64) -> Result<Option<Invocation>> {
    let invocation = sqlx::query_as::<_, Invocation>("SELECT * FROM invocations WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch invocation")?;

    Ok(invocation)
}

/// List all invocations for a task, newest first.
pub async fn list_invocations_for_task(pool: &SqlitePool, task_id: &str) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations WHERE task_id = ? ORDER BY id DESC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list invocations for task")?;

    Ok(invocations)
}

/// List every invocation in the `running` status.
pub async fn list_running_invocations(pool: &SqlitePool) -> Result<Vec<Invocation>> {
    let invocations = sqlx::query_as::<_, Invocation>(
        "SELECT * FROM invocations WHERE status = 'running' ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list running invocations")?;

    Ok(invocations)
}

/// List all invocations, newest first.
pub async fn list_invocations(pool: &SqlitePool) -> Result<Vec<Invocation>> {
    let invocations =
        sqlx::query_as::<_, Invocation>("SELECT * FROM invocations ORDER BY id DESC")
            .fetch_all(pool)
            .await
            .context("failed to list invocations")?;

    Ok(invocations)
}

/// Whether a task currently has a `running` invocation.
pub async fn has_running_invocation(pool: &SqlitePool, task_id: &str) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM invocations WHERE task_id = ? AND status = 'running'",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to check for running invocation")?;

    Ok(row.0 > 0)
}

/// Apply a partial field update in one statement.
pub async fn update_invocation(
    pool: &SqlitePool,
    id: i64,
    update: &InvocationUpdate,
) -> Result<()> {
    let mut builder = sqlx::QueryBuilder::new("UPDATE invocations SET id = id");

    if let Some(status) = update.status {
        builder.push(", status = ").push_bind(status);
    }
    if let Some(ended_at) = update.ended_at {
        builder.push(", ended_at = ").push_bind(ended_at);
    }
    if let Some(cost_usd) = update.cost_usd {
        builder.push(", cost_usd = ").push_bind(cost_usd);
    }
    if let Some(num_turns) = update.num_turns {
        builder.push(", num_turns = ").push_bind(num_turns);
    }
    if let Some(ref branch) = update.branch {
        builder.push(", branch = ").push_bind(branch);
    }
    if let Some(ref worktree_path) = update.worktree_path {
        builder.push(", worktree_path = ").push_bind(worktree_path);
    }
    if let Some(ref log_path) = update.log_path {
        builder.push(", log_path = ").push_bind(log_path);
    }
    if let Some(ref session_id) = update.session_id {
        builder.push(", session_id = ").push_bind(session_id);
    }
    if let Some(ref output_summary) = update.output_summary {
        builder.push(", output_summary = ").push_bind(output_summary);
    }

    builder.push(" WHERE id = ").push_bind(id);

    let result = builder
        .build()
        .execute(pool)
        .await
        .context("failed to update invocation")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("invocation {id} not found");
    }

    Ok(())
}

/// Invocation counts per task, for list-view augmentation.
pub async fn count_by_task(pool: &SqlitePool) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> =
        sqlx::query_as("SELECT task_id, COUNT(*) FROM invocations GROUP BY task_id")
            .fetch_all(pool)
            .await
            .context("failed to count invocations by task")?;

    Ok(rows)
}
