//! Query functions for the `budget_events` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::models::BudgetEvent;

/// Record realized spend for an invocation.
///
/// Cost must be strictly positive; zero-cost sessions simply have no
/// budget event.
pub async fn insert_budget_event(
    pool: &SqlitePool,
    invocation_id: i64,
    cost_usd: f64,
) -> Result<i64> {
    if cost_usd <= 0.0 {
        anyhow::bail!("budget event cost must be positive, got {cost_usd}");
    }

    let row: (i64,) = sqlx::query_as(
        "INSERT INTO budget_events (invocation_id, cost_usd, created_at) \
         VALUES (?, ?, ?) RETURNING id",
    )
    .bind(invocation_id)
    .bind(cost_usd)
    .bind(Utc::now())
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert budget event for invocation {invocation_id}"))?;

    Ok(row.0)
}

/// Sum the cost of all events whose timestamp is at or after the cutoff.
pub async fn sum_cost_since(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<f64> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT SUM(cost_usd) FROM budget_events WHERE created_at >= ?",
    )
    .bind(cutoff)
    .fetch_one(pool)
    .await
    .context("failed to sum budget events")?;

    Ok(row.0.unwrap_or(0.0))
}

/// List all budget events, oldest first.
pub async fn list_budget_events(pool: &SqlitePool) -> Result<Vec<BudgetEvent>> {
    let events =
        sqlx::query_as::<_, BudgetEvent>("SELECT * FROM budget_events ORDER BY id ASC")
            .fetch_all(pool)
            .await
            .context("failed to list budget events")?;

    Ok(events)
}
