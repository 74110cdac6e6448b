use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

/// Create a connection pool against the store file, creating it if absent.
///
/// WAL mode keeps readers (API handlers) from blocking the scheduler's
/// writes; the busy timeout absorbs the brief write lock SQLite takes on
/// commit.
pub async fn create_pool(store_path: &Path) -> Result<SqlitePool> {
    if let Some(parent) = store_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create store directory {}", parent.display())
            })?;
        }
    }

    let options = SqliteConnectOptions::new()
        .filename(store_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open store at {}", store_path.display()))?;

    Ok(pool)
}

/// Create an in-memory pool for tests.
///
/// A single connection is required: each `:memory:` connection is its own
/// database, so a pool of several would see different (empty) schemas.
pub async fn create_memory_pool() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .context("failed to parse in-memory sqlite URL")?
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .context("failed to open in-memory store")?;

    Ok(pool)
}

/// Bootstrap the schema: create missing tables, then add any columns that
/// post-date the initial layout.
///
/// Migrations are additive only. Each late column is gated on a
/// `PRAGMA table_info` presence check so re-running against any prior
/// schema version is safe.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tasks (
            id            TEXT PRIMARY KEY,
            prompt        TEXT NOT NULL,
            repo_path     TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'backlog',
            priority      INTEGER NOT NULL DEFAULT 0,
            retry_count   INTEGER NOT NULL DEFAULT 0,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            completed_at  TEXT
        )",
    )
    .execute(pool)
    .await
    .context("failed to create tasks table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS invocations (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id        TEXT NOT NULL,
            status         TEXT NOT NULL DEFAULT 'running',
            started_at     TEXT NOT NULL,
            ended_at       TEXT,
            cost_usd       REAL,
            num_turns      INTEGER,
            branch         TEXT,
            worktree_path  TEXT,
            log_path       TEXT,
            output_summary TEXT
        )",
    )
    .execute(pool)
    .await
    .context("failed to create invocations table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS budget_events (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            invocation_id INTEGER NOT NULL,
            cost_usd      REAL NOT NULL,
            created_at    TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .context("failed to create budget_events table")?;

    // Columns added after the initial release. Presence-checked so the same
    // bootstrap runs against every prior store version.
    add_column_if_missing(pool, "tasks", "review_count", "INTEGER NOT NULL DEFAULT 0").await?;
    add_column_if_missing(pool, "tasks", "pr_branch", "TEXT").await?;
    add_column_if_missing(pool, "tasks", "parent_id", "TEXT").await?;
    add_column_if_missing(pool, "tasks", "is_parent", "INTEGER NOT NULL DEFAULT 0").await?;
    add_column_if_missing(pool, "invocations", "session_id", "TEXT").await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_invocations_task ON invocations (task_id)",
    )
    .execute(pool)
    .await
    .context("failed to create invocation task index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_invocations_status ON invocations (status)",
    )
    .execute(pool)
    .await
    .context("failed to create invocation status index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_budget_events_created ON budget_events (created_at)",
    )
    .execute(pool)
    .await
    .context("failed to create budget event index")?;

    Ok(())
}

/// Check for a column via `PRAGMA table_info` and add it when absent.
async fn add_column_if_missing(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    // Table and column names come from the literals above, never from input.
    let query = format!("PRAGMA table_info({table})");
    let rows: Vec<(i64, String, String, i64, Option<String>, i64)> =
        sqlx::query_as(&query)
            .fetch_all(pool)
            .await
            .with_context(|| format!("failed to read table info for {table}"))?;

    let present = rows.iter().any(|(_, name, ..)| name == column);
    if present {
        return Ok(());
    }

    let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {definition}");
    sqlx::query(&alter)
        .execute(pool)
        .await
        .with_context(|| format!("failed to add column {table}.{column}"))?;

    info!(table, column, "added store column");
    Ok(())
}
