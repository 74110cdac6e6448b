use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    Dispatched,
    Running,
    InReview,
    ChangesRequested,
    Deploying,
    AwaitingCi,
    Done,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses: nothing further happens to the task locally.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::InReview => "in_review",
            Self::ChangesRequested => "changes_requested",
            Self::Deploying => "deploying",
            Self::AwaitingCi => "awaiting_ci",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(Self::Backlog),
            "ready" => Ok(Self::Ready),
            "dispatched" => Ok(Self::Dispatched),
            "running" => Ok(Self::Running),
            "in_review" => Ok(Self::InReview),
            "changes_requested" => Ok(Self::ChangesRequested),
            "deploying" => Ok(Self::Deploying),
            "awaiting_ci" => Ok(Self::AwaitingCi),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a single agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

impl FromStr for InvocationStatus {
    type Err = InvocationStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(InvocationStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`InvocationStatus`] string.
#[derive(Debug, Clone)]
pub struct InvocationStatusParseError(pub String);

impl fmt::Display for InvocationStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid invocation status: {:?}", self.0)
    }
}

impl std::error::Error for InvocationStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A task -- one unit of work originating from a tracker ticket.
///
/// The primary key is the tracker-issued external identifier, so the same
/// ticket always maps to the same row regardless of how many times it is
/// synced.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: String,
    pub prompt: String,
    pub repo_path: String,
    pub status: TaskStatus,
    /// Lower is more urgent; 0 means "no priority" and never propagates.
    pub priority: i64,
    pub retry_count: i64,
    pub review_count: i64,
    pub pr_branch: Option<String>,
    pub parent_id: Option<String>,
    pub is_parent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One agent-session attempt against a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Invocation {
    pub id: i64,
    pub task_id: String,
    pub status: InvocationStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<i64>,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub log_path: Option<String>,
    pub session_id: Option<String>,
    pub output_summary: Option<String>,
}

/// An immutable record of realized agent spend.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BudgetEvent {
    pub id: i64,
    pub invocation_id: i64,
    pub cost_usd: f64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
