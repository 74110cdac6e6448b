//! Ticket <-> task reconciliation.
//!
//! The synchronizer is the only writer that reacts to tracker state: full
//! syncs and webhook events both funnel through [`Synchronizer::upsert_issue`],
//! with webhook events additionally passing echo suppression and conflict
//! resolution first. Outbound write-backs register an expected-change entry
//! before mutating the tracker so their own echo can be discarded.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use orca_db::models::{InvocationStatus, TaskStatus};
use orca_db::queries::invocations::{
    get_invocation, update_invocation, InvocationUpdate,
};
use orca_db::queries::tasks::{
    delete_task, get_task, insert_task, update_task_fields, update_task_status, NewTask,
    TaskUpdate,
};
use orca_db::SqlitePool;

use crate::bus::{EventBus, OrcaEvent};
use crate::coordination::Coordination;
use crate::graph::DependencyGraph;
use crate::tracker::{TrackerApi, TrackerError, TrackerIssue, WorkflowState};

// ---------------------------------------------------------------------------
// State mapping
// ---------------------------------------------------------------------------

pub const STATE_TODO: &str = "Todo";
pub const STATE_IN_PROGRESS: &str = "In Progress";
pub const STATE_IN_REVIEW: &str = "In Review";
pub const STATE_DONE: &str = "Done";
pub const STATE_CANCELED: &str = "Canceled";

/// Tracker state name -> local status. Unmapped names are skipped by sync;
/// `Canceled` is not mapped because it deletes instead.
pub fn map_tracker_state(name: &str) -> Option<TaskStatus> {
    match name {
        STATE_TODO => Some(TaskStatus::Ready),
        STATE_IN_PROGRESS => Some(TaskStatus::Running),
        STATE_IN_REVIEW => Some(TaskStatus::InReview),
        STATE_DONE => Some(TaskStatus::Done),
        _ => None,
    }
}

/// Intermediate states are usually echoes of our own writes; on first sight
/// of an issue there is no local runner holding them, so they normalize to
/// `ready`.
fn normalize_first_sight(status: TaskStatus) -> TaskStatus {
    match status {
        TaskStatus::Running | TaskStatus::InReview => TaskStatus::Ready,
        other => other,
    }
}

// ---------------------------------------------------------------------------
// Write-back transitions
// ---------------------------------------------------------------------------

/// Local transitions that reflect into the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBack {
    Dispatched,
    InReview,
    Deploying,
    Done,
    ChangesRequested,
    FailedPermanent,
    Retry,
}

impl WriteBack {
    /// Target tracker state name. `Deploying` is a deliberate no-op: the
    /// tracker stays at `In Review` while a deploy runs.
    pub fn target_state_name(&self) -> Option<&'static str> {
        match self {
            Self::Dispatched | Self::ChangesRequested => Some(STATE_IN_PROGRESS),
            Self::InReview => Some(STATE_IN_REVIEW),
            Self::Done => Some(STATE_DONE),
            Self::FailedPermanent => Some(STATE_CANCELED),
            Self::Retry => Some(STATE_TODO),
            Self::Deploying => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

/// Sync-side configuration: which projects to watch and where their
/// working copies live.
#[derive(Debug, Clone, Default)]
pub struct SyncConfig {
    pub project_ids: Vec<String>,
    /// project id -> repository root.
    pub project_repos: HashMap<String, PathBuf>,
    /// Fallback repository for projects without an explicit mapping.
    pub default_repo: Option<PathBuf>,
}

impl SyncConfig {
    fn resolve_repo(&self, project_id: Option<&str>) -> Option<&PathBuf> {
        project_id
            .and_then(|id| self.project_repos.get(id))
            .or(self.default_repo.as_ref())
    }
}

/// Result of one full sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
}

/// Outcome of applying one webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied,
    EchoSuppressed,
    Ignored,
}

pub struct Synchronizer {
    pool: SqlitePool,
    tracker: Arc<dyn TrackerApi>,
    coordination: Arc<Coordination>,
    bus: EventBus,
    graph: Arc<Mutex<DependencyGraph>>,
    config: SyncConfig,
    /// Workflow state map, refreshed on every full sync.
    state_map: RwLock<HashMap<String, WorkflowState>>,
}

impl Synchronizer {
    pub fn new(
        pool: SqlitePool,
        tracker: Arc<dyn TrackerApi>,
        coordination: Arc<Coordination>,
        bus: EventBus,
        graph: Arc<Mutex<DependencyGraph>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            pool,
            tracker,
            coordination,
            bus,
            graph,
            config,
            state_map: RwLock::new(HashMap::new()),
        }
    }

    pub fn graph(&self) -> Arc<Mutex<DependencyGraph>> {
        Arc::clone(&self.graph)
    }

    // -- Full sync ---------------------------------------------------------

    /// Fetch every issue across the configured projects, upsert each, then
    /// rebuild the dependency graph. Auth failures propagate; other
    /// per-project failures count into `failed`.
    pub async fn full_sync(&self) -> Result<SyncReport> {
        let mut issues: Vec<TrackerIssue> = Vec::new();
        let mut report = SyncReport::default();
        let mut team_ids: BTreeSet<String> = BTreeSet::new();

        for project_id in &self.config.project_ids {
            match self.tracker.fetch_issues(project_id).await {
                Ok(batch) => issues.extend(batch),
                Err(e) if e.is_auth() => return Err(e.into()),
                Err(e) => {
                    warn!(project_id, error = %e, "failed to fetch project issues");
                    report.failed += 1;
                    continue;
                }
            }

            match self.tracker.fetch_project(project_id).await {
                Ok(info) => team_ids.extend(info.team_ids),
                Err(e) if e.is_auth() => return Err(e.into()),
                Err(e) => {
                    warn!(project_id, error = %e, "failed to fetch project metadata");
                }
            }
        }

        if !team_ids.is_empty() {
            let ids: Vec<String> = team_ids.into_iter().collect();
            match self.tracker.fetch_workflow_states(&ids).await {
                Ok(map) => *self.state_map.write().await = map,
                Err(e) if e.is_auth() => return Err(e.into()),
                Err(e) => warn!(error = %e, "failed to refresh workflow states"),
            }
        }

        for issue in &issues {
            match self.upsert_issue(issue).await {
                Ok(()) => report.synced += 1,
                Err(e) => {
                    warn!(issue = %issue.identifier, error = %e, "upsert failed");
                    report.failed += 1;
                }
            }
        }

        let links: Vec<_> = issues.iter().map(TrackerIssue::links).collect();
        self.graph.lock().await.rebuild(&links);

        info!(synced = report.synced, failed = report.failed, "full sync complete");
        Ok(report)
    }

    // -- Upsert ------------------------------------------------------------

    /// Reconcile one tracker issue into the task table.
    pub async fn upsert_issue(&self, issue: &TrackerIssue) -> Result<()> {
        let task_id = issue.identifier.as_str();

        if issue.state_name == STATE_CANCELED {
            if get_task(&self.pool, task_id).await?.is_some() {
                self.kill_running_sessions(task_id, "cancellation").await?;
                delete_task(&self.pool, task_id).await?;
                info!(task_id, "task deleted after tracker cancellation");
            }
            return Ok(());
        }

        let Some(mapped) = map_tracker_state(&issue.state_name) else {
            debug!(task_id, state = %issue.state_name, "unmapped tracker state, skipping");
            return Ok(());
        };

        let Some(repo) = self.config.resolve_repo(issue.project_id.as_deref()) else {
            warn!(task_id, project = ?issue.project_id, "no repository configured, skipping");
            return Ok(());
        };
        let repo_path = repo.to_string_lossy().to_string();

        let prompt = match &issue.description {
            Some(description) => format!("{}\n\n{}", issue.title, description),
            None => issue.title.clone(),
        }
        .trim()
        .to_string();

        let existing = get_task(&self.pool, task_id).await?;

        let Some(existing) = existing else {
            let status = normalize_first_sight(mapped);
            insert_task(
                &self.pool,
                &NewTask {
                    id: task_id.to_string(),
                    prompt,
                    repo_path,
                    status,
                    priority: issue.priority,
                    parent_id: issue.parent_identifier.clone(),
                    is_parent: issue.has_children,
                },
            )
            .await?;
            self.publish_task_update(task_id, status);
            return Ok(());
        };

        // Tracker is authoritative for descriptive fields.
        update_task_fields(
            &self.pool,
            task_id,
            &TaskUpdate {
                prompt: Some(prompt),
                repo_path: Some(repo_path),
                priority: Some(issue.priority),
                parent_id: Some(issue.parent_identifier.clone()),
                is_parent: Some(issue.has_children),
                ..Default::default()
            },
        )
        .await?;

        // Status: user-initiated tracker states always win; intermediate
        // states never overwrite local state (they are echoes of our own
        // write-backs).
        match mapped {
            TaskStatus::Ready => {
                if existing.status != TaskStatus::Ready {
                    self.kill_running_sessions(task_id, "tracker reset to Todo").await?;
                    update_task_fields(
                        &self.pool,
                        task_id,
                        &TaskUpdate {
                            status: Some(TaskStatus::Ready),
                            retry_count: Some(0),
                            review_count: Some(0),
                            ..Default::default()
                        },
                    )
                    .await?;
                    self.publish_task_update(task_id, TaskStatus::Ready);
                }
            }
            TaskStatus::Done => {
                if existing.status != TaskStatus::Done {
                    update_task_status(&self.pool, task_id, TaskStatus::Done).await?;
                    self.publish_task_update(task_id, TaskStatus::Done);
                }
            }
            _ => {}
        }

        Ok(())
    }

    // -- Webhook path ------------------------------------------------------

    /// Apply one verified issue-event payload.
    ///
    /// Order matters: echo suppression first (the event may be our own
    /// write-back), then conflict resolution (so the upsert cannot clobber
    /// its decision), then the upsert itself.
    pub async fn process_webhook(&self, payload: &Value) -> Result<WebhookOutcome> {
        let action = payload
            .get("action")
            .and_then(Value::as_str)
            .context("webhook payload missing action")?;

        if action == "remove" {
            return Ok(WebhookOutcome::Ignored);
        }
        if action != "create" && action != "update" {
            return Ok(WebhookOutcome::Ignored);
        }

        let data = payload
            .get("data")
            .context("webhook payload missing data")?;
        let issue = parse_webhook_issue(data)
            .context("webhook data is not an issue payload")?;

        if self
            .coordination
            .consume_expected_change(&issue.identifier, &issue.state_name)
            .await
        {
            debug!(task_id = %issue.identifier, state = %issue.state_name, "write-back echo suppressed");
            return Ok(WebhookOutcome::EchoSuppressed);
        }

        self.resolve_conflict(&issue.identifier, &issue.state_name).await?;
        self.upsert_issue(&issue).await?;
        Ok(WebhookOutcome::Applied)
    }

    /// The conflict-resolution table: local status x tracker state.
    async fn resolve_conflict(&self, task_id: &str, state_name: &str) -> Result<()> {
        let Some(task) = get_task(&self.pool, task_id).await? else {
            return Ok(());
        };

        match (task.status, state_name) {
            (_, STATE_TODO) => {
                self.kill_running_sessions(task_id, "user moved task to Todo").await?;
                update_task_fields(
                    &self.pool,
                    task_id,
                    &TaskUpdate {
                        status: Some(TaskStatus::Ready),
                        retry_count: Some(0),
                        review_count: Some(0),
                        ..Default::default()
                    },
                )
                .await?;
                self.publish_task_update(task_id, TaskStatus::Ready);
            }
            (
                TaskStatus::Ready
                | TaskStatus::InReview
                | TaskStatus::Deploying
                | TaskStatus::AwaitingCi,
                STATE_DONE,
            ) => {
                update_task_status(&self.pool, task_id, TaskStatus::Done).await?;
                self.publish_task_update(task_id, TaskStatus::Done);
            }
            (TaskStatus::Deploying, STATE_IN_REVIEW) => {
                // The tracker lags during deploys; nothing to reconcile.
            }
            (_, STATE_CANCELED) => {
                self.kill_running_sessions(task_id, "cancellation").await?;
                delete_task(&self.pool, task_id).await?;
            }
            _ => {}
        }

        Ok(())
    }

    // -- Write-back --------------------------------------------------------

    /// Reflect a local transition into the tracker.
    ///
    /// Registers the expected echo before mutating, and swallows every
    /// failure: a write-back must never block a local state transition.
    pub async fn write_back(&self, task_id: &str, transition: WriteBack) {
        let Some(state_name) = transition.target_state_name() else {
            return;
        };

        let state = {
            let map = self.state_map.read().await;
            map.get(state_name).cloned()
        };
        let Some(state) = state else {
            warn!(task_id, state_name, "no workflow state mapped, skipping write-back");
            return;
        };

        self.coordination.expect_change(task_id, state_name).await;

        if let Err(e) = self.tracker.update_issue_state(task_id, &state.id).await {
            warn!(task_id, state_name, error = %e, "write-back failed");
        }
    }

    /// Best-effort tracker comment (manual retry notes and the like).
    pub async fn comment(&self, task_id: &str, body: &str) {
        if let Err(e) = self.tracker.create_comment(task_id, body).await {
            warn!(task_id, error = %e, "failed to create tracker comment");
        }
    }

    /// Replace the workflow state map (startup bootstrap and tests).
    pub async fn set_state_map(&self, map: HashMap<String, WorkflowState>) {
        *self.state_map.write().await = map;
    }

    // -- Session kill ------------------------------------------------------

    /// Kill any running session for a task: terminate the handle, fail the
    /// invocation with an "interrupted" summary, drop the handle entry.
    pub async fn kill_running_sessions(&self, task_id: &str, reason: &str) -> Result<()> {
        for handle in self.coordination.all_handles().await {
            let invocation = get_invocation(&self.pool, handle.invocation_id).await?;
            let Some(invocation) = invocation else {
                continue;
            };
            if invocation.task_id != task_id || invocation.status != InvocationStatus::Running {
                continue;
            }

            info!(task_id, invocation_id = handle.invocation_id, reason, "killing running session");

            // Settle the row first: the scheduler's completion continuation
            // fires on kill and must find the invocation already settled.
            update_invocation(
                &self.pool,
                handle.invocation_id,
                &InvocationUpdate {
                    status: Some(InvocationStatus::Failed),
                    ended_at: Some(Utc::now()),
                    output_summary: Some(format!("interrupted by {reason}")),
                    ..Default::default()
                },
            )
            .await?;

            handle.kill().await;

            self.coordination.remove_handle(handle.invocation_id).await;
        }

        Ok(())
    }

    fn publish_task_update(&self, task_id: &str, status: TaskStatus) {
        self.bus.publish(OrcaEvent::TaskUpdated {
            task_id: task_id.to_string(),
            status: status.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Webhook payload parsing
// ---------------------------------------------------------------------------

/// Flatten a webhook `data` object into the same issue shape the GraphQL
/// fetch produces. Webhook payloads carry no relation lists; the graph is
/// refreshed by the next full sync instead.
fn parse_webhook_issue(data: &Value) -> Option<TrackerIssue> {
    let id = data.get("id").and_then(Value::as_str)?;
    let identifier = data
        .get("identifier")
        .and_then(Value::as_str)
        .unwrap_or(id);
    let title = data.get("title").and_then(Value::as_str)?;

    Some(TrackerIssue {
        id: id.to_string(),
        identifier: identifier.to_string(),
        title: title.to_string(),
        description: data
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string),
        state_name: data
            .get("state")
            .and_then(|s| s.get("name"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string(),
        priority: data.get("priority").and_then(Value::as_i64).unwrap_or(0),
        project_id: data
            .get("projectId")
            .and_then(Value::as_str)
            .map(str::to_string),
        team_id: data
            .get("teamId")
            .and_then(Value::as_str)
            .map(str::to_string),
        parent_identifier: data
            .get("parent")
            .and_then(|p| p.get("identifier"))
            .and_then(Value::as_str)
            .map(str::to_string),
        has_children: false,
        relations: Vec::new(),
        inverse_relations: Vec::new(),
    })
}

/// Whether an anyhow error chain bottoms out in a tracker auth failure.
pub fn is_auth_error(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<TrackerError>()
        .is_some_and(TrackerError::is_auth)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
