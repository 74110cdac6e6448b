//! The tick-driven dispatch engine.
//!
//! Every tick sweeps timeouts, applies the concurrency and budget gates,
//! filters the ready set through the dependency graph, and dispatches at
//! most one task: worktree first, then the agent subprocess, with a
//! completion continuation attached to the runner's `done` future.
//!
//! Overlapping ticks are discarded, not queued: a tick that finds the
//! guard held simply returns, so a task transitions at most once per tick.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use orca_db::models::{InvocationStatus, Task, TaskStatus};
use orca_db::queries::budget::{insert_budget_event, sum_cost_since};
use orca_db::queries::invocations::{
    get_invocation, has_running_invocation, insert_invocation, list_running_invocations,
    update_invocation, InvocationUpdate,
};
use orca_db::queries::tasks::{
    count_active_tasks, get_task, increment_retry, list_ready_tasks, list_tasks,
    update_task_status,
};
use orca_db::SqlitePool;

use crate::bus::{EventBus, OrcaEvent};
use crate::coordination::Coordination;
use crate::graph::DependencyGraph;
use crate::runner::{self, SessionResult, SpawnRequest};
use crate::settings::SharedSettings;
use crate::sync::{Synchronizer, WriteBack};
use crate::worktree::{CreateRequest, WorktreeError, WorktreeProvisioner};

/// Consecutive platform-transient worktree failures a task may absorb
/// before it is promoted to a real failure.
const TRANSIENT_DISPATCH_LIMIT: u32 = 5;

/// A cheaply cloneable handle to the dispatch engine; all clones share the
/// same tick guard, failure counters, and cancellation token.
#[derive(Clone)]
pub struct Scheduler {
    pool: SqlitePool,
    settings: SharedSettings,
    coordination: Arc<Coordination>,
    provisioner: WorktreeProvisioner,
    sync: Arc<Synchronizer>,
    bus: EventBus,
    graph: Arc<Mutex<DependencyGraph>>,
    /// Orca's own root; agent logs land under `<root>/logs/`.
    project_root: PathBuf,
    /// Discards overlapping ticks.
    tick_guard: Arc<Mutex<()>>,
    /// Per-task consecutive transient dispatch failures.
    transient_failures: Arc<Mutex<HashMap<String, u32>>>,
    cancel: CancellationToken,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        settings: SharedSettings,
        coordination: Arc<Coordination>,
        provisioner: WorktreeProvisioner,
        sync: Arc<Synchronizer>,
        bus: EventBus,
        project_root: PathBuf,
    ) -> Self {
        let graph = sync.graph();
        Self {
            pool,
            settings,
            coordination,
            provisioner,
            sync,
            bus,
            graph,
            project_root,
            tick_guard: Arc::new(Mutex::new(())),
            transient_failures: Arc::new(Mutex::new(HashMap::new())),
            cancel: CancellationToken::new(),
        }
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Startup orphan recovery. Runs before any dispatch: the handle table
    /// is empty at boot, so every `running` invocation is by definition a
    /// ghost from a crashed prior process.
    pub async fn recover_orphans(&self) -> Result<()> {
        let orphans = list_running_invocations(&self.pool).await?;
        for invocation in &orphans {
            warn!(
                invocation_id = invocation.id,
                task_id = %invocation.task_id,
                "failing orphaned invocation from prior process"
            );
            update_invocation(
                &self.pool,
                invocation.id,
                &InvocationUpdate {
                    status: Some(InvocationStatus::Failed),
                    ended_at: Some(Utc::now()),
                    output_summary: Some("orphaned by restart".to_string()),
                    ..Default::default()
                },
            )
            .await?;
        }

        for task in list_tasks(&self.pool).await? {
            if !matches!(task.status, TaskStatus::Running | TaskStatus::Dispatched) {
                continue;
            }
            if has_running_invocation(&self.pool, &task.id).await? {
                continue;
            }
            info!(task_id = %task.id, "resetting orphaned task to ready");
            update_task_status(&self.pool, &task.id, TaskStatus::Ready).await?;
            self.publish_task_update(&task.id, TaskStatus::Ready);
        }

        Ok(())
    }

    /// Spawn the tick loop. The first tick runs immediately; subsequent
    /// ticks follow the (runtime-tunable) cadence.
    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = scheduler.tick().await {
                    warn!(error = %e, "tick failed");
                }

                let interval = {
                    let settings = scheduler.settings.read().await;
                    std::time::Duration::from_secs(settings.tick_interval_secs)
                };

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = scheduler.cancel.cancelled() => {
                        debug!("tick loop cancelled");
                        return;
                    }
                }
            }
        });
    }

    /// Stop ticking and kill every live session. Mirrors orphan recovery:
    /// invocations fail, tasks reset to ready, worktrees are removed
    /// best-effort.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        let handles = self.coordination.all_handles().await;
        let count = handles.len();
        for handle in handles {
            let invocation_id = handle.invocation_id;

            let Ok(Some(invocation)) = get_invocation(&self.pool, invocation_id).await else {
                continue;
            };

            // Settle before kill, so the completion continuation ignores
            // the session's death.
            let _ = update_invocation(
                &self.pool,
                invocation_id,
                &InvocationUpdate {
                    status: Some(InvocationStatus::Failed),
                    ended_at: Some(Utc::now()),
                    output_summary: Some("interrupted by shutdown".to_string()),
                    ..Default::default()
                },
            )
            .await;

            handle.kill().await;
            self.coordination.remove_handle(invocation_id).await;

            let _ = update_task_status(&self.pool, &invocation.task_id, TaskStatus::Ready).await;

            if let Some(ref worktree_path) = invocation.worktree_path {
                let repo = get_task(&self.pool, &invocation.task_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| PathBuf::from(t.repo_path));
                if let Err(e) = self
                    .provisioner
                    .remove(Path::new(worktree_path), repo.as_deref())
                {
                    warn!(worktree = %worktree_path, error = %e, "failed to remove worktree at shutdown");
                }
            }
        }

        info!(sessions = count, "scheduler shut down, all sessions resolved");
    }

    // -- Tick --------------------------------------------------------------

    /// One scheduler tick. Re-entry is discarded.
    pub async fn tick(&self) -> Result<()> {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            debug!("previous tick still running, discarding");
            return Ok(());
        };

        let now = Utc::now();
        let settings = self.settings.read().await.clone();

        // 1. Timeout sweep.
        self.sweep_timeouts(settings.session_timeout_min, settings.max_retries)
            .await?;

        // 2. Concurrency gate.
        let active = count_active_tasks(&self.pool).await?;
        if active >= settings.concurrency_cap {
            debug!(active, cap = settings.concurrency_cap, "concurrency cap reached");
            return Ok(());
        }

        // 3. Budget gate.
        let cutoff = now - ChronoDuration::hours(settings.budget_window_hours);
        let spent = sum_cost_since(&self.pool, cutoff).await?;
        if spent >= settings.budget_max_cost_usd {
            info!(
                spent,
                cap = settings.budget_max_cost_usd,
                window_hours = settings.budget_window_hours,
                "budget cap reached, skipping dispatch"
            );
            return Ok(());
        }

        // 4. Cooldown expiry.
        self.coordination.expire_cooldowns(now).await;

        // 5-6. Candidate set, ordered by effective priority.
        let Some(task) = self.pick_candidate().await? else {
            return Ok(());
        };

        // 7. Dispatch exactly one.
        self.dispatch(task, &settings.agent_executable, settings.max_turns, settings.max_retries, settings.repo_cooldown_secs)
            .await?;

        Ok(())
    }

    async fn sweep_timeouts(&self, timeout_min: i64, max_retries: i64) -> Result<()> {
        let now = Utc::now();
        for invocation in list_running_invocations(&self.pool).await? {
            let age = now - invocation.started_at;
            if age < ChronoDuration::minutes(timeout_min) {
                continue;
            }

            warn!(
                invocation_id = invocation.id,
                task_id = %invocation.task_id,
                age_min = age.num_minutes(),
                "session exceeded timeout, killing"
            );

            // Settle the row before killing: the session's completion
            // continuation fires on kill and must find it already settled.
            update_invocation(
                &self.pool,
                invocation.id,
                &InvocationUpdate {
                    status: Some(InvocationStatus::TimedOut),
                    ended_at: Some(Utc::now()),
                    output_summary: Some("session timed out".to_string()),
                    ..Default::default()
                },
            )
            .await?;

            if let Some(handle) = self.coordination.remove_handle(invocation.id).await {
                handle.kill().await;
            }

            update_task_status(&self.pool, &invocation.task_id, TaskStatus::Failed).await?;
            self.publish_task_update(&invocation.task_id, TaskStatus::Failed);
            self.apply_retry_rule(&invocation.task_id, max_retries).await?;
        }

        Ok(())
    }

    /// Filter the ready set and return the most urgent dispatchable task.
    async fn pick_candidate(&self) -> Result<Option<Task>> {
        let ready = list_ready_tasks(&self.pool).await?;
        if ready.is_empty() {
            return Ok(None);
        }

        // Snapshot every task once; the graph callbacks are synchronous.
        let all_tasks = list_tasks(&self.pool).await?;
        let statuses: HashMap<String, TaskStatus> = all_tasks
            .iter()
            .map(|t| (t.id.clone(), t.status))
            .collect();
        let priorities: HashMap<String, i64> = all_tasks
            .iter()
            .map(|t| (t.id.clone(), t.priority))
            .collect();

        let graph = self.graph.lock().await;
        let status_of = |id: &str| statuses.get(id).copied();
        let priority_of = |id: &str| priorities.get(id).copied().unwrap_or(0);

        let mut candidates: Vec<(i64, Task)> = Vec::new();
        for task in ready {
            if task.prompt.trim().is_empty() {
                continue;
            }
            // Parent tickets are rollups; their children carry the work.
            if task.is_parent {
                continue;
            }
            if has_running_invocation(&self.pool, &task.id).await? {
                continue;
            }
            if self
                .coordination
                .is_on_cooldown(Path::new(&task.repo_path))
                .await
            {
                debug!(task_id = %task.id, repo = %task.repo_path, "repo on cooldown");
                continue;
            }
            if !graph.is_dispatchable(&task.id, &status_of) {
                continue;
            }

            let effective = graph.effective_priority(&task.id, &priority_of);
            // 0 is the "no priority" sentinel: unprioritized work queues
            // behind everything that has a priority.
            let sort_key = if effective == 0 { i64::MAX } else { effective };
            candidates.push((sort_key, task));
        }
        drop(graph);

        candidates.sort_by(|(pa, ta), (pb, tb)| {
            pa.cmp(pb).then_with(|| ta.created_at.cmp(&tb.created_at))
        });

        Ok(candidates.into_iter().next().map(|(_, task)| task))
    }

    // -- Dispatch ----------------------------------------------------------

    async fn dispatch(
        &self,
        task: Task,
        executable: &str,
        max_turns: u32,
        max_retries: i64,
        cooldown_secs: i64,
    ) -> Result<()> {
        let task_id = task.id.clone();
        info!(task_id = %task_id, "dispatching");

        update_task_status(&self.pool, &task_id, TaskStatus::Dispatched).await?;
        self.publish_task_update(&task_id, TaskStatus::Dispatched);
        self.spawn_write_back(&task_id, WriteBack::Dispatched);

        let invocation_id = insert_invocation(&self.pool, &task_id, Utc::now()).await?;

        let create = CreateRequest {
            repo_root: PathBuf::from(&task.repo_path),
            task_id: task_id.clone(),
            invocation_id,
            base_ref: task.pr_branch.clone(),
        };

        let worktree = match self.provisioner.create(&create) {
            Ok(worktree) => worktree,
            Err(e) => {
                return self
                    .handle_worktree_failure(&task, invocation_id, &e, max_retries, cooldown_secs)
                    .await;
            }
        };

        // A fresh dispatch succeeded; the transient streak is over.
        self.transient_failures.lock().await.remove(&task_id);

        let log_path = runner::log_path(&self.project_root, invocation_id);
        let handle = runner::spawn_session(SpawnRequest {
            prompt: task.prompt.clone(),
            worktree_path: worktree.path.clone(),
            max_turns,
            invocation_id,
            project_root: self.project_root.clone(),
            executable: executable.to_string(),
            system_prompt_suffix: None,
            disallowed_tools: Vec::new(),
            resume_session_id: None,
            repo_path: Some(PathBuf::from(&task.repo_path)),
        });

        update_task_status(&self.pool, &task_id, TaskStatus::Running).await?;
        self.publish_task_update(&task_id, TaskStatus::Running);

        update_invocation(
            &self.pool,
            invocation_id,
            &InvocationUpdate {
                branch: Some(worktree.branch.clone()),
                worktree_path: Some(worktree.path.to_string_lossy().to_string()),
                log_path: Some(log_path.to_string_lossy().to_string()),
                ..Default::default()
            },
        )
        .await?;

        self.coordination.insert_handle(handle.clone()).await;
        self.bus.publish(OrcaEvent::InvocationStarted {
            invocation_id,
            task_id: task_id.clone(),
        });

        // Completion continuation: resolves exactly once per session.
        let scheduler = self.clone();
        tokio::spawn(async move {
            let result = handle.wait_done().await;
            if let Err(e) = scheduler.complete_session(invocation_id, result).await {
                warn!(invocation_id, error = %e, "completion handling failed");
            }
        });

        Ok(())
    }

    /// Classify a worktree-creation failure.
    ///
    /// DLL-init failures put the repo on cooldown and leave the task
    /// `ready` so the next tick retries cheaply, until the per-task streak
    /// reaches the limit and the failure is promoted to a real one.
    /// Signal kills get the streak without the cooldown. Everything else
    /// fails the task outright.
    async fn handle_worktree_failure(
        &self,
        task: &Task,
        invocation_id: i64,
        error: &WorktreeError,
        max_retries: i64,
        cooldown_secs: i64,
    ) -> Result<()> {
        let task_id = task.id.as_str();
        warn!(task_id, invocation_id, error = %error, "worktree creation failed");

        update_invocation(
            &self.pool,
            invocation_id,
            &InvocationUpdate {
                status: Some(InvocationStatus::Failed),
                ended_at: Some(Utc::now()),
                output_summary: Some(format!("worktree creation failed: {error}")),
                ..Default::default()
            },
        )
        .await?;

        let git_error = error.as_git();
        let dll_init = git_error.map(|e| e.is_dll_init_failure()).unwrap_or(false);
        let signal_killed = git_error.map(|e| e.is_signal_killed()).unwrap_or(false);

        if dll_init || signal_killed {
            if dll_init {
                let expiry = Utc::now() + ChronoDuration::seconds(cooldown_secs);
                self.coordination
                    .set_cooldown(Path::new(&task.repo_path), expiry)
                    .await;
            }

            let streak = {
                let mut counters = self.transient_failures.lock().await;
                let streak = counters.entry(task_id.to_string()).or_insert(0);
                *streak += 1;
                *streak
            };

            if streak < TRANSIENT_DISPATCH_LIMIT {
                // Not a real failure yet: back to ready for the next tick.
                update_task_status(&self.pool, task_id, TaskStatus::Ready).await?;
                self.publish_task_update(task_id, TaskStatus::Ready);
                return Ok(());
            }

            warn!(task_id, streak, "transient dispatch failures exhausted");
            self.transient_failures.lock().await.remove(task_id);
        }

        update_task_status(&self.pool, task_id, TaskStatus::Failed).await?;
        self.publish_task_update(task_id, TaskStatus::Failed);

        if dll_init || signal_killed {
            self.apply_retry_rule(task_id, max_retries).await?;
        }

        Ok(())
    }

    // -- Completion --------------------------------------------------------

    /// The continuation attached to every runner's `done` future.
    pub async fn complete_session(&self, invocation_id: i64, result: SessionResult) -> Result<()> {
        self.coordination.remove_handle(invocation_id).await;

        let Some(invocation) = get_invocation(&self.pool, invocation_id).await? else {
            warn!(invocation_id, "completed session has no invocation row");
            return Ok(());
        };
        let task_id = invocation.task_id.clone();

        // The conflict paths (abort, Todo override, cancellation) settle the
        // invocation themselves; a late completion must not resurrect it.
        if invocation.status != InvocationStatus::Running {
            debug!(invocation_id, "invocation already settled, ignoring completion");
            return Ok(());
        }

        let status = if result.is_success() {
            InvocationStatus::Completed
        } else {
            InvocationStatus::Failed
        };

        update_invocation(
            &self.pool,
            invocation_id,
            &InvocationUpdate {
                status: Some(status),
                ended_at: Some(Utc::now()),
                cost_usd: result.cost_usd,
                num_turns: result.num_turns,
                output_summary: Some(result.output_summary.clone()),
                session_id: result.session_id.clone(),
                ..Default::default()
            },
        )
        .await?;

        if let Some(cost) = result.cost_usd {
            if cost > 0.0 {
                insert_budget_event(&self.pool, invocation_id, cost).await?;
            }
        }

        self.bus.publish(OrcaEvent::InvocationCompleted {
            invocation_id,
            task_id: task_id.clone(),
            status: status.to_string(),
        });

        let max_retries = self.settings.read().await.max_retries;

        if result.is_success() {
            info!(
                task_id = %task_id,
                invocation_id,
                cost_usd = ?result.cost_usd,
                turns = ?result.num_turns,
                "session completed"
            );
            update_task_status(&self.pool, &task_id, TaskStatus::Done).await?;
            self.publish_task_update(&task_id, TaskStatus::Done);
            self.spawn_write_back(&task_id, WriteBack::Done);

            if let Some(ref worktree_path) = invocation.worktree_path {
                let repo = get_task(&self.pool, &task_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|t| PathBuf::from(t.repo_path));
                if let Err(e) = self
                    .provisioner
                    .remove(Path::new(worktree_path), repo.as_deref())
                {
                    warn!(worktree = %worktree_path, error = %e, "failed to remove worktree");
                }
            }
        } else {
            warn!(
                task_id = %task_id,
                invocation_id,
                subtype = %result.subtype,
                summary = %result.output_summary,
                "session failed"
            );
            // The worktree stays on disk for forensics.
            update_task_status(&self.pool, &task_id, TaskStatus::Failed).await?;
            self.publish_task_update(&task_id, TaskStatus::Failed);
            self.apply_retry_rule(&task_id, max_retries).await?;
        }

        Ok(())
    }

    /// The retry rule: under the budget, arm another attempt via the
    /// tracker (`retry` write-back moves the ticket to Todo, whose echo
    /// resets the task). Over it, the ticket is canceled. The scheduler
    /// itself never resets a task to `ready` -- retry accounting stays
    /// authoritative in one place.
    async fn apply_retry_rule(&self, task_id: &str, max_retries: i64) -> Result<()> {
        let Some(task) = get_task(&self.pool, task_id).await? else {
            return Ok(());
        };

        if task.retry_count < max_retries {
            let new_count = increment_retry(&self.pool, task_id).await?;
            info!(task_id, retry_count = new_count, max_retries, "arming retry");
            self.spawn_write_back(task_id, WriteBack::Retry);
        } else {
            warn!(task_id, retries = task.retry_count, "retries exhausted, failing permanently");
            self.spawn_write_back(task_id, WriteBack::FailedPermanent);
        }

        Ok(())
    }

    // -- Helpers -----------------------------------------------------------

    /// Write-backs are fire-and-forget: they must never block or fail a
    /// local transition, so they run on their own task.
    fn spawn_write_back(&self, task_id: &str, transition: WriteBack) {
        let sync = Arc::clone(&self.sync);
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            sync.write_back(&task_id, transition).await;
        });
    }

    fn publish_task_update(&self, task_id: &str, status: TaskStatus) {
        self.bus.publish(OrcaEvent::TaskUpdated {
            task_id: task_id.to_string(),
            status: status.to_string(),
        });
    }

    #[cfg(test)]
    pub(crate) async fn transient_streak(&self, task_id: &str) -> u32 {
        self.transient_failures
            .lock()
            .await
            .get(task_id)
            .copied()
            .unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use async_trait::async_trait;

    use orca_db::models::InvocationStatus;
    use orca_db::queries::budget::list_budget_events;
    use orca_db::queries::invocations::list_invocations;
    use orca_db::queries::tasks::{insert_task, NewTask};
    use orca_test_utils::{create_test_store, seed_task_with};

    use crate::git::GitError;
    use crate::settings::{shared, Settings};
    use crate::sync::{SyncConfig, Synchronizer};
    use crate::tracker::{
        ProjectInfo, TrackerApi, TrackerError, TrackerIssue, WorkflowState,
    };
    use crate::worktree::WorktreeError;

    #[derive(Default)]
    struct RecordingTracker {
        state_updates: std::sync::Mutex<Vec<(String, String)>>,
    }

    impl RecordingTracker {
        fn updates(&self) -> Vec<(String, String)> {
            self.state_updates.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TrackerApi for RecordingTracker {
        async fn fetch_issues(&self, _: &str) -> Result<Vec<TrackerIssue>, TrackerError> {
            Ok(Vec::new())
        }
        async fn fetch_project(&self, _: &str) -> Result<ProjectInfo, TrackerError> {
            Ok(ProjectInfo { description: None, team_ids: Vec::new() })
        }
        async fn fetch_workflow_states(
            &self,
            _: &[String],
        ) -> Result<StdHashMap<String, WorkflowState>, TrackerError> {
            Ok(StdHashMap::new())
        }
        async fn update_issue_state(&self, id: &str, state: &str) -> Result<(), TrackerError> {
            self.state_updates
                .lock()
                .unwrap()
                .push((id.to_string(), state.to_string()));
            Ok(())
        }
        async fn create_comment(&self, _: &str, _: &str) -> Result<(), TrackerError> {
            Ok(())
        }
        async fn create_attachment(&self, _: &str, _: &str, _: &str) -> Result<(), TrackerError> {
            Ok(())
        }
    }

    fn state_map() -> StdHashMap<String, WorkflowState> {
        let mut map = StdHashMap::new();
        for (name, id) in [
            ("Todo", "state-todo"),
            ("In Progress", "state-progress"),
            ("In Review", "state-review"),
            ("Done", "state-done"),
            ("Canceled", "state-canceled"),
        ] {
            map.insert(
                name.to_string(),
                WorkflowState { id: id.to_string(), kind: "test".to_string() },
            );
        }
        map
    }

    struct Rig {
        scheduler: Arc<Scheduler>,
        coordination: Arc<Coordination>,
        tracker: Arc<RecordingTracker>,
        pool: SqlitePool,
        _tmp: tempfile::TempDir,
    }

    async fn build_rig(settings: Settings) -> Rig {
        let pool = create_test_store().await;
        let tmp = tempfile::tempdir().unwrap();
        let coordination = Arc::new(Coordination::new());
        let tracker = Arc::new(RecordingTracker::default());
        let bus = EventBus::new();
        let sync = Arc::new(Synchronizer::new(
            pool.clone(),
            Arc::clone(&tracker) as Arc<dyn TrackerApi>,
            Arc::clone(&coordination),
            bus.clone(),
            Arc::new(Mutex::new(DependencyGraph::new())),
            SyncConfig::default(),
        ));
        sync.set_state_map(state_map()).await;

        let scheduler = Arc::new(Scheduler::new(
            pool.clone(),
            shared(settings),
            Arc::clone(&coordination),
            WorktreeProvisioner::default(),
            sync,
            bus,
            tmp.path().to_path_buf(),
        ));

        Rig { scheduler, coordination, tracker, pool, _tmp: tmp }
    }

    async fn wait_for_update(tracker: &RecordingTracker, expected: (&str, &str)) {
        for _ in 0..50 {
            if tracker
                .updates()
                .iter()
                .any(|(id, state)| id == expected.0 && state == expected.1)
            {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("write-back {expected:?} never arrived; got {:?}", tracker.updates());
    }

    fn dll_error() -> WorktreeError {
        WorktreeError::Git(GitError::Exit {
            command: "fetch origin".to_string(),
            code: Some(3_221_225_794),
            signal: None,
            stderr: String::new(),
        })
    }

    // -- Orphan recovery ---------------------------------------------------

    #[tokio::test]
    async fn orphan_recovery_fails_invocations_and_resets_tasks() {
        let rig = build_rig(Settings::default()).await;

        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Running, 0).await;
        seed_task_with(&rig.pool, "ORC-2", "/repos/web", TaskStatus::Dispatched, 0).await;
        seed_task_with(&rig.pool, "ORC-3", "/repos/web", TaskStatus::Done, 0).await;
        let orphan = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        rig.scheduler.recover_orphans().await.unwrap();

        let invocation = get_invocation(&rig.pool, orphan).await.unwrap().unwrap();
        assert_eq!(invocation.status, InvocationStatus::Failed);
        assert_eq!(invocation.output_summary.as_deref(), Some("orphaned by restart"));

        assert_eq!(get_task(&rig.pool, "ORC-1").await.unwrap().unwrap().status, TaskStatus::Ready);
        assert_eq!(get_task(&rig.pool, "ORC-2").await.unwrap().unwrap().status, TaskStatus::Ready);
        assert_eq!(get_task(&rig.pool, "ORC-3").await.unwrap().unwrap().status, TaskStatus::Done);
    }

    // -- Gates -------------------------------------------------------------

    #[tokio::test]
    async fn budget_gate_blocks_dispatch() {
        let rig = build_rig(Settings {
            budget_max_cost_usd: 1.0,
            ..Default::default()
        })
        .await;

        seed_task_with(&rig.pool, "ORC-DONE", "/repos/web", TaskStatus::Done, 0).await;
        let paid = insert_invocation(&rig.pool, "ORC-DONE", Utc::now()).await.unwrap();
        update_invocation(
            &rig.pool,
            paid,
            &InvocationUpdate {
                status: Some(InvocationStatus::Completed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        insert_budget_event(&rig.pool, paid, 2.5).await.unwrap();

        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Ready, 0).await;
        rig.scheduler.tick().await.unwrap();

        assert_eq!(get_task(&rig.pool, "ORC-1").await.unwrap().unwrap().status, TaskStatus::Ready);
        assert_eq!(list_invocations(&rig.pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrency_gate_blocks_dispatch() {
        let rig = build_rig(Settings {
            concurrency_cap: 2,
            ..Default::default()
        })
        .await;

        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Running, 0).await;
        seed_task_with(&rig.pool, "ORC-2", "/repos/web", TaskStatus::Dispatched, 0).await;
        seed_task_with(&rig.pool, "ORC-3", "/repos/web", TaskStatus::Ready, 0).await;

        rig.scheduler.tick().await.unwrap();

        assert_eq!(get_task(&rig.pool, "ORC-3").await.unwrap().unwrap().status, TaskStatus::Ready);
        assert!(list_invocations(&rig.pool).await.unwrap().is_empty());
    }

    // -- Candidate selection -----------------------------------------------

    #[tokio::test]
    async fn candidate_filters() {
        let rig = build_rig(Settings::default()).await;

        // Empty prompt.
        insert_task(
            &rig.pool,
            &NewTask {
                id: "ORC-EMPTY".to_string(),
                prompt: "   ".to_string(),
                repo_path: "/repos/web".to_string(),
                status: TaskStatus::Ready,
                priority: 1,
                parent_id: None,
                is_parent: false,
            },
        )
        .await
        .unwrap();

        // Parent rollup.
        insert_task(
            &rig.pool,
            &NewTask {
                id: "ORC-PARENT".to_string(),
                prompt: "rollup".to_string(),
                repo_path: "/repos/web".to_string(),
                status: TaskStatus::Ready,
                priority: 1,
                parent_id: None,
                is_parent: true,
            },
        )
        .await
        .unwrap();

        // Running invocation already held.
        seed_task_with(&rig.pool, "ORC-HELD", "/repos/web", TaskStatus::Ready, 1).await;
        insert_invocation(&rig.pool, "ORC-HELD", Utc::now()).await.unwrap();

        // Repo on cooldown.
        seed_task_with(&rig.pool, "ORC-COOL", "/repos/cold", TaskStatus::Ready, 1).await;
        rig.coordination
            .set_cooldown(Path::new("/repos/cold"), Utc::now() + ChronoDuration::seconds(60))
            .await;

        // Blocked by an unfinished task.
        seed_task_with(&rig.pool, "ORC-BLOCKER", "/repos/web", TaskStatus::Ready, 0).await;
        seed_task_with(&rig.pool, "ORC-BLOCKED", "/repos/web", TaskStatus::Ready, 1).await;
        rig.scheduler
            .graph
            .lock()
            .await
            .add_relation("ORC-BLOCKER", "ORC-BLOCKED");

        let candidate = rig.scheduler.pick_candidate().await.unwrap().unwrap();
        // Only the blocker itself survives the filters.
        assert_eq!(candidate.id, "ORC-BLOCKER");
    }

    #[tokio::test]
    async fn candidates_order_by_effective_priority_then_age() {
        let rig = build_rig(Settings::default()).await;

        seed_task_with(&rig.pool, "ORC-NOPRIO", "/repos/web", TaskStatus::Ready, 0).await;
        seed_task_with(&rig.pool, "ORC-LOW", "/repos/web", TaskStatus::Ready, 3).await;
        seed_task_with(&rig.pool, "ORC-URGENT", "/repos/web", TaskStatus::Ready, 1).await;

        let candidate = rig.scheduler.pick_candidate().await.unwrap().unwrap();
        assert_eq!(candidate.id, "ORC-URGENT");
    }

    #[tokio::test]
    async fn blocker_inherits_downstream_urgency() {
        // S3: A (3) blocks B (1); A must dispatch first.
        let rig = build_rig(Settings::default()).await;

        seed_task_with(&rig.pool, "A", "/repos/web", TaskStatus::Ready, 3).await;
        seed_task_with(&rig.pool, "B", "/repos/web", TaskStatus::Ready, 1).await;
        seed_task_with(&rig.pool, "C", "/repos/web", TaskStatus::Ready, 2).await;
        rig.scheduler.graph.lock().await.add_relation("A", "B");

        let candidate = rig.scheduler.pick_candidate().await.unwrap().unwrap();
        assert_eq!(candidate.id, "A", "A inherits B's priority 1 and B is blocked");
    }

    // -- Worktree failure classification (S5) --------------------------------

    #[tokio::test]
    async fn dll_init_failure_cools_repo_and_keeps_task_ready() {
        let rig = build_rig(Settings::default()).await;

        let task = seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Dispatched, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        rig.scheduler
            .handle_worktree_failure(&task, invocation_id, &dll_error(), 2, 30)
            .await
            .unwrap();

        let invocation = get_invocation(&rig.pool, invocation_id).await.unwrap().unwrap();
        assert_eq!(invocation.status, InvocationStatus::Failed);
        assert!(invocation
            .output_summary
            .as_deref()
            .unwrap()
            .starts_with("worktree creation failed:"));

        let task = get_task(&rig.pool, "ORC-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Ready, "transient failure must not fail the task");
        assert_eq!(task.retry_count, 0);

        assert!(rig.coordination.is_on_cooldown(Path::new("/repos/web")).await);
        assert_eq!(rig.scheduler.transient_streak("ORC-1").await, 1);
    }

    #[tokio::test]
    async fn fifth_dll_init_failure_promotes_to_real_failure() {
        let rig = build_rig(Settings::default()).await;
        let task = seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Dispatched, 0).await;

        for _ in 0..4 {
            let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();
            rig.scheduler
                .handle_worktree_failure(&task, invocation_id, &dll_error(), 2, 30)
                .await
                .unwrap();
        }
        assert_eq!(rig.scheduler.transient_streak("ORC-1").await, 4);
        assert_eq!(get_task(&rig.pool, "ORC-1").await.unwrap().unwrap().status, TaskStatus::Ready);

        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();
        rig.scheduler
            .handle_worktree_failure(&task, invocation_id, &dll_error(), 2, 30)
            .await
            .unwrap();

        let task = get_task(&rig.pool, "ORC-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1, "retry rule applies after promotion");
        assert_eq!(rig.scheduler.transient_streak("ORC-1").await, 0);
        wait_for_update(&rig.tracker, ("ORC-1", "state-todo")).await;
    }

    #[tokio::test]
    async fn signal_killed_failure_skips_cooldown() {
        let rig = build_rig(Settings::default()).await;
        let task = seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Dispatched, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        let error = WorktreeError::Git(GitError::Exit {
            command: "fetch origin".to_string(),
            code: None,
            signal: Some(9),
            stderr: String::new(),
        });
        rig.scheduler
            .handle_worktree_failure(&task, invocation_id, &error, 2, 30)
            .await
            .unwrap();

        assert!(!rig.coordination.is_on_cooldown(Path::new("/repos/web")).await);
        assert_eq!(rig.scheduler.transient_streak("ORC-1").await, 1);
        assert_eq!(get_task(&rig.pool, "ORC-1").await.unwrap().unwrap().status, TaskStatus::Ready);
    }

    #[tokio::test]
    async fn permanent_worktree_failure_fails_the_task() {
        let rig = build_rig(Settings::default()).await;
        let task = seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Dispatched, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        let error = WorktreeError::Git(GitError::Exit {
            command: "worktree add".to_string(),
            code: Some(128),
            signal: None,
            stderr: "fatal: not a repository".to_string(),
        });
        rig.scheduler
            .handle_worktree_failure(&task, invocation_id, &error, 2, 30)
            .await
            .unwrap();

        let task = get_task(&rig.pool, "ORC-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0, "permanent infrastructure failure does not arm a retry");
        assert!(!rig.coordination.is_on_cooldown(Path::new("/repos/web")).await);
    }

    #[tokio::test]
    async fn dispatch_against_missing_repo_fails_permanently() {
        let rig = build_rig(Settings::default()).await;
        seed_task_with(&rig.pool, "ORC-1", "/nonexistent/repo/path", TaskStatus::Ready, 0).await;

        rig.scheduler.tick().await.unwrap();

        let task = get_task(&rig.pool, "ORC-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let invocations = list_invocations(&rig.pool).await.unwrap();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].status, InvocationStatus::Failed);
    }

    // -- Completion handling -------------------------------------------------

    #[tokio::test]
    async fn successful_completion_records_cost_and_finishes_task() {
        let rig = build_rig(Settings::default()).await;
        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Running, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        rig.scheduler
            .complete_session(
                invocation_id,
                SessionResult {
                    subtype: "success".to_string(),
                    cost_usd: Some(0.25),
                    num_turns: Some(3),
                    output_summary: "done".to_string(),
                    session_id: Some("sess-1".to_string()),
                    exit_code: Some(0),
                },
            )
            .await
            .unwrap();

        let invocation = get_invocation(&rig.pool, invocation_id).await.unwrap().unwrap();
        assert_eq!(invocation.status, InvocationStatus::Completed);
        assert_eq!(invocation.cost_usd, Some(0.25));
        assert_eq!(invocation.num_turns, Some(3));
        assert_eq!(invocation.session_id.as_deref(), Some("sess-1"));
        assert!(invocation.ended_at.is_some());

        let events = list_budget_events(&rig.pool).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].cost_usd, 0.25);

        assert_eq!(get_task(&rig.pool, "ORC-1").await.unwrap().unwrap().status, TaskStatus::Done);
        wait_for_update(&rig.tracker, ("ORC-1", "state-done")).await;
    }

    #[tokio::test]
    async fn zero_cost_completion_records_no_budget_event() {
        let rig = build_rig(Settings::default()).await;
        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Running, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        rig.scheduler
            .complete_session(
                invocation_id,
                SessionResult {
                    subtype: "success".to_string(),
                    cost_usd: None,
                    num_turns: None,
                    output_summary: "process exited cleanly with no result message".to_string(),
                    session_id: None,
                    exit_code: Some(0),
                },
            )
            .await
            .unwrap();

        assert!(list_budget_events(&rig.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_completion_arms_retry_within_budget() {
        // S2: first failure increments the counter and writes back `retry`.
        let rig = build_rig(Settings { max_retries: 2, ..Default::default() }).await;
        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Running, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        rig.scheduler
            .complete_session(
                invocation_id,
                SessionResult {
                    subtype: "error_max_turns".to_string(),
                    cost_usd: Some(1.0),
                    num_turns: Some(50),
                    output_summary: "max turns reached".to_string(),
                    session_id: None,
                    exit_code: Some(1),
                },
            )
            .await
            .unwrap();

        let invocation = get_invocation(&rig.pool, invocation_id).await.unwrap().unwrap();
        assert_eq!(invocation.status, InvocationStatus::Failed);

        let task = get_task(&rig.pool, "ORC-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        wait_for_update(&rig.tracker, ("ORC-1", "state-todo")).await;
    }

    #[tokio::test]
    async fn exhausted_retries_write_back_failed_permanent() {
        let rig = build_rig(Settings { max_retries: 0, ..Default::default() }).await;
        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Running, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        rig.scheduler
            .complete_session(
                invocation_id,
                SessionResult {
                    subtype: "process_error".to_string(),
                    cost_usd: None,
                    num_turns: None,
                    output_summary: "spawn error: missing binary".to_string(),
                    session_id: None,
                    exit_code: None,
                },
            )
            .await
            .unwrap();

        let task = get_task(&rig.pool, "ORC-1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 0);
        wait_for_update(&rig.tracker, ("ORC-1", "state-canceled")).await;
    }

    #[tokio::test]
    async fn settled_invocation_ignores_late_completion() {
        let rig = build_rig(Settings::default()).await;
        seed_task_with(&rig.pool, "ORC-1", "/repos/web", TaskStatus::Ready, 0).await;
        let invocation_id = insert_invocation(&rig.pool, "ORC-1", Utc::now()).await.unwrap();

        // An abort path already failed it.
        update_invocation(
            &rig.pool,
            invocation_id,
            &InvocationUpdate {
                status: Some(InvocationStatus::Failed),
                output_summary: Some("interrupted by user".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        rig.scheduler
            .complete_session(
                invocation_id,
                SessionResult {
                    subtype: "success".to_string(),
                    cost_usd: Some(1.0),
                    num_turns: Some(1),
                    output_summary: "late".to_string(),
                    session_id: None,
                    exit_code: Some(0),
                },
            )
            .await
            .unwrap();

        let invocation = get_invocation(&rig.pool, invocation_id).await.unwrap().unwrap();
        assert_eq!(invocation.status, InvocationStatus::Failed);
        assert_eq!(invocation.output_summary.as_deref(), Some("interrupted by user"));
        assert_eq!(get_task(&rig.pool, "ORC-1").await.unwrap().unwrap().status, TaskStatus::Ready);
        assert!(list_budget_events(&rig.pool).await.unwrap().is_empty());
    }
}
