//! Shared transient state between the scheduler, the synchronizer, and the
//! API layer.
//!
//! The scheduler owns one [`Coordination`] value for its lifetime; the
//! other components hold clones of the `Arc`. None of these tables survive
//! a restart, which is exactly why startup rewrites orphaned `running`
//! invocations.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::runner::SessionHandle;

/// How long a write-back's echo is expected before the entry lapses.
const EXPECTED_CHANGE_TTL_SECS: i64 = 10;

/// One pending write-back echo: the webhook event matching this tracker
/// state for this task is ours and must be discarded.
#[derive(Debug, Clone)]
pub struct ExpectedChange {
    pub task_id: String,
    pub state_name: String,
    pub expires_at: DateTime<Utc>,
}

/// The scheduler's shared mutable tables.
#[derive(Debug, Default)]
pub struct Coordination {
    /// invocation id -> live runner handle.
    handles: Mutex<HashMap<i64, SessionHandle>>,
    /// Pending write-back echoes, consumed on first match or on expiry.
    expected_changes: Mutex<Vec<ExpectedChange>>,
    /// repo path -> dispatch ban expiry.
    cooldowns: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl Coordination {
    pub fn new() -> Self {
        Self::default()
    }

    // -- Active handles ----------------------------------------------------

    pub async fn insert_handle(&self, handle: SessionHandle) {
        self.handles
            .lock()
            .await
            .insert(handle.invocation_id, handle);
    }

    pub async fn remove_handle(&self, invocation_id: i64) -> Option<SessionHandle> {
        self.handles.lock().await.remove(&invocation_id)
    }

    pub async fn get_handle(&self, invocation_id: i64) -> Option<SessionHandle> {
        self.handles.lock().await.get(&invocation_id).cloned()
    }

    pub async fn handle_count(&self) -> usize {
        self.handles.lock().await.len()
    }

    /// Snapshot of all live handles, for shutdown and conflict kills.
    pub async fn all_handles(&self) -> Vec<SessionHandle> {
        self.handles.lock().await.values().cloned().collect()
    }

    // -- Expected changes --------------------------------------------------

    /// Register the echo we are about to cause in the tracker.
    pub async fn expect_change(&self, task_id: &str, state_name: &str) {
        let mut entries = self.expected_changes.lock().await;
        entries.push(ExpectedChange {
            task_id: task_id.to_string(),
            state_name: state_name.to_string(),
            expires_at: Utc::now() + Duration::seconds(EXPECTED_CHANGE_TTL_SECS),
        });
    }

    /// Consume a pending entry matching `(task_id, state_name)`.
    ///
    /// Expired entries are dropped on every lookup, so the table cannot
    /// grow without bound. Returns true when the event was ours.
    pub async fn consume_expected_change(&self, task_id: &str, state_name: &str) -> bool {
        let now = Utc::now();
        let mut entries = self.expected_changes.lock().await;
        entries.retain(|e| e.expires_at > now);

        let position = entries
            .iter()
            .position(|e| e.task_id == task_id && e.state_name == state_name);
        match position {
            Some(index) => {
                entries.remove(index);
                true
            }
            None => false,
        }
    }

    pub async fn expected_change_count(&self) -> usize {
        self.expected_changes.lock().await.len()
    }

    // -- Repo cooldowns ----------------------------------------------------

    /// Ban dispatch into a repo until `expires_at`.
    pub async fn set_cooldown(&self, repo: &std::path::Path, expires_at: DateTime<Utc>) {
        self.cooldowns
            .lock()
            .await
            .insert(repo.to_path_buf(), expires_at);
    }

    /// Drop expired entries. Called at the top of every tick.
    pub async fn expire_cooldowns(&self, now: DateTime<Utc>) {
        self.cooldowns.lock().await.retain(|_, expiry| *expiry > now);
    }

    /// A present entry blocks dispatch for the repo.
    pub async fn is_on_cooldown(&self, repo: &std::path::Path) -> bool {
        self.cooldowns.lock().await.contains_key(repo)
    }

    pub async fn cooldown_count(&self) -> usize {
        self.cooldowns.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn expected_change_consumed_exactly_once() {
        let coordination = Coordination::new();
        coordination.expect_change("ORC-1", "In Progress").await;

        assert!(coordination.consume_expected_change("ORC-1", "In Progress").await);
        assert!(!coordination.consume_expected_change("ORC-1", "In Progress").await);
    }

    #[tokio::test]
    async fn expected_change_requires_exact_match() {
        let coordination = Coordination::new();
        coordination.expect_change("ORC-1", "In Progress").await;

        assert!(!coordination.consume_expected_change("ORC-1", "Done").await);
        assert!(!coordination.consume_expected_change("ORC-2", "In Progress").await);
        assert_eq!(coordination.expected_change_count().await, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_lookup() {
        let coordination = Coordination::new();
        {
            let mut entries = coordination.expected_changes.lock().await;
            entries.push(ExpectedChange {
                task_id: "ORC-1".to_string(),
                state_name: "Done".to_string(),
                expires_at: Utc::now() - Duration::seconds(1),
            });
        }

        assert!(!coordination.consume_expected_change("ORC-1", "Done").await);
        assert_eq!(coordination.expected_change_count().await, 0);
    }

    #[tokio::test]
    async fn cooldowns_expire() {
        let coordination = Coordination::new();
        let repo = Path::new("/repos/web");

        coordination
            .set_cooldown(repo, Utc::now() + Duration::seconds(30))
            .await;
        assert!(coordination.is_on_cooldown(repo).await);

        coordination.expire_cooldowns(Utc::now()).await;
        assert!(coordination.is_on_cooldown(repo).await, "unexpired entry must stay");

        coordination
            .expire_cooldowns(Utc::now() + Duration::seconds(31))
            .await;
        assert!(!coordination.is_on_cooldown(repo).await);
    }
}
