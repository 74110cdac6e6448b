//! Polling fallback for the inbound webhook path.
//!
//! While the tunnel that delivers webhooks is healthy, the poller does
//! nothing. When it is not, full syncs run on a 30-second cadence with
//! exponential backoff on failure, jittered to avoid synchronizing with
//! other instances. Auth failures stop the poller outright: retrying a
//! revoked key only burns rate limit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::sync::{is_auth_error, SyncReport, Synchronizer};

const BASE_INTERVAL: Duration = Duration::from_secs(30);
const MAX_INTERVAL: Duration = Duration::from_secs(300);

/// Something that can run a full sync. The production impl is
/// [`Synchronizer`]; tests substitute fakes.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn sync(&self) -> anyhow::Result<SyncReport>;
}

#[async_trait]
impl SyncSource for Synchronizer {
    async fn sync(&self) -> anyhow::Result<SyncReport> {
        self.full_sync().await
    }
}

/// Failure category of the most recent poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Auth,
    Transient,
    Partial,
}

/// Health snapshot exposed over the API.
#[derive(Debug, Clone, Serialize)]
pub struct PollerHealth {
    pub consecutive_failures: u32,
    pub current_interval_ms: u64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_category: Option<ErrorCategory>,
    pub last_sync_synced: Option<usize>,
    pub last_sync_failed: Option<usize>,
    pub stopped: bool,
}

impl Default for PollerHealth {
    fn default() -> Self {
        Self {
            consecutive_failures: 0,
            current_interval_ms: BASE_INTERVAL.as_millis() as u64,
            last_success_at: None,
            last_error: None,
            last_error_category: None,
            last_sync_synced: None,
            last_sync_failed: None,
            stopped: false,
        }
    }
}

/// Next wait after `failures` consecutive failures:
/// `min(30s * 2^(failures-1), 300s)`.
fn backoff_interval(failures: u32) -> Duration {
    if failures == 0 {
        return BASE_INTERVAL;
    }
    let multiplier = 1u64 << (failures - 1).min(16);
    BASE_INTERVAL
        .checked_mul(multiplier as u32)
        .map(|d| d.min(MAX_INTERVAL))
        .unwrap_or(MAX_INTERVAL)
}

/// Apply up to +/-50% jitter so fleet instances spread their polls.
fn apply_jitter(interval: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    interval.mul_f64(factor)
}

/// The polling fallback task handle.
pub struct PollingFallback {
    health: Arc<std::sync::Mutex<PollerHealth>>,
    cancel: CancellationToken,
}

impl PollingFallback {
    /// Spawn the polling loop.
    ///
    /// `is_tunnel_connected` is consulted every tick; a healthy tunnel
    /// means webhooks are flowing and the poll is skipped.
    pub fn start(
        sync: Arc<dyn SyncSource>,
        is_tunnel_connected: Arc<dyn Fn() -> bool + Send + Sync>,
    ) -> Self {
        let health = Arc::new(std::sync::Mutex::new(PollerHealth::default()));
        let cancel = CancellationToken::new();

        let loop_health = Arc::clone(&health);
        let loop_cancel = cancel.clone();

        tokio::spawn(async move {
            run_poll_loop(sync, is_tunnel_connected, loop_health, loop_cancel).await;
        });

        Self { health, cancel }
    }

    /// Current health snapshot.
    pub fn health(&self) -> PollerHealth {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Cancel any pending timer and prevent further ticks.
    pub fn stop(&self) {
        self.health
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stopped = true;
        self.cancel.cancel();
    }
}

async fn run_poll_loop(
    sync: Arc<dyn SyncSource>,
    is_tunnel_connected: Arc<dyn Fn() -> bool + Send + Sync>,
    health: Arc<std::sync::Mutex<PollerHealth>>,
    cancel: CancellationToken,
) {
    loop {
        let interval = {
            let snapshot = health.lock().unwrap_or_else(|e| e.into_inner());
            if snapshot.stopped {
                return;
            }
            Duration::from_millis(snapshot.current_interval_ms)
        };

        tokio::select! {
            _ = tokio::time::sleep(apply_jitter(interval)) => {}
            _ = cancel.cancelled() => return,
        }

        if is_tunnel_connected() {
            continue;
        }

        let was_unhealthy = {
            let snapshot = health.lock().unwrap_or_else(|e| e.into_inner());
            snapshot.consecutive_failures > 0
        };

        match sync.sync().await {
            Ok(report) if report.failed > 0 => {
                let mut snapshot = health.lock().unwrap_or_else(|e| e.into_inner());
                snapshot.consecutive_failures += 1;
                snapshot.current_interval_ms =
                    backoff_interval(snapshot.consecutive_failures).as_millis() as u64;
                snapshot.last_error = Some(format!("{} issues failed to sync", report.failed));
                snapshot.last_error_category = Some(ErrorCategory::Partial);
                snapshot.last_sync_synced = Some(report.synced);
                snapshot.last_sync_failed = Some(report.failed);
                warn!(
                    failed = report.failed,
                    next_interval_ms = snapshot.current_interval_ms,
                    "partial sync failure, backing off"
                );
            }
            Ok(report) => {
                let mut snapshot = health.lock().unwrap_or_else(|e| e.into_inner());
                snapshot.consecutive_failures = 0;
                snapshot.current_interval_ms = BASE_INTERVAL.as_millis() as u64;
                snapshot.last_success_at = Some(Utc::now());
                snapshot.last_error = None;
                snapshot.last_error_category = None;
                snapshot.last_sync_synced = Some(report.synced);
                snapshot.last_sync_failed = Some(report.failed);
                if was_unhealthy {
                    info!(synced = report.synced, "polling recovered");
                }
            }
            Err(e) if is_auth_error(&e) => {
                error!(error = %e, "tracker authentication failed, stopping poller");
                let mut snapshot = health.lock().unwrap_or_else(|e| e.into_inner());
                snapshot.last_error = Some(e.to_string());
                snapshot.last_error_category = Some(ErrorCategory::Auth);
                snapshot.stopped = true;
                return;
            }
            Err(e) => {
                let mut snapshot = health.lock().unwrap_or_else(|e| e.into_inner());
                snapshot.consecutive_failures += 1;
                snapshot.current_interval_ms =
                    backoff_interval(snapshot.consecutive_failures).as_millis() as u64;
                snapshot.last_error = Some(e.to_string());
                snapshot.last_error_category = Some(ErrorCategory::Transient);
                warn!(
                    error = %e,
                    next_interval_ms = snapshot.current_interval_ms,
                    "sync failed, backing off"
                );
            }
        }
    }
}
