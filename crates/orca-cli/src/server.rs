//! The orca HTTP surface: dashboard API, SSE streams, and the
//! HMAC-verified tracker webhook.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use futures::Stream;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use orca_core::bus::EventBus;
use orca_core::coordination::Coordination;
use orca_core::poller::PollingFallback;
use orca_core::scheduler::Scheduler;
use orca_core::settings::{SettingsPatch, SharedSettings};
use orca_core::sync::{Synchronizer, WriteBack};
use orca_db::models::{BudgetEvent, Invocation, InvocationStatus, Task, TaskStatus};
use orca_db::queries::budget::{list_budget_events, sum_cost_since};
use orca_db::queries::invocations::{
    count_by_task, get_invocation, list_invocations, list_invocations_for_task,
    list_running_invocations, update_invocation, InvocationUpdate,
};
use orca_db::queries::tasks::{count_by_status, get_task, list_tasks, update_task_fields,
    update_task_status, TaskUpdate};
use orca_db::SqlitePool;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "linear-signature";
const ISSUE_EVENT_TYPE: &str = "Issue";

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::CONFLICT, message: msg.into() }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "unauthorized".to_string(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub coordination: Arc<Coordination>,
    pub sync: Arc<Synchronizer>,
    pub scheduler: Arc<Scheduler>,
    pub bus: EventBus,
    pub settings: SharedSettings,
    pub poller: Arc<PollingFallback>,
    pub webhook_secret: String,
    pub project_ids: Arc<HashSet<String>>,
    pub system_log_path: PathBuf,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/tasks", get(list_tasks_handler))
        .route("/api/tasks/{id}", get(get_task_handler))
        .route("/api/tasks/{id}/status", post(set_task_status))
        .route("/api/tasks/{id}/retry", post(retry_task))
        .route("/api/invocations/{id}/logs", get(invocation_logs))
        .route("/api/invocations/{id}/abort", post(abort_invocation))
        .route("/api/invocations/{id}/prompt", post(prompt_invocation))
        .route("/api/sync", post(manual_sync))
        .route("/api/status", get(status_handler))
        .route("/api/config", post(patch_config))
        .route("/api/events", get(event_stream))
        .route("/api/logs/system", get(system_log))
        .route("/api/metrics", get(metrics_handler))
        .route("/api/webhooks/linear", post(linear_webhook))
        .layer(middleware::from_fn(security_headers))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Standard security headers on every response.
async fn security_headers(request: axum::extract::Request, next: Next) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=31536000; includeSubDomains"),
    );
    headers.insert(
        "Referrer-Policy",
        HeaderValue::from_static("no-referrer"),
    );
    response
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(state: AppState, bind: &str, port: u16) -> Result<()> {
    let scheduler = Arc::clone(&state.scheduler);
    let poller = Arc::clone(&state.poller);

    let app = build_router(state);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("orca serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    poller.stop();
    scheduler.shutdown().await;
    info!("orca serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Task handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct TaskRow {
    #[serde(flatten)]
    task: Task,
    invocation_count: i64,
}

async fn list_tasks_handler(
    State(state): State<AppState>,
) -> Result<Json<Vec<TaskRow>>, AppError> {
    let tasks = list_tasks(&state.pool).await.map_err(AppError::internal)?;
    let counts: HashMap<String, i64> = count_by_task(&state.pool)
        .await
        .map_err(AppError::internal)?
        .into_iter()
        .collect();

    let rows = tasks
        .into_iter()
        .map(|task| {
            let invocation_count = counts.get(&task.id).copied().unwrap_or(0);
            TaskRow { task, invocation_count }
        })
        .collect();

    Ok(Json(rows))
}

#[derive(Debug, Serialize)]
struct TaskDetail {
    #[serde(flatten)]
    task: Task,
    invocations: Vec<Invocation>,
}

async fn get_task_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskDetail>, AppError> {
    let task = get_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    let invocations = list_invocations_for_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(TaskDetail { task, invocations }))
}

async fn set_task_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let requested = body
        .get("status")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| AppError::bad_request("missing status"))?;

    // Only user-meaningful targets are accepted here; everything else is
    // the dispatch engine's business.
    let target = match requested {
        "backlog" => TaskStatus::Backlog,
        "ready" => TaskStatus::Ready,
        "done" => TaskStatus::Done,
        other => return Err(AppError::bad_request(format!("invalid status: {other}"))),
    };

    let task = get_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if task.status == target {
        return Err(AppError::conflict(format!("task already {target}")));
    }

    state
        .sync
        .kill_running_sessions(&id, "manual status change")
        .await
        .map_err(AppError::internal)?;

    if target == TaskStatus::Ready {
        update_task_fields(
            &state.pool,
            &id,
            &TaskUpdate {
                status: Some(TaskStatus::Ready),
                retry_count: Some(0),
                review_count: Some(0),
                ..Default::default()
            },
        )
        .await
        .map_err(AppError::internal)?;
    } else {
        update_task_status(&state.pool, &id, target)
            .await
            .map_err(AppError::internal)?;
    }

    let write_back = match target {
        TaskStatus::Ready => Some(WriteBack::Retry),
        TaskStatus::Done => Some(WriteBack::Done),
        _ => None,
    };
    if let Some(transition) = write_back {
        let sync = Arc::clone(&state.sync);
        let task_id = id.clone();
        tokio::spawn(async move { sync.write_back(&task_id, transition).await });
    }

    Ok(Json(serde_json::json!({ "id": id, "status": target.to_string() })))
}

async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = get_task(&state.pool, &id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {id} not found")))?;

    if task.status != TaskStatus::Failed {
        return Err(AppError::conflict(format!(
            "task is {}, only failed tasks can be retried",
            task.status
        )));
    }

    update_task_fields(
        &state.pool,
        &id,
        &TaskUpdate {
            status: Some(TaskStatus::Ready),
            retry_count: Some(0),
            review_count: Some(0),
            ..Default::default()
        },
    )
    .await
    .map_err(AppError::internal)?;

    let sync = Arc::clone(&state.sync);
    let task_id = id.clone();
    tokio::spawn(async move {
        sync.write_back(&task_id, WriteBack::Retry).await;
        sync.comment(&task_id, "Manual retry requested from the orca dashboard.")
            .await;
    });

    Ok(Json(serde_json::json!({ "id": id, "status": "ready" })))
}

// ---------------------------------------------------------------------------
// Invocation handlers
// ---------------------------------------------------------------------------

async fn invocation_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<axum::response::Response, AppError> {
    let invocation = get_invocation(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("invocation {id} not found")))?;

    let log_path = invocation
        .log_path
        .clone()
        .map(PathBuf::from)
        .ok_or_else(|| AppError::not_found(format!("invocation {id} has no log")))?;

    if invocation.status != InvocationStatus::Running {
        // Finished sessions return the parsed log in one shot.
        let lines = read_log_lines(&log_path);
        return Ok(Json(lines).into_response());
    }

    // Live sessions stream line-by-line over SSE.
    let pool = state.pool.clone();
    let stream = async_stream::stream! {
        let mut offset = 0usize;
        loop {
            if let Ok(contents) = tokio::fs::read_to_string(&log_path).await {
                if contents.len() > offset {
                    for line in contents[offset..].lines() {
                        yield Ok::<Event, Infallible>(Event::default().data(line));
                    }
                    offset = contents.len();
                }
            }

            match get_invocation(&pool, id).await {
                Ok(Some(invocation)) if invocation.status == InvocationStatus::Running => {}
                _ => break,
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    };

    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response())
}

fn read_log_lines(path: &std::path::Path) -> Vec<serde_json::Value> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .unwrap_or_else(|_| serde_json::Value::String(line.to_string()))
        })
        .collect()
}

async fn abort_invocation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let invocation = get_invocation(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("invocation {id} not found")))?;

    if invocation.status != InvocationStatus::Running {
        return Err(AppError::conflict(format!(
            "invocation is {}, only running invocations can be aborted",
            invocation.status
        )));
    }

    // Settle the row before the kill so the completion continuation
    // ignores the session's death.
    update_invocation(
        &state.pool,
        id,
        &InvocationUpdate {
            status: Some(InvocationStatus::Failed),
            ended_at: Some(Utc::now()),
            output_summary: Some("interrupted by user abort".to_string()),
            ..Default::default()
        },
    )
    .await
    .map_err(AppError::internal)?;

    if let Some(handle) = state.coordination.remove_handle(id).await {
        handle.kill().await;
    }

    update_task_fields(
        &state.pool,
        &invocation.task_id,
        &TaskUpdate {
            status: Some(TaskStatus::Ready),
            retry_count: Some(0),
            review_count: Some(0),
            ..Default::default()
        },
    )
    .await
    .map_err(AppError::internal)?;

    let sync = Arc::clone(&state.sync);
    let task_id = invocation.task_id.clone();
    tokio::spawn(async move { sync.write_back(&task_id, WriteBack::Retry).await });

    Ok(Json(serde_json::json!({ "aborted": id })))
}

async fn prompt_invocation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let message = body
        .get("message")
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::bad_request("message must be a non-empty string"))?
        .to_string();

    let invocation = get_invocation(&state.pool, id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("invocation {id} not found")))?;

    if invocation.status != InvocationStatus::Running {
        return Err(AppError::conflict(format!(
            "invocation is {}, prompts require a running session",
            invocation.status
        )));
    }

    let handle = state
        .coordination
        .get_handle(id)
        .await
        .ok_or_else(|| AppError::conflict("no live session for invocation"))?;

    if !handle.prompt(&message).await {
        return Err(AppError::conflict("session is not accepting input"));
    }

    Ok(Json(serde_json::json!({ "delivered": true })))
}

// ---------------------------------------------------------------------------
// Sync / status / config
// ---------------------------------------------------------------------------

async fn manual_sync(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let report = state.sync.full_sync().await.map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "synced": report.synced })))
}

async fn status_handler(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let counts: HashMap<String, i64> = count_by_status(&state.pool)
        .await
        .map_err(AppError::internal)?
        .into_iter()
        .collect();

    let running = list_running_invocations(&state.pool)
        .await
        .map_err(AppError::internal)?;

    let settings = state.settings.read().await.clone();
    let cutoff = Utc::now() - ChronoDuration::hours(settings.budget_window_hours);
    let window_spend = sum_cost_since(&state.pool, cutoff)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({
        "tasks": counts,
        "running_invocations": running.len(),
        "active_handles": state.coordination.handle_count().await,
        "budget": {
            "window_hours": settings.budget_window_hours,
            "window_spend_usd": window_spend,
            "max_cost_usd": settings.budget_max_cost_usd,
        },
        "concurrency_cap": settings.concurrency_cap,
        "poller": state.poller.health(),
    })))
}

async fn patch_config(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<serde_json::Value>, AppError> {
    let mut settings = state.settings.write().await;
    settings.apply(&patch);
    info!("runtime settings updated");
    Ok(Json(serde_json::to_value(settings.clone()).map_err(|e| AppError::internal(e.into()))?))
}

// ---------------------------------------------------------------------------
// SSE event stream
// ---------------------------------------------------------------------------

async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = state.bus.subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|event| {
        let event = event.ok()?;
        let data = serde_json::to_string(&event).ok()?;
        Some(Ok(Event::default().event(event.kind()).data(data)))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

// ---------------------------------------------------------------------------
// System log
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LogQuery {
    lines: Option<i64>,
    search: Option<String>,
    level: Option<String>,
}

async fn system_log(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<String>>, AppError> {
    let lines = match query.lines {
        None => 200,
        Some(n) if n > 0 => n as usize,
        Some(_) => return Err(AppError::bad_request("lines must be a positive integer")),
    };

    let result = crate::logging::query_system_log(
        &state.system_log_path,
        lines,
        query.search.as_deref(),
        query.level.as_deref(),
    )
    .map_err(AppError::internal)?;

    Ok(Json(result))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub tasks_by_status: HashMap<String, i64>,
    pub invocations: InvocationTotals,
    pub avg_duration_secs: Option<f64>,
    pub avg_cost_usd: Option<f64>,
    pub total_cost_usd: f64,
    pub daily_cost: Vec<DailyCost>,
    pub recent_errors: Vec<ErrorCount>,
    pub daily_throughput: Vec<DailyThroughput>,
}

#[derive(Debug, Serialize)]
pub struct InvocationTotals {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DailyCost {
    pub date: String,
    pub cost_usd: f64,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct ErrorCount {
    pub summary: String,
    pub count: usize,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct DailyThroughput {
    pub date: String,
    pub completed: usize,
    pub failed: usize,
}

async fn metrics_handler(
    State(state): State<AppState>,
) -> Result<Json<MetricsResponse>, AppError> {
    let tasks = count_by_status(&state.pool)
        .await
        .map_err(AppError::internal)?;
    let invocations = list_invocations(&state.pool)
        .await
        .map_err(AppError::internal)?;
    let budget = list_budget_events(&state.pool)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(compute_metrics(tasks, &invocations, &budget)))
}

/// All metric aggregation, pure over the fetched rows.
fn compute_metrics(
    tasks_by_status: Vec<(String, i64)>,
    invocations: &[Invocation],
    budget: &[BudgetEvent],
) -> MetricsResponse {
    let totals = InvocationTotals {
        total: invocations.len(),
        running: count_status(invocations, InvocationStatus::Running),
        completed: count_status(invocations, InvocationStatus::Completed),
        failed: count_status(invocations, InvocationStatus::Failed),
        timed_out: count_status(invocations, InvocationStatus::TimedOut),
    };

    let durations: Vec<f64> = invocations
        .iter()
        .filter(|inv| inv.status == InvocationStatus::Completed)
        .filter_map(|inv| {
            let ended = inv.ended_at?;
            Some((ended - inv.started_at).num_milliseconds() as f64 / 1000.0)
        })
        .collect();
    let avg_duration_secs = mean(&durations);

    let costs: Vec<f64> = invocations
        .iter()
        .filter_map(|inv| inv.cost_usd)
        .filter(|cost| *cost > 0.0)
        .collect();
    let avg_cost_usd = mean(&costs);
    let total_cost_usd = costs.iter().sum();

    // Daily cost series from the immutable budget ledger.
    let mut daily: Vec<DailyCost> = Vec::new();
    for event in budget {
        let date = event.created_at.date_naive().to_string();
        match daily.iter_mut().find(|d| d.date == date) {
            Some(entry) => entry.cost_usd += event.cost_usd,
            None => daily.push(DailyCost { date, cost_usd: event.cost_usd }),
        }
    }

    // Recent errors, aggregated by summary.
    let mut errors: Vec<ErrorCount> = Vec::new();
    for invocation in invocations {
        if !matches!(
            invocation.status,
            InvocationStatus::Failed | InvocationStatus::TimedOut
        ) {
            continue;
        }
        let summary = invocation
            .output_summary
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        match errors.iter_mut().find(|e| e.summary == summary) {
            Some(entry) => entry.count += 1,
            None => errors.push(ErrorCount { summary, count: 1 }),
        }
    }
    errors.sort_by(|a, b| b.count.cmp(&a.count));
    errors.truncate(10);

    // Daily throughput over finished invocations.
    let mut throughput: Vec<DailyThroughput> = Vec::new();
    for invocation in invocations {
        let Some(ended) = invocation.ended_at else {
            continue;
        };
        let date = ended.date_naive().to_string();
        let entry = match throughput.iter_mut().find(|d| d.date == date) {
            Some(entry) => entry,
            None => {
                throughput.push(DailyThroughput { date, completed: 0, failed: 0 });
                throughput.last_mut().expect("just pushed")
            }
        };
        match invocation.status {
            InvocationStatus::Completed => entry.completed += 1,
            InvocationStatus::Failed | InvocationStatus::TimedOut => entry.failed += 1,
            InvocationStatus::Running => {}
        }
    }

    MetricsResponse {
        tasks_by_status: tasks_by_status.into_iter().collect(),
        invocations: totals,
        avg_duration_secs,
        avg_cost_usd,
        total_cost_usd,
        daily_cost: daily,
        recent_errors: errors,
        daily_throughput: throughput,
    }
}

fn count_status(invocations: &[Invocation], status: InvocationStatus) -> usize {
    invocations.iter().filter(|inv| inv.status == status).count()
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// Constant-time HMAC-SHA-256 verification over the raw request bytes.
pub fn verify_webhook_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

async fn linear_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    // The signature covers the bytes as received; parse only after verify.
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(AppError::unauthorized)?;

    if !verify_webhook_signature(&state.webhook_secret, &body, signature) {
        return Err(AppError::unauthorized());
    }

    // Same 401 on parse failure, to avoid leaking which check failed.
    let payload: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| AppError::unauthorized())?;

    let event_type = payload.get("type").and_then(serde_json::Value::as_str);
    if event_type != Some(ISSUE_EVENT_TYPE) {
        return Ok(Json(serde_json::json!({ "ignored": "unsupported event type" })));
    }

    let project_id = payload
        .get("data")
        .and_then(|d| d.get("projectId"))
        .and_then(serde_json::Value::as_str);
    if let Some(project_id) = project_id {
        if !state.project_ids.is_empty() && !state.project_ids.contains(project_id) {
            return Ok(Json(serde_json::json!({ "ignored": "project not configured" })));
        }
    }

    // Upstream retries on non-2xx; sync errors are our problem, not theirs.
    match state.sync.process_webhook(&payload).await {
        Ok(outcome) => Ok(Json(serde_json::json!({ "outcome": format!("{outcome:?}") }))),
        Err(e) => {
            warn!(error = %e, "webhook processing failed");
            Ok(Json(serde_json::json!({ "outcome": "error" })))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
