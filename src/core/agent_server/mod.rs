#![allow(clippy::result_large_err)]

//! HTTP agent: accepts tasks from a remote dispatcher, runs them through the local module
//! registry and reports progress over `/status`.

mod mirror;

use crate::core::dispatch::{Task, TaskResult, TaskStatus};
use crate::core::error::AppError;
use crate::core::modules::output::output_limit;
use crate::core::modules::{BoundedBuffer, ModuleRegistry, ModuleRequest, OutputSink};
use crate::core::state::lifecycle::RunStatus;
use crate::core::state::run_id::unix_nanos;
use crate::core::state::store::{is_not_found, RunStateStore};
use crate::core::types::ErrorCategory;
use crate::core::workflow::vars::Vars;
use axum::{
    body::{Body, Bytes},
    extract::{Extension, Query},
    http::{header, HeaderMap, HeaderValue, Method, Response, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mirror::{run_status_of, RunMirror};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::util::MapResponseLayer;
use tower_http::limit::RequestBodyLimitLayer;

pub const DEFAULT_ASYNC_THRESHOLD: Duration = Duration::from_secs(4);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 65536;
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;
pub const DEFAULT_TASK_RETENTION: Duration = Duration::from_secs(3600);
pub const RESTART_REASON: &str = "agent-server restarted";

#[derive(Debug, Clone)]
pub struct AgentServerSettings {
    pub bind: String,
    /// Empty disables authentication.
    pub token: String,
    /// How long `/run` waits for a result before answering `running`.
    pub async_threshold: Duration,
    pub max_body_bytes: usize,
    pub max_output_bytes: usize,
    /// Finished tasks older than this are dropped from the task table.
    pub task_retention: Duration,
}

impl Default for AgentServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7072".to_string(),
            token: String::new(),
            async_threshold: DEFAULT_ASYNC_THRESHOLD,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            task_retention: DEFAULT_TASK_RETENTION,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RunRequest {
    #[serde(default)]
    task: Task,
}

#[derive(Debug, Default, Serialize)]
struct RunResponse {
    result: TaskResult,
    #[serde(skip_serializing_if = "String::is_empty")]
    run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

#[derive(Debug, Default, Deserialize)]
struct TaskIdRequest {
    #[serde(default)]
    task_id: String,
}

struct TaskEntry {
    task: Task,
    result: TaskResult,
    done: bool,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    cancel: CancellationToken,
    stdout: Arc<BoundedBuffer>,
    stderr: Arc<BoundedBuffer>,
}

impl TaskEntry {
    fn finish(&mut self, result: TaskResult) {
        tracing::debug!(
            task_id = %self.task.id,
            status = %result.status,
            elapsed_ms = (Utc::now() - self.started_at).num_milliseconds(),
            "agent task done"
        );
        self.result = result;
        self.done = true;
        self.finished_at = Some(Utc::now());
    }

    /// Record the worker's result unless a cancel already settled the task.
    fn settle(&mut self, result: TaskResult) -> Option<TaskResult> {
        if self.done {
            tracing::debug!(
                task_id = %self.task.id,
                status = %self.result.status,
                "agent task already settled"
            );
            return None;
        }
        self.finish(result.clone());
        Some(result)
    }

    fn expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        match self.finished_at {
            Some(at) if self.done => (now - at)
                .to_std()
                .map(|age| age >= retention)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// The final result, or `running` with the output captured so far.
    fn view(&self) -> RunResponse {
        if self.done {
            return RunResponse {
                result: self.result.clone(),
                run_id: self.task.run_id.clone(),
                error: self.result.error.clone(),
            };
        }
        let mut result = TaskResult::new(&self.task.id, TaskStatus::Running);
        result
            .output
            .insert("stdout".into(), Value::String(self.stdout.snapshot()));
        result
            .output
            .insert("stderr".into(), Value::String(self.stderr.snapshot()));
        RunResponse {
            result,
            run_id: self.task.run_id.clone(),
            error: String::new(),
        }
    }
}

struct AgentState {
    registry: ModuleRegistry,
    settings: AgentServerSettings,
    tasks: DashMap<String, TaskEntry>,
    mirror: RunMirror,
    last_beat: AtomicI64,
}

/// Agent HTTP service. Construction reconciles runs a previous process left `running`.
pub struct AgentServer {
    state: Arc<AgentState>,
}

impl AgentServer {
    pub async fn new(
        registry: ModuleRegistry,
        store: Arc<dyn RunStateStore>,
        settings: AgentServerSettings,
    ) -> Self {
        if !store.is_durable() {
            tracing::warn!("run state store not configured; using in-memory fallback (non-durable)");
        }
        match store.mark_interrupted_running(RESTART_REASON).await {
            Ok(0) => {}
            Ok(count) => tracing::info!(count, "agent reconciled interrupted runs"),
            Err(err) => tracing::warn!(error = %err, "agent run state reconciliation failed"),
        }
        Self {
            state: Arc::new(AgentState {
                registry,
                settings,
                tasks: DashMap::new(),
                mirror: RunMirror::new(store),
                last_beat: AtomicI64::new(Utc::now().timestamp()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/run", post(handle_run))
            .route("/status", get(handle_status).post(handle_status))
            .route("/cancel", get(handle_cancel).post(handle_cancel))
            .route("/heartbeat", post(handle_heartbeat))
            .route("/health", get(handle_health))
            .route("/run-status", get(handle_run_status))
            .layer(Extension(Arc::clone(&self.state)))
            .layer(RequestBodyLimitLayer::new(self.state.settings.max_body_bytes))
            .layer(MapResponseLayer::new(|mut response: Response<Body>| {
                if response.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    *response.body_mut() =
                        Body::from(json!({ "error": "payload too large" }).to_string());
                    response.headers_mut().insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("application/json"),
                    );
                }
                response
            }))
    }

    /// Bind, report the bound address, and serve until `shutdown` fires.
    pub async fn serve(
        self,
        shutdown: CancellationToken,
        ready: Option<oneshot::Sender<SocketAddr>>,
    ) -> Result<(), AppError> {
        let bind = self.state.settings.bind.clone();
        let bind_addr: SocketAddr = bind.parse().map_err(|err| {
            AppError::new(
                ErrorCategory::ConfigurationError,
                format!("invalid agent bind address {}: {}", bind, err),
            )
            .with_code("FF-SERVER-001")
        })?;
        let listener = TcpListener::bind(bind_addr).await.map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to bind agent listener {}: {}", bind_addr, err),
            )
            .with_code("FF-SERVER-002")
        })?;
        let local_addr = listener.local_addr().map_err(|err| {
            AppError::new(
                ErrorCategory::IoError,
                format!("failed to determine agent listener address: {}", err),
            )
            .with_code("FF-SERVER-002")
        })?;
        if let Some(tx) = ready {
            let _ = tx.send(local_addr);
        }
        tracing::info!(
            addr = %local_addr,
            token_required = !self.state.settings.token.trim().is_empty(),
            "agent server listening"
        );
        let served = axum::serve(listener, self.router().into_make_service())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        for entry in self.state.tasks.iter().filter(|entry| !entry.done) {
            entry.cancel.cancel();
        }
        served.map_err(|err| {
            AppError::new(
                ErrorCategory::NetworkError,
                format!("agent server terminated: {}", err),
            )
            .with_code("FF-SERVER-003")
        })
    }
}

async fn handle_run(
    Extension(state): Extension<Arc<AgentState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RunResponse>, AgentRejection> {
    authorize(&headers, &state.settings.token)?;
    evict_expired(&state.tasks, state.settings.task_retention);
    let RunRequest { mut task } = serde_json::from_slice(&body)
        .map_err(|err| AgentRejection::bad_request(err.to_string()))?;
    if task.id.trim().is_empty() {
        task.id = format!("task-{}", unix_nanos());
    }
    if task.run_id.trim().is_empty() {
        task.run_id = task.id.clone();
    }

    if let Some(existing) = state.tasks.get(&task.id) {
        tracing::debug!(task_id = %task.id, done = existing.done, "agent run duplicate");
        let view = if existing.done {
            existing.view()
        } else {
            RunResponse {
                result: TaskResult::new(&task.id, TaskStatus::Running),
                run_id: existing.task.run_id.clone(),
                error: String::new(),
            }
        };
        return Ok(Json(view));
    }

    tracing::info!(
        task_id = %task.id,
        run_id = %task.run_id,
        step = %task.step.name,
        action = %task.step.action,
        host = %task.host.name,
        "agent run start"
    );
    let module = state
        .registry
        .get(&task.step.action)
        .ok_or_else(|| AgentRejection {
            status: StatusCode::BAD_REQUEST,
            message: "unsupported action".to_string(),
            run_id: task.run_id.clone(),
        })?;

    let limit = output_limit(&task.step).unwrap_or(state.settings.max_output_bytes);
    let stdout = Arc::new(BoundedBuffer::new(limit));
    let stderr = Arc::new(BoundedBuffer::new(limit));
    let cancel = CancellationToken::new();
    state.tasks.insert(
        task.id.clone(),
        TaskEntry {
            task: task.clone(),
            result: TaskResult::new(&task.id, TaskStatus::Running),
            done: false,
            started_at: Utc::now(),
            finished_at: None,
            cancel: cancel.clone(),
            stdout: Arc::clone(&stdout),
            stderr: Arc::clone(&stderr),
        },
    );
    state
        .mirror
        .record(&task, RunStatus::Running, "task running", Vars::new())
        .await;

    let (done_tx, done_rx) = oneshot::channel();
    let worker_state = Arc::clone(&state);
    let worker_task = task.clone();
    tokio::spawn(async move {
        let request = ModuleRequest::new(
            worker_task.step.clone(),
            worker_task.host.clone(),
            worker_task.vars.clone(),
        )
        .with_cancel(cancel.clone())
        .with_sinks(
            Some(stdout as Arc<dyn OutputSink>),
            Some(stderr as Arc<dyn OutputSink>),
        );
        let result = match module.apply(&request).await {
            Ok(applied) => TaskResult {
                output: applied.output,
                ..TaskResult::new(&worker_task.id, TaskStatus::Success)
            },
            Err(failure) if cancel.is_cancelled() => TaskResult {
                output: failure.output,
                error: "task canceled".to_string(),
                ..TaskResult::new(&worker_task.id, TaskStatus::Canceled)
            },
            Err(failure) => TaskResult {
                output: failure.output,
                error: failure.error.to_string(),
                ..TaskResult::new(&worker_task.id, TaskStatus::Failed)
            },
        };
        let settled = match worker_state.tasks.get_mut(&worker_task.id) {
            Some(mut entry) => entry.settle(result.clone()).ok_or_else(|| entry.result.clone()),
            None => Ok(result),
        };
        let result = match settled {
            Ok(result) => {
                let message = if result.error.trim().is_empty() {
                    result.status.to_string()
                } else {
                    result.error.clone()
                };
                worker_state
                    .mirror
                    .record(
                        &worker_task,
                        run_status_of(&result.status),
                        &message,
                        result.output.clone(),
                    )
                    .await;
                result
            }
            Err(canceled) => canceled,
        };
        let _ = done_tx.send(result);
    });

    let threshold = state.settings.async_threshold;
    match tokio::time::timeout(threshold, done_rx).await {
        Ok(Ok(result)) => {
            tracing::info!(task_id = %task.id, run_id = %task.run_id, status = %result.status, "agent run finish");
            Ok(Json(RunResponse {
                error: result.error.clone(),
                result,
                run_id: task.run_id,
            }))
        }
        Ok(Err(_)) => Err(AgentRejection::internal("task worker stopped")),
        Err(_) => {
            tracing::info!(task_id = %task.id, threshold = ?threshold, "agent run switched to async");
            Ok(Json(RunResponse {
                result: TaskResult::new(&task.id, TaskStatus::Running),
                run_id: task.run_id,
                error: String::new(),
            }))
        }
    }
}

fn evict_expired(tasks: &DashMap<String, TaskEntry>, retention: Duration) {
    let now = Utc::now();
    let before = tasks.len();
    tasks.retain(|_, entry| !entry.expired(now, retention));
    let evicted = before.saturating_sub(tasks.len());
    if evicted > 0 {
        tracing::debug!(evicted, "agent evicted finished tasks");
    }
}

async fn handle_status(
    Extension(state): Extension<Arc<AgentState>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<RunResponse>, AgentRejection> {
    authorize(&headers, &state.settings.token)?;
    let task_id = task_id_of(&method, &query, &body)?;
    let entry = state
        .tasks
        .get(&task_id)
        .ok_or_else(|| AgentRejection::not_found("task not found"))?;
    Ok(Json(entry.view()))
}

async fn handle_cancel(
    Extension(state): Extension<Arc<AgentState>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Result<Json<RunResponse>, AgentRejection> {
    authorize(&headers, &state.settings.token)?;
    let task_id = task_id_of(&method, &query, &body)?;
    let task = {
        let mut entry = match state.tasks.get_mut(&task_id) {
            Some(entry) if !entry.done => entry,
            _ => return Err(AgentRejection::not_found("task not found or already done")),
        };
        entry.cancel.cancel();
        entry.finish(TaskResult::new(&task_id, TaskStatus::Canceled));
        entry.task.clone()
    };
    tracing::info!(task_id = %task_id, run_id = %task.run_id, "agent task canceled");
    state
        .mirror
        .record(&task, RunStatus::Canceled, "task canceled by request", Vars::new())
        .await;
    Ok(Json(RunResponse {
        result: TaskResult::new(&task_id, TaskStatus::Canceled),
        run_id: task.run_id,
        error: String::new(),
    }))
}

async fn handle_heartbeat(
    Extension(state): Extension<Arc<AgentState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, AgentRejection> {
    authorize(&headers, &state.settings.token)?;
    let now = Utc::now();
    state.last_beat.store(now.timestamp(), Ordering::SeqCst);
    tracing::debug!(bind = %state.settings.bind, "agent heartbeat");
    Ok(Json(json!({
        "status": "ok",
        "last_beat": now.to_rfc3339(),
        "timestamp": now.timestamp(),
        "capability": state.registry.actions(),
    })))
}

async fn handle_health(Extension(state): Extension<Arc<AgentState>>) -> Json<Value> {
    let now = Utc::now();
    let last_beat = DateTime::<Utc>::from_timestamp(state.last_beat.load(Ordering::SeqCst), 0)
        .unwrap_or(now);
    Json(json!({
        "status": "ok",
        "timestamp": now.timestamp(),
        "last_beat": last_beat.to_rfc3339(),
        "tasks": state.tasks.len(),
    }))
}

async fn handle_run_status(
    Extension(state): Extension<Arc<AgentState>>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response<Body>, AgentRejection> {
    authorize(&headers, &state.settings.token)?;
    let run_id = query
        .get("run_id")
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AgentRejection::bad_request("run_id is required"))?;
    match state.mirror.store().get_run(run_id).await {
        Ok(run) => Ok(Json(run).into_response()),
        Err(err) if is_not_found(&err) => Err(AgentRejection::not_found("run not found")),
        Err(err) => Err(AgentRejection::internal(err.to_string())),
    }
}

/// Task id from the query string, or for POST from a `{task_id}` body.
fn task_id_of(
    method: &Method,
    query: &HashMap<String, String>,
    body: &Bytes,
) -> Result<String, AgentRejection> {
    let mut task_id = query
        .get("task_id")
        .map(|id| id.trim().to_string())
        .unwrap_or_default();
    if task_id.is_empty() && *method == Method::POST && !body.is_empty() {
        let request: TaskIdRequest = serde_json::from_slice(body)
            .map_err(|err| AgentRejection::bad_request(err.to_string()))?;
        task_id = request.task_id.trim().to_string();
    }
    if task_id.is_empty() {
        return Err(AgentRejection::bad_request("task_id is required"));
    }
    Ok(task_id)
}

/// Accepts `Authorization: Bearer <token>` or `X-Runner-Token: <token>`.
fn authorize(headers: &HeaderMap, expected: &str) -> Result<(), AgentRejection> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Ok(());
    }
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
    };
    let auth = header_str(header::AUTHORIZATION.as_str());
    let bearer = match auth.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => auth[7..].trim(),
        _ => auth,
    };
    let runner_token = header_str("x-runner-token");
    let accepted = |candidate: &str| -> bool {
        !candidate.is_empty() && bool::from(candidate.as_bytes().ct_eq(expected.as_bytes()))
    };
    if accepted(bearer) || accepted(runner_token) {
        Ok(())
    } else {
        Err(AgentRejection::unauthorized())
    }
}

#[derive(Debug)]
struct AgentRejection {
    status: StatusCode,
    message: String,
    run_id: String,
}

impl AgentRejection {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            run_id: String::new(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(error = %message, "agent request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AgentRejection {
    fn into_response(self) -> Response<Body> {
        let mut resp = Json(RunResponse {
            run_id: self.run_id,
            error: self.message,
            ..RunResponse::default()
        })
        .into_response();
        *resp.status_mut() = self.status;
        resp
    }
}
