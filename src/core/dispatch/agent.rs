#![allow(clippy::result_large_err)]

//! HTTP client side of the agent protocol: `/heartbeat`, `/run`, `/status`.

use crate::core::dispatch::{DispatchError, Dispatcher, Task, TaskResult, TaskStatus};
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use crate::core::workflow::vars::{value_to_string, Vars};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const ERROR_BODY_LIMIT: usize = 2048;

/// Receives streamed output: `(task_id, step, host, stream, chunk)`.
pub type OutputCallback = Arc<dyn Fn(&str, &str, &str, &str, &str) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AgentDispatcherSettings {
    /// Used when a host has no address of its own.
    pub base_url: String,
    pub headers: BTreeMap<String, String>,
    pub token: String,
    pub heartbeat: bool,
    pub heartbeat_path: String,
    pub status_path: String,
    /// Retries after the first attempt.
    pub retry_max: u32,
    pub retry_delay: Duration,
    pub dispatch_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub async_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for AgentDispatcherSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            headers: BTreeMap::new(),
            token: String::new(),
            heartbeat: false,
            heartbeat_path: "/heartbeat".to_string(),
            status_path: "/status".to_string(),
            retry_max: 0,
            retry_delay: Duration::from_secs(1),
            dispatch_timeout: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            async_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct OutputOffset {
    stdout: usize,
    stderr: usize,
}

#[derive(Debug, Clone, Default)]
struct TaskMeta {
    step: String,
    host: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: TaskResult,
    #[serde(default)]
    error: Option<String>,
}

pub struct AgentDispatcher {
    settings: AgentDispatcherSettings,
    client: reqwest::Client,
    on_output: Option<OutputCallback>,
    offsets: Mutex<HashMap<String, OutputOffset>>,
    meta: Mutex<HashMap<String, TaskMeta>>,
}

/// Drops per-task metadata once the dispatch that registered it returns.
struct InFlight<'a> {
    dispatcher: &'a AgentDispatcher,
    task_id: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.task_id.trim().is_empty() {
            return;
        }
        if let Ok(mut offsets) = self.dispatcher.offsets.lock() {
            offsets.remove(&self.task_id);
        }
        if let Ok(mut meta) = self.dispatcher.meta.lock() {
            meta.remove(&self.task_id);
        }
    }
}

impl AgentDispatcher {
    pub fn new(settings: AgentDispatcherSettings) -> Self {
        Self {
            settings,
            client: reqwest::Client::new(),
            on_output: None,
            offsets: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self::new(AgentDispatcherSettings {
            base_url: base_url.into().trim().to_string(),
            ..AgentDispatcherSettings::default()
        })
    }

    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.on_output = Some(callback);
        self
    }

    pub fn settings(&self) -> &AgentDispatcherSettings {
        &self.settings
    }

    fn track(&self, task: &Task) -> InFlight<'_> {
        if !task.id.trim().is_empty() {
            if let Ok(mut meta) = self.meta.lock() {
                meta.insert(
                    task.id.clone(),
                    TaskMeta {
                        step: task.step.name.clone(),
                        host: task.host.name.clone(),
                    },
                );
            }
        }
        InFlight {
            dispatcher: self,
            task_id: task.id.clone(),
        }
    }

    /// A host address with a scheme names its own agent. A bare address (the inventory fills
    /// in the host name) defers to the configured base url, or becomes `http://<address>`.
    fn base_url_for(&self, task: &Task) -> Result<String, AppError> {
        let address = task.host.address.trim();
        let configured = self.settings.base_url.trim();
        let base = if address.contains("://") {
            address.to_string()
        } else if !configured.is_empty() {
            configured.to_string()
        } else if !address.is_empty() {
            format!("http://{}", address)
        } else {
            return Err(AppError::new(
                ErrorCategory::ConfigurationError,
                "agent dispatcher base url is required",
            )
            .with_code("FF-AGENT-001"));
        };
        Ok(base.trim_end_matches('/').to_string())
    }

    fn authorize(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let token = self.settings.token.trim();
        if !token.is_empty() {
            builder = builder
                .bearer_auth(token)
                .header("X-Runner-Token", token);
        }
        builder
    }

    fn with_headers(&self, mut builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (key, value) in &self.settings.headers {
            if key.trim().is_empty() || value.trim().is_empty() {
                continue;
            }
            builder = builder.header(key.as_str(), value.as_str());
        }
        builder
    }

    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, AppError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::canceled("agent request")),
            response = builder.send() => response.map_err(transport_error),
        }
    }

    async fn send_heartbeat(&self, base_url: &str, cancel: &CancellationToken) -> Result<(), AppError> {
        let path = non_empty_or(&self.settings.heartbeat_path, "/heartbeat");
        let url = format!("{}{}", base_url, path);
        let builder = self
            .authorize(self.client.post(&url))
            .timeout(self.settings.heartbeat_timeout);
        let response = self.send(builder, cancel).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_limited_body(response).await;
            tracing::warn!(status = %status, body = %body, url = %url, "agent heartbeat failed");
            return Err(http_failure("agent heartbeat failed", status, &body, "FF-AGENT-002"));
        }
        Ok(())
    }

    async fn dispatch_once(
        &self,
        base_url: &str,
        task: &Task,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        let url = format!("{}/run", base_url);
        let builder = self
            .with_headers(self.authorize(self.client.post(&url)))
            .timeout(self.settings.dispatch_timeout)
            .json(&json!({ "task": task }));
        let response = self.send(builder, cancel).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_limited_body(response).await;
            tracing::warn!(
                status = %status,
                body = %body,
                url = %url,
                task_id = %task.id,
                "agent dispatch failed"
            );
            return Err(http_failure("agent dispatch failed", status, &body, "FF-AGENT-003").into());
        }
        decode_envelope(response, &task.id).await
    }

    async fn fetch_status(
        &self,
        base_url: &str,
        task_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        let path = non_empty_or(&self.settings.status_path, "/status");
        let url = format!("{}{}", base_url, path);
        let builder = self
            .with_headers(self.authorize(self.client.post(&url)))
            .timeout(timeout)
            .json(&json!({ "task_id": task_id }));
        let response = self.send(builder, cancel).await?;
        let status = response.status();
        if !status.is_success() {
            let body = read_limited_body(response).await;
            return Err(http_failure("agent status failed", status, &body, "FF-AGENT-004").into());
        }
        decode_envelope(response, task_id).await
    }

    async fn poll_status(
        &self,
        base_url: &str,
        task_id: &str,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        if task_id.trim().is_empty() {
            return Err(AppError::new(
                ErrorCategory::ValidationError,
                "task_id is required for status polling",
            )
            .with_code("FF-AGENT-005")
            .into());
        }
        let deadline = Instant::now() + self.settings.async_timeout;
        let interval = if self.settings.poll_interval.is_zero() {
            Duration::from_secs(2)
        } else {
            self.settings.poll_interval
        };

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::canceled("agent status polling").into());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(async_timeout(task_id, self.settings.async_timeout).into());
            }
            let request_timeout = remaining.min(self.settings.dispatch_timeout);
            let mut result = self
                .fetch_status(base_url, task_id, request_timeout, cancel)
                .await?;
            self.emit_output_delta(task_id, &result.output);
            if !result.status.is_running() {
                if result.status == TaskStatus::Unset {
                    result.status = TaskStatus::Success;
                }
                return Ok(result);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::canceled("agent status polling").into());
                }
                _ = tokio::time::sleep(interval.min(remaining)) => {}
            }
        }
    }

    fn emit_output_delta(&self, task_id: &str, output: &Vars) {
        let stdout = output.get("stdout").map(value_to_string).unwrap_or_default();
        let stderr = output.get("stderr").map(value_to_string).unwrap_or_default();
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }

        let mut offset = self
            .offsets
            .lock()
            .map(|offsets| offsets.get(task_id).copied().unwrap_or_default())
            .unwrap_or_default();
        let meta = self
            .meta
            .lock()
            .map(|meta| meta.get(task_id).cloned().unwrap_or_default())
            .unwrap_or_default();

        for (stream, text, seen) in [
            ("stdout", &stdout, &mut offset.stdout),
            ("stderr", &stderr, &mut offset.stderr),
        ] {
            if text.len() <= *seen {
                continue;
            }
            let chunk = String::from_utf8_lossy(&text.as_bytes()[*seen..]).into_owned();
            *seen = text.len();
            if chunk.trim().is_empty() {
                continue;
            }
            tracing::info!(task_id, stream, chunk = %chunk, "agent output");
            if let Some(callback) = &self.on_output {
                callback(task_id, &meta.step, &meta.host, stream, &chunk);
            }
        }

        if let Ok(mut offsets) = self.offsets.lock() {
            offsets.insert(task_id.to_string(), offset);
        }
    }

    async fn wait_retry(&self, cancel: &CancellationToken) -> Result<(), AppError> {
        let delay = if self.settings.retry_delay.is_zero() {
            Duration::from_secs(1)
        } else {
            self.settings.retry_delay
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(AppError::canceled("agent dispatch retry")),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl Dispatcher for AgentDispatcher {
    async fn dispatch(
        &self,
        task: Task,
        cancel: CancellationToken,
    ) -> Result<TaskResult, DispatchError> {
        let _in_flight = self.track(&task);
        let base_url = self.base_url_for(&task)?;
        let attempts = self.settings.retry_max.saturating_add(1);

        let mut last_error: Option<AppError> = None;
        let mut last_result = TaskResult::default();

        for attempt in 0..attempts {
            let is_last = attempt + 1 == attempts;
            if cancel.is_cancelled() {
                return Err(DispatchError::new(
                    AppError::canceled("agent dispatch"),
                    last_result,
                ));
            }

            if self.settings.heartbeat {
                if let Err(err) = self.send_heartbeat(&base_url, &cancel).await {
                    if err.is_canceled() || is_last {
                        return Err(DispatchError::new(err, last_result));
                    }
                    tracing::warn!(
                        host = %base_url,
                        attempt = attempt + 1,
                        error = %err,
                        "agent heartbeat failed, retrying"
                    );
                    last_error = Some(err);
                    if let Err(wait_err) = self.wait_retry(&cancel).await {
                        return Err(DispatchError::new(wait_err, last_result));
                    }
                    continue;
                }
            }

            match self.dispatch_once(&base_url, &task, &cancel).await {
                Ok(result) if result.status.is_running() => {
                    return self.poll_status(&base_url, &result.task_id, &cancel).await;
                }
                Ok(result) => return Ok(result),
                Err(failure) => {
                    if failure.error.is_canceled() {
                        return Err(failure);
                    }
                    last_result = failure.partial;
                    if !is_last {
                        tracing::warn!(
                            task_id = %task.id,
                            attempt = attempt + 1,
                            error = %failure.error,
                            "agent dispatch failed, retrying"
                        );
                    }
                    last_error = Some(failure.error);
                    if !is_last {
                        if let Err(wait_err) = self.wait_retry(&cancel).await {
                            return Err(DispatchError::new(wait_err, last_result));
                        }
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            AppError::new(ErrorCategory::NetworkError, "agent dispatch failed")
                .with_code("FF-AGENT-003")
        });
        Err(DispatchError::new(error, last_result))
    }
}

async fn decode_envelope(
    response: reqwest::Response,
    task_id: &str,
) -> Result<TaskResult, DispatchError> {
    let envelope: Envelope = response.json().await.map_err(|err| {
        AppError::new(
            ErrorCategory::SerializationError,
            format!("failed to decode agent response: {}", err),
        )
        .with_code("FF-AGENT-006")
    })?;
    let mut result = envelope.result;
    if result.task_id.is_empty() {
        result.task_id = task_id.to_string();
    }
    match envelope.error.filter(|e| !e.is_empty()) {
        Some(message) => {
            result.status = TaskStatus::Failed;
            result.error = message.clone();
            let err = AppError::new(ErrorCategory::ExecutionError, message).with_code("FF-AGENT-007");
            Err(DispatchError::new(err, result))
        }
        None => Ok(result),
    }
}

async fn read_limited_body(response: reqwest::Response) -> String {
    match response.bytes().await {
        Ok(bytes) => {
            let end = bytes.len().min(ERROR_BODY_LIMIT);
            String::from_utf8_lossy(&bytes[..end]).trim().to_string()
        }
        Err(_) => String::new(),
    }
}

fn http_failure(prefix: &str, status: reqwest::StatusCode, body: &str, code: &str) -> AppError {
    let message = if body.is_empty() {
        format!("{}: {}", prefix, status)
    } else {
        format!("{}: {} ({})", prefix, status, body)
    };
    AppError::new(ErrorCategory::NetworkError, message).with_code(code)
}

fn transport_error(err: reqwest::Error) -> AppError {
    let category = if err.is_timeout() {
        ErrorCategory::TimeoutError
    } else {
        ErrorCategory::NetworkError
    };
    AppError::new(category, format!("agent request failed: {}", err)).with_code("FF-AGENT-008")
}

fn async_timeout(task_id: &str, limit: Duration) -> AppError {
    AppError::new(
        ErrorCategory::TimeoutError,
        format!(
            "agent task {} did not finish within {}",
            task_id,
            humantime::format_duration(limit)
        ),
    )
    .with_code("FF-AGENT-009")
}

fn non_empty_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    match value.trim() {
        "" => fallback,
        trimmed => trimmed,
    }
}
