use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_NOTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Payload posted to a run-state webhook. Delivery is at-least-once and unordered; `version`
/// lets the receiver discard stale updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStateCallback {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workflow_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub version: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notifier url is required")]
    MissingUrl,
    #[error("notifier request failed: {0}")]
    Transport(String),
    #[error("notifier responded with {0}")]
    Status(String),
}

#[async_trait]
pub trait RunStateNotifier: Send + Sync {
    async fn notify_run_state(&self, payload: &RunStateCallback) -> Result<(), NotifyError>;
}

/// Posts callbacks as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    url: String,
    headers: BTreeMap<String, String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpNotifier {
    /// Blank header names or values are dropped.
    pub fn new(url: impl Into<String>, headers: &BTreeMap<String, String>) -> Self {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();
        Self {
            url: url.into().trim().to_string(),
            headers,
            client: reqwest::Client::new(),
            timeout: DEFAULT_NOTIFY_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl RunStateNotifier for HttpNotifier {
    async fn notify_run_state(&self, payload: &RunStateCallback) -> Result<(), NotifyError> {
        if self.url.is_empty() {
            return Err(NotifyError::MissingUrl);
        }
        let mut request = self.client.post(&self.url).json(payload).timeout(self.timeout);
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NotifyError::Status(response.status().to_string()));
        }
        tracing::debug!(
            run_id = %payload.run_id,
            status = %payload.status,
            version = payload.version,
            "run state callback delivered"
        );
        Ok(())
    }
}
