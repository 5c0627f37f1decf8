//! Run tracing, feedback, and shareable trace links.
//!
//! [`TraceClient`] abstracts the observability service that records runs
//! and feedback. [`LangSmithClient`] talks to the LangSmith REST API;
//! [`DisabledTraceClient`] records nothing and refuses feedback and sharing.
//!
//! A run becomes readable some time after it is posted, so
//! [`get_trace_url`] polls [`TraceClient::read_run`] a bounded number of
//! times before asking for (or creating) the share link.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::TracingConfig;

/// Errors from the observability service.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The run (or feedback) is not known yet.
    #[error("not found: {0}")]
    NotFound(String),
    /// Network failure, timeout, rate limit, or server error.
    #[error("transient tracing error: {0}")]
    Transient(String),
    /// Any other rejection by the service.
    #[error("tracing API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("tracing is disabled")]
    Disabled,
}

impl TraceError {
    /// Whether [`get_trace_url`] should try the read again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TraceError::NotFound(_) | TraceError::Transient(_))
    }
}

impl From<reqwest::Error> for TraceError {
    fn from(e: reqwest::Error) -> Self {
        TraceError::Transient(e.to_string())
    }
}

/// Inputs recorded when a run starts.
#[derive(Debug, Clone)]
pub struct RunStart {
    pub id: Uuid,
    pub name: String,
    pub inputs: Value,
    pub conversation_id: Option<String>,
    pub start_time: DateTime<Utc>,
}

#[async_trait]
pub trait TraceClient: Send + Sync {
    async fn create_run(&self, run: &RunStart) -> Result<(), TraceError>;

    async fn end_run(
        &self,
        run_id: Uuid,
        outputs: Option<Value>,
        error: Option<String>,
    ) -> Result<(), TraceError>;

    /// Record feedback. `feedback` carries at least `run_id` and `key`.
    async fn create_feedback(&self, feedback: &Value) -> Result<Value, TraceError>;

    async fn update_feedback(
        &self,
        feedback_id: &str,
        score: Option<Value>,
        comment: Option<String>,
    ) -> Result<(), TraceError>;

    async fn read_run(&self, run_id: &str) -> Result<Value, TraceError>;

    /// The public link of a shared run, or `None` when it is not shared.
    async fn read_shared_link(&self, run_id: &str) -> Result<Option<String>, TraceError>;

    async fn run_is_shared(&self, run_id: &str) -> Result<bool, TraceError> {
        Ok(self.read_shared_link(run_id).await?.is_some())
    }

    /// Share a run and return its public link.
    async fn share_run(&self, run_id: &str) -> Result<String, TraceError>;
}

/// Bounded retry schedule for [`get_trace_url`].
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TracingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_ms),
            max_delay: Duration::from_millis(config.retry_max_ms),
        }
    }

    /// Sleep after failed attempt `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Return a shareable URL for `run_id`.
///
/// Reads the run up to `policy.max_attempts` times while it is not yet
/// available, without sleeping after the last attempt. Whether or not a read
/// succeeded, it then returns the existing share link or shares the run.
pub async fn get_trace_url(
    client: &dyn TraceClient,
    run_id: &str,
    policy: &RetryPolicy,
) -> Result<String, TraceError> {
    for attempt in 0..policy.max_attempts {
        match client.read_run(run_id).await {
            Ok(_) => break,
            Err(e) if e.is_retryable() => {
                tracing::debug!(run_id, attempt, error = %e, "run not readable yet");
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay(attempt)).await;
                }
            }
            Err(e) => return Err(e),
        }
    }

    match client.read_shared_link(run_id).await? {
        Some(link) => Ok(link),
        None => client.share_run(run_id).await,
    }
}

/// Records nothing; refuses feedback and sharing.
pub struct DisabledTraceClient;

#[async_trait]
impl TraceClient for DisabledTraceClient {
    async fn create_run(&self, _run: &RunStart) -> Result<(), TraceError> {
        Ok(())
    }

    async fn end_run(
        &self,
        _run_id: Uuid,
        _outputs: Option<Value>,
        _error: Option<String>,
    ) -> Result<(), TraceError> {
        Ok(())
    }

    async fn create_feedback(&self, _feedback: &Value) -> Result<Value, TraceError> {
        Err(TraceError::Disabled)
    }

    async fn update_feedback(
        &self,
        _feedback_id: &str,
        _score: Option<Value>,
        _comment: Option<String>,
    ) -> Result<(), TraceError> {
        Err(TraceError::Disabled)
    }

    async fn read_run(&self, _run_id: &str) -> Result<Value, TraceError> {
        Err(TraceError::Disabled)
    }

    async fn read_shared_link(&self, _run_id: &str) -> Result<Option<String>, TraceError> {
        Err(TraceError::Disabled)
    }

    async fn share_run(&self, _run_id: &str) -> Result<String, TraceError> {
        Err(TraceError::Disabled)
    }
}

/// Feedback fields forwarded to LangSmith; anything else in a request is dropped.
const FEEDBACK_FIELDS: [&str; 8] = [
    "run_id",
    "key",
    "score",
    "value",
    "comment",
    "correction",
    "feedback_id",
    "source_info",
];

/// LangSmith REST client (`x-api-key` auth).
pub struct LangSmithClient {
    client: reqwest::Client,
    endpoint: String,
    web_url: String,
    api_key: String,
    project: String,
}

impl LangSmithClient {
    pub fn new(config: &TracingConfig) -> anyhow::Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow::anyhow!("tracing.api_key required for LangSmith"))?;
        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()?,
            web_url: web_url_for(&endpoint),
            endpoint,
            api_key,
            project: config.project.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<Value, TraceError> {
        let response = req.header("x-api-key", &self.api_key).send().await?;
        let status = response.status();
        if status.is_success() {
            let text = response.text().await?;
            if text.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&text).map_err(|e| TraceError::Api {
                status: status.as_u16(),
                message: format!("invalid JSON from {}: {}", what, e),
            });
        }

        let message = response.text().await.unwrap_or_default();
        Err(match status.as_u16() {
            404 => TraceError::NotFound(format!("{}: {}", what, message)),
            429 | 500..=599 => TraceError::Transient(format!("{} {}: {}", what, status, message)),
            code => TraceError::Api {
                status: code,
                message,
            },
        })
    }

    fn public_link(&self, token: &str) -> String {
        format!("{}/public/{}/r", self.web_url, token)
    }
}

/// Browser URL for an API endpoint: `https://api.smith.langchain.com`
/// becomes `https://smith.langchain.com`; a trailing `/api` is dropped.
pub fn web_url_for(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if let Some(rest) = trimmed.strip_suffix("/api") {
        return rest.to_string();
    }
    for scheme in ["https://", "http://"] {
        if let Some(host) = trimmed.strip_prefix(scheme) {
            if let Some(stripped) = host.strip_prefix("api.") {
                return format!("{}{}", scheme, stripped);
            }
        }
    }
    trimmed.to_string()
}

#[async_trait]
impl TraceClient for LangSmithClient {
    async fn create_run(&self, run: &RunStart) -> Result<(), TraceError> {
        let body = json!({
            "id": run.id,
            "name": run.name,
            "run_type": "chain",
            "inputs": run.inputs,
            "start_time": run.start_time.to_rfc3339(),
            "session_name": self.project,
            "extra": { "metadata": { "conversation_id": run.conversation_id } },
        });
        self.send(self.client.post(self.url("/runs")).json(&body), "create run")
            .await
            .map(|_| ())
    }

    async fn end_run(
        &self,
        run_id: Uuid,
        outputs: Option<Value>,
        error: Option<String>,
    ) -> Result<(), TraceError> {
        let body = json!({
            "outputs": outputs,
            "error": error,
            "end_time": Utc::now().to_rfc3339(),
        });
        self.send(
            self.client
                .patch(self.url(&format!("/runs/{}", run_id)))
                .json(&body),
            "end run",
        )
        .await
        .map(|_| ())
    }

    async fn create_feedback(&self, feedback: &Value) -> Result<Value, TraceError> {
        let mut body = serde_json::Map::new();
        for field in FEEDBACK_FIELDS {
            if let Some(v) = feedback.get(field) {
                let name = if field == "feedback_id" { "id" } else { field };
                body.insert(name.to_string(), v.clone());
            }
        }
        self.send(
            self.client.post(self.url("/feedback")).json(&Value::Object(body)),
            "create feedback",
        )
        .await
    }

    async fn update_feedback(
        &self,
        feedback_id: &str,
        score: Option<Value>,
        comment: Option<String>,
    ) -> Result<(), TraceError> {
        let mut body = serde_json::Map::new();
        if let Some(score) = score {
            body.insert("score".into(), score);
        }
        if let Some(comment) = comment {
            body.insert("comment".into(), Value::String(comment));
        }
        self.send(
            self.client
                .patch(self.url(&format!("/feedback/{}", feedback_id)))
                .json(&Value::Object(body)),
            "update feedback",
        )
        .await
        .map(|_| ())
    }

    async fn read_run(&self, run_id: &str) -> Result<Value, TraceError> {
        self.send(
            self.client.get(self.url(&format!("/runs/{}", run_id))),
            "read run",
        )
        .await
    }

    async fn read_shared_link(&self, run_id: &str) -> Result<Option<String>, TraceError> {
        let value = self
            .send(
                self.client.get(self.url(&format!("/runs/{}/share", run_id))),
                "read share link",
            )
            .await?;
        Ok(value
            .get("share_token")
            .and_then(|t| t.as_str())
            .map(|t| self.public_link(t)))
    }

    async fn share_run(&self, run_id: &str) -> Result<String, TraceError> {
        let body = json!({ "run_id": run_id, "share_token": Uuid::new_v4() });
        let value = self
            .send(
                self.client
                    .put(self.url(&format!("/runs/{}/share", run_id)))
                    .json(&body),
                "share run",
            )
            .await?;
        let token = value
            .get("share_token")
            .and_then(|t| t.as_str())
            .ok_or_else(|| TraceError::Api {
                status: 200,
                message: "share response missing share_token".into(),
            })?;
        Ok(self.public_link(token))
    }
}

/// Create the [`TraceClient`] named by `config.provider`.
pub fn create_trace_client(config: &TracingConfig) -> anyhow::Result<Arc<dyn TraceClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledTraceClient)),
        "langsmith" => Ok(Arc::new(LangSmithClient::new(config)?)),
        other => anyhow::bail!("Unknown tracing provider: {}", other),
    }
}
