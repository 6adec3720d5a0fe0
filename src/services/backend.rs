use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::models::job::{JobKind, JobStatus, StepStatus, StepStatuses};

const DEFAULT_BASE_URL: &str = "http://localhost:8000";
const MAX_DETAIL_LEN: usize = 500;

/// The external service that performs the actual analysis.
#[async_trait]
pub trait AnalysisBackend: Send + Sync {
    /// Start a job and return the backend's job id.
    async fn start_job(&self, kind: JobKind, payload: &serde_json::Value) -> Result<String, BackendError>;

    async fn job_status(&self, kind: JobKind, external_job_id: &str) -> Result<BackendJobStatus, BackendError>;

    async fn health(&self) -> Result<(), BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {detail}")]
    Rejected { status: u16, detail: String },

    #[error("job not found on backend")]
    NotFound,

    #[error("failed to parse backend response: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct StartResponse {
    #[serde(alias = "id")]
    job_id: String,
}

/// Status payload as the backend reports it. Fields beyond `status` are optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendJobStatus {
    pub status: String,
    #[serde(default, alias = "progress")]
    pub progress_percent: Option<f64>,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub step_statuses: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
    #[serde(default, alias = "estimated_time_remaining", alias = "estimatedTimeRemaining")]
    pub estimated_seconds_remaining: Option<f64>,
}

impl BackendJobStatus {
    /// Whole seconds, ignoring negative or non-finite estimates.
    pub fn estimated_seconds(&self) -> Option<i64> {
        self.estimated_seconds_remaining
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(|secs| secs.ceil() as i64)
    }

    pub fn job_status(&self) -> JobStatus {
        JobStatus::from_backend(&self.status)
    }

    /// Step map with unrecognised step states treated as pending.
    pub fn steps(&self) -> Option<StepStatuses> {
        self.step_statuses.as_ref().map(|raw| {
            raw.iter()
                .map(|(step, state)| {
                    let status = state
                        .to_ascii_lowercase()
                        .parse::<StepStatus>()
                        .unwrap_or(StepStatus::Pending);
                    (step.clone(), status)
                })
                .collect()
        })
    }

    /// The backend reports errors either as a string or as `{message, step?}`.
    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Object(map) => map
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string),
            _ => None,
        }
    }

    pub fn error_step(&self) -> Option<String> {
        self.error
            .as_ref()?
            .get("step")
            .and_then(|s| s.as_str())
            .map(str::to_string)
    }
}

/// Add `https://` when the configured URL has no scheme and drop trailing slashes.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return DEFAULT_BASE_URL.to_string();
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn truncate_detail(body: String) -> String {
    if body.chars().count() <= MAX_DETAIL_LEN {
        return body;
    }
    body.chars().take(MAX_DETAIL_LEN).collect()
}

/// reqwest-backed client for the analysis backend.
pub struct HttpAnalysisBackend {
    http: Client,
    base_url: String,
    start_timeout: Duration,
    status_timeout: Duration,
}

impl HttpAnalysisBackend {
    pub fn new(
        base_url: &str,
        start_timeout: Duration,
        status_timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            start_timeout,
            status_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn record_latency(operation: &'static str, started: Instant) {
        metrics::histogram!("analysis_backend_request_seconds", "operation" => operation)
            .record(started.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl AnalysisBackend for HttpAnalysisBackend {
    async fn start_job(&self, kind: JobKind, payload: &serde_json::Value) -> Result<String, BackendError> {
        let url = format!("{}{}", self.base_url, kind.backend_path());
        let started = Instant::now();

        let response = self
            .http
            .post(&url)
            .timeout(self.start_timeout)
            .json(payload)
            .send()
            .await;
        Self::record_latency("start", started);
        let response = response?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            tracing::warn!(
                kind = %kind,
                status = status.as_u16(),
                "Analysis backend rejected job start"
            );
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                detail: truncate_detail(body),
            });
        }

        let parsed: StartResponse = serde_json::from_str(&body)?;
        Ok(parsed.job_id)
    }

    async fn job_status(&self, kind: JobKind, external_job_id: &str) -> Result<BackendJobStatus, BackendError> {
        let url = format!(
            "{}{}/{}/status",
            self.base_url,
            kind.backend_path(),
            external_job_id
        );
        let started = Instant::now();

        let response = self
            .http
            .get(&url)
            .timeout(self.status_timeout)
            .send()
            .await;
        Self::record_latency("status", started);
        let response = response?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(BackendError::NotFound);
        }
        let body = response.text().await?;
        if !status.is_success() {
            return Err(BackendError::Rejected {
                status: status.as_u16(),
                detail: truncate_detail(body),
            });
        }

        Ok(serde_json::from_str(&body)?)
    }

    async fn health(&self) -> Result<(), BackendError> {
        let url = format!("{}/health", self.base_url);
        let started = Instant::now();

        let response = self
            .http
            .get(&url)
            .timeout(self.status_timeout)
            .send()
            .await;
        Self::record_latency("health", started);
        let response = response?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BackendError::Rejected {
                status: response.status().as_u16(),
                detail: "health check failed".to_string(),
            })
        }
    }
}
