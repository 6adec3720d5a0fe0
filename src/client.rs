//! Typed client for the gateway API, including the fixed-interval poll loop
//! that waits for an analysis job to finish.

use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::requests::{JobAccepted, JobStatusResponse};

#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_attempts: 90,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("job did not finish after {attempts} status checks")]
    Timeout { attempts: u32 },
}

#[derive(Deserialize)]
struct ApiErrorBody {
    code: String,
    message: String,
}

/// Re-fetch a job's status until it is terminal or the attempt ceiling is hit.
///
/// There is no backoff. Dropping the returned future stops polling but does
/// not cancel the job on the server.
pub async fn poll_until_terminal<F, Fut>(
    mut fetch: F,
    options: PollOptions,
) -> Result<JobStatusResponse, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<JobStatusResponse, ClientError>>,
{
    let attempts = options.max_attempts.max(1);
    for attempt in 1..=attempts {
        let status = fetch().await?;
        if status.status.is_terminal() {
            return Ok(status);
        }
        tracing::debug!(
            job_id = %status.job_id,
            attempt,
            progress = status.progress_percent,
            "Job still running"
        );
        if attempt < attempts {
            tokio::time::sleep(options.interval).await;
        }
    }
    Err(ClientError::Timeout { attempts })
}

pub struct GatewayClient {
    http: Client,
    base_url: String,
    token: String,
}

impl GatewayClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let body = response.text().await?;
        let (code, message) = match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(parsed) => (parsed.code, parsed.message),
            Err(_) => ("UNKNOWN".to_string(), body),
        };
        Err(ClientError::Api {
            status: status.as_u16(),
            code,
            message,
        })
    }

    /// POST a job request to `path` (e.g. `/api/v1/yearly`).
    pub async fn submit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<JobAccepted, ClientError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/v1/jobs/{}", self.base_url, job_id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub async fn wait_for_completion(
        &self,
        job_id: Uuid,
        options: PollOptions,
    ) -> Result<JobStatusResponse, ClientError> {
        poll_until_terminal(|| self.job_status(job_id), options).await
    }
}
