use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Analysis backend base URL. A value without a scheme is treated as https.
    #[serde(default = "default_analysis_api_url")]
    pub analysis_api_url: String,

    /// HS256 secret used to verify bearer tokens
    pub jwt_secret: String,

    /// Timeout for the synchronous job-start call
    #[serde(default = "default_start_timeout_secs")]
    pub backend_start_timeout_secs: u64,

    /// Timeout for each status call made while polling
    #[serde(default = "default_status_timeout_secs")]
    pub backend_status_timeout_secs: u64,

    /// A non-terminal job not updated for this long is failed on the next poll
    #[serde(default = "default_stale_job_secs")]
    pub stale_job_secs: u64,

    /// Worker loop interval
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Jobs nobody polls are failed by the worker after this long without updates
    #[serde(default = "default_abandoned_job_secs")]
    pub abandoned_job_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_analysis_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_start_timeout_secs() -> u64 {
    10
}

fn default_status_timeout_secs() -> u64 {
    5
}

fn default_stale_job_secs() -> u64 {
    300
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_abandoned_job_secs() -> u64 {
    1800
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn stale_job_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_job_secs)
    }

    pub fn abandoned_job_threshold(&self) -> Duration {
        Duration::from_secs(self.abandoned_job_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
