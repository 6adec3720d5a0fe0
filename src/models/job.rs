use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

/// Lifecycle status of an analysis job.
///
/// The backend also reports `in_progress`, `running` and `queued`; those are
/// folded into the two non-terminal states here.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    #[serde(alias = "queued")]
    #[strum(to_string = "pending", serialize = "queued")]
    Pending,
    #[serde(alias = "in_progress", alias = "running")]
    #[strum(to_string = "processing", serialize = "in_progress", serialize = "running")]
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Parse a status string reported by the analysis backend.
    /// Unknown values are treated as work still in flight.
    pub fn from_backend(raw: &str) -> Self {
        raw.trim()
            .to_ascii_lowercase()
            .parse()
            .unwrap_or(JobStatus::Processing)
    }
}

/// Per-step status shown on the progress bar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

pub type StepStatuses = BTreeMap<String, StepStatus>;

/// How a new request interacts with the latest job for the same subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Every request starts a new job.
    None,
    /// An in-flight job is returned; failed-and-paid jobs are retried for free.
    InFlight,
    /// Like `InFlight`, and a completed job is returned instead of regenerating.
    InFlightOrCompleted,
}

/// The kinds of long-running analysis the backend performs.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Display,
    EnumString,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    ProfileReport,
    YearlyAnalysis,
    Compatibility,
    DailyFortune,
    ConsultationMessage,
    FollowUpQuestion,
    SectionReanalysis,
}

impl JobKind {
    /// Credits charged when a job of this kind is created.
    pub fn credit_cost(self) -> i32 {
        match self {
            JobKind::ProfileReport => 50,
            JobKind::YearlyAnalysis => 30,
            JobKind::Compatibility => 70,
            JobKind::FollowUpQuestion => 10,
            JobKind::SectionReanalysis => 5,
            JobKind::DailyFortune | JobKind::ConsultationMessage => 0,
        }
    }

    /// Path on the analysis backend that starts a job of this kind.
    /// The status endpoint is `{start_path}/{job_id}/status`.
    pub fn backend_path(self) -> &'static str {
        match self {
            JobKind::ProfileReport => "/api/analysis/report",
            JobKind::YearlyAnalysis => "/api/analysis/yearly",
            JobKind::Compatibility => "/api/analysis/compatibility",
            JobKind::DailyFortune => "/api/daily-fortune",
            JobKind::ConsultationMessage => "/api/consultation/message",
            JobKind::FollowUpQuestion => "/api/analysis/question",
            JobKind::SectionReanalysis => "/api/analysis/reanalyze",
        }
    }

    pub fn dedup_policy(self) -> DedupPolicy {
        match self {
            JobKind::ProfileReport | JobKind::YearlyAnalysis => DedupPolicy::InFlight,
            JobKind::Compatibility | JobKind::DailyFortune => DedupPolicy::InFlightOrCompleted,
            JobKind::ConsultationMessage
            | JobKind::FollowUpQuestion
            | JobKind::SectionReanalysis => DedupPolicy::None,
        }
    }

    /// Ordered pipeline step labels for the progress bar.
    pub fn pipeline_steps(self) -> &'static [&'static str] {
        match self {
            JobKind::ProfileReport => &[
                "manseryeok",
                "jijanggan",
                "basic_analysis",
                "personality",
                "aptitude",
                "fortune",
                "scoring",
                "visualization",
                "saving",
            ],
            JobKind::YearlyAnalysis => &[
                "manseryeok",
                "yearly_overview",
                "monthly_fortune",
                "lucky_days",
                "advice",
                "saving",
            ],
            JobKind::Compatibility => &[
                "manseryeok",
                "trait_scores",
                "interactions",
                "relationship_type",
                "conflict_analysis",
                "marriage_fit",
                "saving",
            ],
            JobKind::DailyFortune => &[
                "day_calculation",
                "wunseong",
                "timing",
                "johu",
                "combination",
                "narrative",
                "saving",
            ],
            JobKind::ConsultationMessage => &["context", "answer"],
            JobKind::FollowUpQuestion => &["context", "answer"],
            JobKind::SectionReanalysis => &["section_analysis", "saving"],
        }
    }

    /// Step map with every step pending, written when a job (re)starts.
    pub fn initial_step_statuses(self) -> StepStatuses {
        self.pipeline_steps()
            .iter()
            .map(|step| (step.to_string(), StepStatus::Pending))
            .collect()
    }

    pub fn first_step(self) -> &'static str {
        self.pipeline_steps()[0]
    }

    pub fn all() -> impl Iterator<Item = JobKind> {
        JobKind::iter()
    }
}

/// Error payload stored on a failed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: None,
            retryable: true,
        }
    }

    pub fn at_step(mut self, step: Option<String>) -> Self {
        self.step = step;
        self
    }
}

/// One long-running analysis tracked in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: JobKind,
    pub subject_key: String,
    pub params: serde_json::Value,
    pub status: JobStatus,
    pub external_job_id: Option<String>,
    pub progress_percent: i32,
    pub current_step: Option<String>,
    pub step_statuses: StepStatuses,
    pub error: Option<JobError>,
    pub result: Option<serde_json::Value>,
    pub credits_used: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AnalysisJob {
    /// A failed job that already consumed credits may be restarted for free.
    pub fn is_free_retry_candidate(&self) -> bool {
        self.status == JobStatus::Failed && self.credits_used > 0
    }

    pub fn is_in_flight(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Row to insert when a job is created.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: Uuid,
    pub kind: JobKind,
    pub subject_key: String,
    pub params: serde_json::Value,
    pub credits_used: i32,
}

/// Progress relayed from the backend for a non-terminal job.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub status: JobStatus,
    pub progress_percent: i32,
    pub current_step: Option<String>,
    pub step_statuses: Option<StepStatuses>,
}

/// Clamp a backend-reported percentage into 0..=100.
pub fn clamp_progress(raw: f64) -> i32 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as i32
}
