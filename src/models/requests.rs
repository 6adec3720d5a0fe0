use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use uuid::Uuid;

use crate::models::job::{AnalysisJob, JobError, JobKind, JobStatus, StepStatuses};

/// Narrative language forwarded to the backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Language {
    #[default]
    #[serde(rename = "ko")]
    Korean,
    #[serde(rename = "en")]
    English,
    #[serde(rename = "ja")]
    Japanese,
    #[serde(rename = "zh-CN")]
    ChineseSimplified,
    #[serde(rename = "zh-TW")]
    ChineseTraditional,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelationshipType {
    #[default]
    Romance,
    Friend,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageType {
    #[default]
    UserQuestion,
    UserClarification,
}

/// Report sections that can be regenerated on their own.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReportSection {
    Personality,
    Aptitude,
    Fortune,
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct ReportRequest {
    #[garde(length(min = 1, max = 50))]
    pub retry_from_step: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub language: Language,
}

#[derive(Debug, Deserialize, Validate)]
pub struct YearlyRequest {
    #[garde(skip)]
    pub profile_id: Uuid,

    #[garde(range(min = 2000, max = 2100))]
    pub target_year: i32,

    #[serde(default)]
    #[garde(skip)]
    pub language: Language,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompatibilityRequest {
    #[garde(skip)]
    pub profile_id_a: Uuid,

    #[garde(custom(distinct_from(&self.profile_id_a)))]
    pub profile_id_b: Uuid,

    #[serde(default)]
    #[garde(skip)]
    pub analysis_type: RelationshipType,

    #[serde(default)]
    #[garde(skip)]
    pub language: Language,
}

fn distinct_from(other: &Uuid) -> impl FnOnce(&Uuid, &()) -> garde::Result + '_ {
    move |value, _| {
        if value == other {
            return Err(garde::Error::new("select two different profiles"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct DailyFortuneRequest {
    /// Defaults to the caller's primary profile.
    #[garde(skip)]
    pub profile_id: Option<Uuid>,

    #[serde(default)]
    #[garde(skip)]
    pub language: Language,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ConsultationMessageRequest {
    #[garde(length(chars, min = 1, max = 500))]
    pub content: String,

    #[serde(default)]
    #[garde(skip)]
    pub message_type: MessageType,

    #[serde(default)]
    #[garde(skip)]
    pub skip_clarification: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FollowUpQuestionRequest {
    #[garde(length(chars, min = 1, max = 500))]
    pub question: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReanalysisRequest {
    #[garde(skip)]
    pub section: ReportSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct JobListQuery {
    pub kind: Option<JobKind>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreditQuery {
    pub required: Option<i32>,
}

/// Response after a job has been accepted (or an existing one reused).
#[derive(Debug, Serialize, Deserialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub poll_url: String,
    pub message: String,
    pub credits_used: i32,
    pub free_retry: bool,
}

/// Normalized status payload returned by the status poller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub progress_percent: i32,
    pub current_step: Option<String>,
    pub step_statuses: StepStatuses,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Backend estimate from the poll that produced this response. Never stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_seconds_remaining: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<AnalysisJob> for JobStatusResponse {
    fn from(job: AnalysisJob) -> Self {
        // Results are only embedded once the job is done; errors only on failure.
        let result = match job.status {
            JobStatus::Completed => job.result,
            _ => None,
        };
        let error = match job.status {
            JobStatus::Failed => Some(
                job.error
                    .unwrap_or_else(|| JobError::new("analysis failed")),
            ),
            _ => None,
        };
        let progress_percent = match job.status {
            JobStatus::Completed => 100,
            _ => job.progress_percent,
        };

        Self {
            job_id: job.id,
            kind: job.kind,
            status: job.status,
            progress_percent,
            current_step: job.current_step,
            step_statuses: job.step_statuses,
            result,
            error,
            estimated_seconds_remaining: None,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Response for `GET /api/v1/credits`.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct CreditCheckResponse {
    pub current: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sufficient: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shortfall: Option<i32>,
    pub expiring_soon: i32,
    pub nearest_expiry: Option<DateTime<Utc>>,
    pub nearest_expiry_amount: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_requires_distinct_profiles() {
        let id = Uuid::new_v4();
        let same = CompatibilityRequest {
            profile_id_a: id,
            profile_id_b: id,
            analysis_type: RelationshipType::Romance,
            language: Language::Korean,
        };
        assert!(same.validate().is_err());

        let different = CompatibilityRequest {
            profile_id_b: Uuid::new_v4(),
            ..same
        };
        assert!(different.validate().is_ok());
    }

    #[test]
    fn test_yearly_target_year_range() {
        let req: YearlyRequest = serde_json::from_value(serde_json::json!({
            "profile_id": Uuid::new_v4(),
            "target_year": 1999,
        }))
        .unwrap();
        assert!(req.validate().is_err());
        assert_eq!(req.language, Language::Korean);
    }

    #[test]
    fn test_message_length_counts_characters() {
        let korean = "운".repeat(500);
        let ok = FollowUpQuestionRequest { question: korean };
        assert!(ok.validate().is_ok());

        let too_long = FollowUpQuestionRequest {
            question: "운".repeat(501),
        };
        assert!(too_long.validate().is_err());
    }

    #[test]
    fn test_language_codes() {
        let lang: Language = serde_json::from_str("\"zh-TW\"").unwrap();
        assert_eq!(lang, Language::ChineseTraditional);
        assert!(serde_json::from_str::<Language>("\"fr\"").is_err());
    }
}
