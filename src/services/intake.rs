//! Per-kind request intake: ownership, prerequisites and the backend payload.

use chrono::{DateTime, Utc};
use garde::Validate;
use uuid::Uuid;

use crate::db::{CreditLedger, JobStore};
use crate::error::ApiError;
use crate::models::job::{AnalysisJob, JobKind};
use crate::models::profile::Profile;
use crate::models::requests::{
    CompatibilityRequest, ConsultationMessageRequest, DailyFortuneRequest, FollowUpQuestionRequest,
    MessageType, ReanalysisRequest, ReportRequest, YearlyRequest,
};
use crate::services::subscription::{daily_fortune_access, FortuneAccess};

/// User questions allowed per consultation session. Clarifications are free.
pub const MAX_SESSION_QUESTIONS: i64 = 5;

/// A request to start one analysis, as received from a route.
#[derive(Debug)]
pub enum JobRequest {
    Report {
        profile_id: Uuid,
        request: ReportRequest,
    },
    Yearly(YearlyRequest),
    Compatibility(CompatibilityRequest),
    DailyFortune(DailyFortuneRequest),
    Consultation {
        profile_id: Uuid,
        session_id: Uuid,
        request: ConsultationMessageRequest,
    },
    FollowUp {
        profile_id: Uuid,
        request: FollowUpQuestionRequest,
    },
    Reanalysis {
        profile_id: Uuid,
        request: ReanalysisRequest,
    },
}

/// A request that passed intake and is ready to be charged and started.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub kind: JobKind,
    pub subject_key: String,
    /// Stored on the job row.
    pub params: serde_json::Value,
    /// Sent to the backend; `params` plus whatever context the backend needs.
    pub payload: serde_json::Value,
}

pub fn report_subject(profile_id: Uuid) -> String {
    format!("profile:{profile_id}")
}

async fn owned_profile(
    store: &dyn JobStore,
    user_id: Uuid,
    profile_id: Uuid,
) -> Result<Profile, ApiError> {
    let profile = store
        .get_profile(profile_id)
        .await?
        .ok_or(ApiError::NotFound("profile"))?;
    if profile.user_id != user_id {
        return Err(ApiError::Forbidden);
    }
    Ok(profile)
}

async fn completed_report(
    store: &dyn JobStore,
    user_id: Uuid,
    profile_id: Uuid,
) -> Result<Option<AnalysisJob>, ApiError> {
    Ok(store
        .latest_completed(user_id, JobKind::ProfileReport, &report_subject(profile_id))
        .await?)
}

async fn require_report(
    store: &dyn JobStore,
    user_id: Uuid,
    profile: &Profile,
) -> Result<AnalysisJob, ApiError> {
    completed_report(store, user_id, profile.id)
        .await?
        .ok_or_else(|| ApiError::ReportRequired {
            missing: vec![profile.name.clone()],
        })
}

fn with_context(params: &serde_json::Value, key: &str, value: serde_json::Value) -> serde_json::Value {
    let mut payload = params.clone();
    if let Some(map) = payload.as_object_mut() {
        map.insert(key.to_string(), value);
    }
    payload
}

/// Validate a request and resolve everything the backend call needs.
pub async fn prepare(
    store: &dyn JobStore,
    ledger: &dyn CreditLedger,
    user_id: Uuid,
    request: JobRequest,
    now: DateTime<Utc>,
) -> Result<PreparedJob, ApiError> {
    match request {
        JobRequest::Report {
            profile_id,
            request,
        } => {
            request.validate()?;
            let kind = JobKind::ProfileReport;
            if let Some(step) = request.retry_from_step.as_deref() {
                if !kind.pipeline_steps().contains(&step) {
                    return Err(ApiError::Validation(format!("unknown pipeline step: {step}")));
                }
            }
            let profile = owned_profile(store, user_id, profile_id).await?;
            let params = serde_json::json!({
                "profile": profile.backend_payload(),
                "language": request.language,
                "retry_from_step": request.retry_from_step,
            });

            Ok(PreparedJob {
                kind,
                subject_key: report_subject(profile.id),
                payload: params.clone(),
                params,
            })
        }

        JobRequest::Yearly(request) => {
            request.validate()?;
            let profile = owned_profile(store, user_id, request.profile_id).await?;
            let params = serde_json::json!({
                "profile": profile.backend_payload(),
                "target_year": request.target_year,
                "language": request.language,
            });

            Ok(PreparedJob {
                kind: JobKind::YearlyAnalysis,
                subject_key: format!("yearly:{}:{}", profile.id, request.target_year),
                payload: params.clone(),
                params,
            })
        }

        JobRequest::Compatibility(request) => {
            request.validate()?;
            let profile_a = owned_profile(store, user_id, request.profile_id_a).await?;
            let profile_b = owned_profile(store, user_id, request.profile_id_b).await?;

            let mut missing = Vec::new();
            for profile in [&profile_a, &profile_b] {
                if completed_report(store, user_id, profile.id).await?.is_none() {
                    missing.push(profile.name.clone());
                }
            }
            if !missing.is_empty() {
                return Err(ApiError::ReportRequired { missing });
            }

            let params = serde_json::json!({
                "profile_a": profile_a.backend_payload(),
                "profile_b": profile_b.backend_payload(),
                "analysis_type": request.analysis_type,
                "language": request.language,
            });

            Ok(PreparedJob {
                kind: JobKind::Compatibility,
                subject_key: format!(
                    "compat:{}:{}:{}",
                    profile_a.id, profile_b.id, request.analysis_type
                ),
                payload: params.clone(),
                params,
            })
        }

        JobRequest::DailyFortune(request) => {
            request.validate()?;
            let profile = match request.profile_id {
                Some(id) => owned_profile(store, user_id, id).await?,
                None => store
                    .primary_profile(user_id)
                    .await?
                    .ok_or(ApiError::NotFound("profile"))?,
            };

            let state = ledger
                .subscription_state(user_id)
                .await?
                .ok_or(ApiError::NotFound("user"))?;
            let access = daily_fortune_access(&state, now);
            if !access.is_allowed() {
                return Err(ApiError::SubscriptionRequired {
                    can_start_trial: false,
                });
            }
            if access == FortuneAccess::StartTrial {
                ledger.start_trial(user_id, now).await?;
                tracing::info!(user_id = %user_id, "Daily fortune trial started");
            }

            let report = require_report(store, user_id, &profile).await?;
            let fortune_date = now.date_naive();
            let params = serde_json::json!({
                "profile": profile.backend_payload(),
                "fortune_date": fortune_date,
                "language": request.language,
                "report_job_id": report.id,
            });

            Ok(PreparedJob {
                kind: JobKind::DailyFortune,
                subject_key: format!("daily:{}:{}", profile.id, fortune_date),
                payload: with_context(&params, "report", report.result.unwrap_or_default()),
                params,
            })
        }

        JobRequest::Consultation {
            profile_id,
            session_id,
            request,
        } => {
            request.validate()?;
            let profile = owned_profile(store, user_id, profile_id).await?;
            let report = require_report(store, user_id, &profile).await?;

            let subject_key = format!("session:{session_id}");
            if request.message_type == MessageType::UserQuestion {
                let asked = store.count_questions(user_id, &subject_key).await?;
                if asked >= MAX_SESSION_QUESTIONS {
                    return Err(ApiError::QuestionLimit {
                        limit: MAX_SESSION_QUESTIONS,
                    });
                }
            }

            let params = serde_json::json!({
                "profile": profile.backend_payload(),
                "session_id": session_id,
                "content": request.content,
                "message_type": request.message_type,
                "skip_clarification": request.skip_clarification,
            });

            Ok(PreparedJob {
                kind: JobKind::ConsultationMessage,
                subject_key,
                payload: with_context(&params, "report", report.result.unwrap_or_default()),
                params,
            })
        }

        JobRequest::FollowUp {
            profile_id,
            request,
        } => {
            request.validate()?;
            let profile = owned_profile(store, user_id, profile_id).await?;
            let report = require_report(store, user_id, &profile).await?;
            let params = serde_json::json!({
                "profile": profile.backend_payload(),
                "question": request.question,
                "report_job_id": report.id,
            });

            Ok(PreparedJob {
                kind: JobKind::FollowUpQuestion,
                subject_key: format!("question:{}", profile.id),
                payload: with_context(&params, "report", report.result.unwrap_or_default()),
                params,
            })
        }

        JobRequest::Reanalysis {
            profile_id,
            request,
        } => {
            request.validate()?;
            let profile = owned_profile(store, user_id, profile_id).await?;
            let report = require_report(store, user_id, &profile).await?;
            let params = serde_json::json!({
                "profile": profile.backend_payload(),
                "section": request.section,
                "report_job_id": report.id,
            });

            Ok(PreparedJob {
                kind: JobKind::SectionReanalysis,
                subject_key: format!("reanalysis:{}:{}", profile.id, request.section),
                payload: with_context(&params, "report", report.result.unwrap_or_default()),
                params,
            })
        }
    }
}
