use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use uuid::Uuid;

use super::ApiJson;
use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::requests::{
    CompatibilityRequest, ConsultationMessageRequest, DailyFortuneRequest, FollowUpQuestionRequest,
    JobAccepted, JobListQuery, JobStatusResponse, ReanalysisRequest, ReportRequest, YearlyRequest,
};
use crate::services::intake::JobRequest;

type Accepted = Result<(StatusCode, Json<JobAccepted>), ApiError>;

async fn submit(state: &AppState, auth: AuthUser, request: JobRequest) -> Accepted {
    let accepted = state.jobs.submit(auth.user_id, request).await?;
    // Reused terminal jobs are plain reads; anything in flight is 202.
    let code = if accepted.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((code, Json(accepted)))
}

/// POST /api/v1/profiles/{profile_id}/report
pub async fn start_report(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(profile_id): Path<Uuid>,
    ApiJson(request): ApiJson<ReportRequest>,
) -> Accepted {
    submit(&state, auth, JobRequest::Report { profile_id, request }).await
}

/// POST /api/v1/yearly
pub async fn start_yearly(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<YearlyRequest>,
) -> Accepted {
    submit(&state, auth, JobRequest::Yearly(request)).await
}

/// POST /api/v1/compatibility
pub async fn start_compatibility(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<CompatibilityRequest>,
) -> Accepted {
    submit(&state, auth, JobRequest::Compatibility(request)).await
}

/// POST /api/v1/daily-fortune
pub async fn start_daily_fortune(
    State(state): State<AppState>,
    auth: AuthUser,
    ApiJson(request): ApiJson<DailyFortuneRequest>,
) -> Accepted {
    submit(&state, auth, JobRequest::DailyFortune(request)).await
}

/// POST /api/v1/profiles/{profile_id}/consultations/{session_id}/messages
pub async fn send_consultation_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path((profile_id, session_id)): Path<(Uuid, Uuid)>,
    ApiJson(request): ApiJson<ConsultationMessageRequest>,
) -> Accepted {
    submit(
        &state,
        auth,
        JobRequest::Consultation {
            profile_id,
            session_id,
            request,
        },
    )
    .await
}

/// POST /api/v1/profiles/{profile_id}/questions
pub async fn ask_question(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(profile_id): Path<Uuid>,
    ApiJson(request): ApiJson<FollowUpQuestionRequest>,
) -> Accepted {
    submit(&state, auth, JobRequest::FollowUp { profile_id, request }).await
}

/// POST /api/v1/profiles/{profile_id}/reanalysis
pub async fn start_reanalysis(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(profile_id): Path<Uuid>,
    ApiJson(request): ApiJson<ReanalysisRequest>,
) -> Accepted {
    submit(&state, auth, JobRequest::Reanalysis { profile_id, request }).await
}

/// GET /api/v1/jobs/{job_id}: poll a job's status.
pub async fn get_job_status(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobStatusResponse>, ApiError> {
    let status = state.jobs.poll(auth.user_id, job_id).await?;
    Ok(Json(status))
}

/// GET /api/v1/jobs: the caller's recent jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<JobListQuery>,
) -> Result<Json<Vec<JobStatusResponse>>, ApiError> {
    let jobs = state.jobs.list(auth.user_id, query.kind, query.limit).await?;
    Ok(Json(jobs))
}
