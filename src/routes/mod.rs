use axum::extract::{FromRequest, Request};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;

use crate::app_state::AppState;
use crate::error::ApiError;

pub mod credits;
pub mod health;
pub mod jobs;
pub mod metrics;

/// JSON body extractor whose rejections use the API error format.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
        Ok(Self(value))
    }
}

/// API and health routes. The metrics endpoint and HTTP layers are added by the binary.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/profiles/{profile_id}/report", post(jobs::start_report))
        .route("/api/v1/yearly", post(jobs::start_yearly))
        .route("/api/v1/compatibility", post(jobs::start_compatibility))
        .route("/api/v1/daily-fortune", post(jobs::start_daily_fortune))
        .route(
            "/api/v1/profiles/{profile_id}/consultations/{session_id}/messages",
            post(jobs::send_consultation_message),
        )
        .route("/api/v1/profiles/{profile_id}/questions", post(jobs::ask_question))
        .route("/api/v1/profiles/{profile_id}/reanalysis", post(jobs::start_reanalysis))
        .route("/api/v1/jobs", get(jobs::list_jobs))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job_status))
        .route("/api/v1/credits", get(credits::get_credits))
        .with_state(state)
}
