use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::services::backend::BackendError;

/// Errors surfaced by the HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthorized,

    #[error("access denied")]
    Forbidden,

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("insufficient credits: {required} required, {current} available")]
    InsufficientCredits { required: i32, current: i32 },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("a completed report is required first")]
    ReportRequired { missing: Vec<String> },

    #[error("question limit reached for this session")]
    QuestionLimit { limit: i64 },

    #[error("subscription required")]
    SubscriptionRequired { can_start_trial: bool },

    #[error("analysis service error: {0}")]
    ExternalService(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<serde_json::Value>,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden | ApiError::SubscriptionRequired { .. } => StatusCode::FORBIDDEN,
            ApiError::Validation(_)
            | ApiError::ReportRequired { .. }
            | ApiError::QuestionLimit { .. } => StatusCode::BAD_REQUEST,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::ExternalService(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code; clients translate these for display.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "AUTH_UNAUTHORIZED",
            ApiError::Forbidden => "AUTH_FORBIDDEN",
            ApiError::Validation(_) => "VALIDATION_INVALID_INPUT",
            ApiError::InsufficientCredits { .. } => "CREDIT_INSUFFICIENT",
            ApiError::NotFound(_) => "API_NOT_FOUND",
            ApiError::ReportRequired { .. } => "ANALYSIS_REPORT_REQUIRED",
            ApiError::QuestionLimit { .. } => "CONSULTATION_QUESTION_LIMIT",
            ApiError::SubscriptionRequired { .. } => "SUBSCRIPTION_REQUIRED",
            ApiError::ExternalService(_) => "API_EXTERNAL_SERVICE_ERROR",
            ApiError::Internal(_) => "API_SERVER_ERROR",
        }
    }

    fn context(&self) -> Option<serde_json::Value> {
        match self {
            ApiError::InsufficientCredits { required, current } => {
                Some(serde_json::json!({ "required": required, "current": current }))
            }
            ApiError::ReportRequired { missing } => {
                Some(serde_json::json!({ "missing_profiles": missing }))
            }
            ApiError::QuestionLimit { limit } => Some(serde_json::json!({ "limit": limit })),
            ApiError::SubscriptionRequired { can_start_trial } => {
                Some(serde_json::json!({ "can_start_trial": can_start_trial }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal details stay in the logs.
        let message = match &self {
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "Request failed with internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            code: self.code(),
            message,
            context: self.context(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(format!("database: {err}"))
    }
}

impl From<BackendError> for ApiError {
    fn from(err: BackendError) -> Self {
        ApiError::ExternalService(err.to_string())
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}
