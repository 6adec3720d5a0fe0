use axum::extract::{Query, State};
use axum::Json;
use chrono::Duration;

use crate::app_state::AppState;
use crate::auth::AuthUser;
use crate::error::ApiError;
use crate::models::credit::CreditSummary;
use crate::models::requests::{CreditCheckResponse, CreditQuery};

/// Grants expiring within this window are reported as expiring soon.
pub const EXPIRING_SOON_DAYS: i64 = 30;

pub fn credit_check(summary: CreditSummary, required: Option<i32>) -> CreditCheckResponse {
    let current = summary.current;
    let (sufficient, remaining, shortfall) = match required {
        Some(required) if current >= required => (Some(true), Some(current - required), None),
        Some(required) => (Some(false), None, Some(required - current)),
        None => (None, None, None),
    };

    CreditCheckResponse {
        current,
        required,
        sufficient,
        remaining,
        shortfall,
        expiring_soon: summary.expiring_soon,
        nearest_expiry: summary.nearest_expiry,
        nearest_expiry_amount: summary.nearest_expiry_amount,
    }
}

/// GET /api/v1/credits: balance, expiry outlook and an optional affordability check.
pub async fn get_credits(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<CreditQuery>,
) -> Result<Json<CreditCheckResponse>, ApiError> {
    if matches!(query.required, Some(r) if r < 0) {
        return Err(ApiError::Validation("required must not be negative".to_string()));
    }

    let summary = state
        .ledger
        .credit_summary(auth.user_id, Duration::days(EXPIRING_SOON_DAYS))
        .await?;
    Ok(Json(credit_check(summary, query.required)))
}
