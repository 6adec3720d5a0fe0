use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::models::job::JobKind;

/// Ledger entry types. Grants carry a `remaining` balance that is consumed
/// oldest-expiry first; `usage` and `expiry` rows only record deltas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    Subscription,
    Bonus,
    Refund,
    Usage,
    Expiry,
}

impl TransactionType {
    pub fn is_grant(self) -> bool {
        matches!(
            self,
            TransactionType::Purchase
                | TransactionType::Subscription
                | TransactionType::Bonus
                | TransactionType::Refund
        )
    }
}

/// A charge or refund against a user's balance for one job.
#[derive(Debug, Clone)]
pub struct CreditRequest {
    pub user_id: Uuid,
    pub amount: i32,
    pub kind: JobKind,
    pub job_id: Option<Uuid>,
    pub description: String,
}

impl CreditRequest {
    pub fn charge(user_id: Uuid, kind: JobKind) -> Self {
        Self {
            user_id,
            amount: kind.credit_cost(),
            kind,
            job_id: None,
            description: format!("{} analysis", kind),
        }
    }

    pub fn refund(user_id: Uuid, kind: JobKind, amount: i32, reason: &str) -> Self {
        Self {
            user_id,
            amount,
            kind,
            job_id: None,
            description: format!("refund: {}", reason),
        }
    }

    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }
}

/// Result of the atomic deduction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeductOutcome {
    Deducted { new_balance: i32 },
    Insufficient { current: i32 },
    UnknownUser,
}

/// Balance view returned by the credits endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreditSummary {
    pub current: i32,
    pub expiring_soon: i32,
    pub nearest_expiry: Option<DateTime<Utc>>,
    pub nearest_expiry_amount: i32,
}

/// Outcome of one credit expiry sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpirySummary {
    pub transactions: u64,
    pub users: u64,
    pub credits: i64,
}

/// Daily fortune access is a subscription feature with a short free trial.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    pub subscription_status: Option<String>,
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl SubscriptionState {
    pub fn is_subscribed(&self) -> bool {
        self.subscription_status.as_deref() == Some("active")
    }
}
