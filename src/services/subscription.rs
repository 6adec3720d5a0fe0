use chrono::{DateTime, Duration, Utc};

use crate::models::credit::SubscriptionState;

/// Length of the daily fortune free trial.
pub const TRIAL_DAYS: i64 = 3;

/// Whether a user may request a daily fortune right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FortuneAccess {
    Subscribed,
    Trial { days_remaining: i64 },
    /// No trial yet; the request that sees this starts one.
    StartTrial,
    Expired,
}

impl FortuneAccess {
    pub fn is_allowed(self) -> bool {
        !matches!(self, FortuneAccess::Expired)
    }
}

pub fn trial_ends_at(started_at: DateTime<Utc>) -> DateTime<Utc> {
    started_at + Duration::days(TRIAL_DAYS)
}

pub fn daily_fortune_access(state: &SubscriptionState, now: DateTime<Utc>) -> FortuneAccess {
    if state.is_subscribed() {
        return FortuneAccess::Subscribed;
    }

    match state.trial_started_at {
        None => FortuneAccess::StartTrial,
        Some(started) => {
            let ends = trial_ends_at(started);
            if now >= ends {
                return FortuneAccess::Expired;
            }
            // Partial days count as a full day left.
            let secs = (ends - now).num_seconds();
            FortuneAccess::Trial {
                days_remaining: (secs + 86_399) / 86_400,
            }
        }
    }
}
