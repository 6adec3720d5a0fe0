use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{CreditLedger, PgStore};
use crate::models::credit::{
    CreditRequest, CreditSummary, DeductOutcome, ExpirySummary, SubscriptionState, TransactionType,
};

#[async_trait]
impl CreditLedger for PgStore {
    async fn deduct_credits(&self, request: &CreditRequest) -> Result<DeductOutcome, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT success, new_credits, error_message
            FROM deduct_credits_fifo($1, $2, $3, $4, $5)
            "#,
        )
        .bind(request.user_id)
        .bind(request.amount)
        .bind(request.kind.as_ref())
        .bind(request.job_id)
        .bind(&request.description)
        .fetch_one(&self.pool)
        .await?;

        let success: bool = row.try_get("success")?;
        let new_credits: i32 = row.try_get("new_credits")?;
        let error_message: Option<String> = row.try_get("error_message")?;

        Ok(match (success, error_message.as_deref()) {
            (true, _) => DeductOutcome::Deducted {
                new_balance: new_credits,
            },
            (false, Some("user_not_found")) => DeductOutcome::UnknownUser,
            (false, _) => DeductOutcome::Insufficient {
                current: new_credits,
            },
        })
    }

    async fn refund_credits(&self, request: &CreditRequest) -> Result<i32, sqlx::Error> {
        // The deduction function records a refund grant for negative amounts.
        let row = sqlx::query(
            r#"
            SELECT success, new_credits
            FROM deduct_credits_fifo($1, $2, $3, $4, $5)
            "#,
        )
        .bind(request.user_id)
        .bind(-request.amount.abs())
        .bind(request.kind.as_ref())
        .bind(request.job_id)
        .bind(&request.description)
        .fetch_one(&self.pool)
        .await?;

        let success: bool = row.try_get("success")?;
        if !success {
            return Err(sqlx::Error::RowNotFound);
        }
        row.try_get("new_credits")
    }

    async fn credit_summary(
        &self,
        user_id: Uuid,
        window: chrono::Duration,
    ) -> Result<CreditSummary, sqlx::Error> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            WITH grants AS (
                SELECT remaining, expires_at
                FROM credit_transactions
                WHERE user_id = $1
                  AND remaining > 0
                  AND expires_at IS NOT NULL
                  AND expires_at > $2
            ),
            nearest AS (
                SELECT MIN(expires_at) AS at FROM grants
            )
            SELECT
                (SELECT credits FROM users WHERE id = $1) AS current,
                COALESCE((SELECT SUM(remaining) FROM grants WHERE expires_at <= $3), 0)::INT4
                    AS expiring_soon,
                (SELECT at FROM nearest) AS nearest_expiry,
                COALESCE((
                    SELECT SUM(g.remaining) FROM grants g, nearest n WHERE g.expires_at = n.at
                ), 0)::INT4 AS nearest_expiry_amount
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now + window)
        .fetch_one(&self.pool)
        .await?;

        let current: Option<i32> = row.try_get("current")?;
        Ok(CreditSummary {
            current: current.unwrap_or(0),
            expiring_soon: row.try_get("expiring_soon")?,
            nearest_expiry: row.try_get("nearest_expiry")?,
            nearest_expiry_amount: row.try_get("nearest_expiry_amount")?,
        })
    }

    async fn expire_credits(&self, now: DateTime<Utc>) -> Result<ExpirySummary, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let candidates: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT user_id
            FROM credit_transactions
            WHERE remaining > 0
              AND expires_at IS NOT NULL
              AND expires_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(ExpirySummary::default());
        }

        // Users before grants, the same order deduct_credits_fifo locks in.
        let users: Vec<Uuid> = sqlx::query_scalar(
            "SELECT id FROM users WHERE id = ANY($1) ORDER BY id FOR UPDATE",
        )
        .bind(&candidates)
        .fetch_all(&mut *tx)
        .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, user_id, remaining
            FROM credit_transactions
            WHERE user_id = ANY($1)
              AND remaining > 0
              AND expires_at IS NOT NULL
              AND expires_at <= $2
            FOR UPDATE
            "#,
        )
        .bind(&users)
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            tx.commit().await?;
            return Ok(ExpirySummary::default());
        }

        let mut grant_ids = Vec::with_capacity(rows.len());
        let mut per_user: HashMap<Uuid, i64> = HashMap::new();
        for row in &rows {
            let id: Uuid = row.try_get("id")?;
            let user_id: Uuid = row.try_get("user_id")?;
            let remaining: i32 = row.try_get("remaining")?;
            grant_ids.push(id);
            *per_user.entry(user_id).or_default() += i64::from(remaining);
        }

        sqlx::query("UPDATE credit_transactions SET remaining = 0 WHERE id = ANY($1)")
            .bind(&grant_ids)
            .execute(&mut *tx)
            .await?;

        let mut total = 0i64;
        for (user_id, expired) in &per_user {
            // Cached balance is re-derived from the unexpired grants.
            let balance: i32 = sqlx::query(
                r#"
                UPDATE users
                SET credits = COALESCE((
                        SELECT SUM(remaining)
                        FROM credit_transactions
                        WHERE user_id = $1
                          AND remaining > 0
                          AND (expires_at IS NULL OR expires_at > $2)
                    ), 0),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING credits
                "#,
            )
            .bind(user_id)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?
            .try_get("credits")?;

            sqlx::query(
                r#"
                INSERT INTO credit_transactions
                    (user_id, type, amount, balance_after, description)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(user_id)
            .bind(TransactionType::Expiry.as_ref())
            .bind(-(*expired as i32))
            .bind(balance)
            .bind(format!("{expired} credits expired"))
            .execute(&mut *tx)
            .await?;

            total += expired;
        }

        tx.commit().await?;

        Ok(ExpirySummary {
            transactions: grant_ids.len() as u64,
            users: per_user.len() as u64,
            credits: total,
        })
    }

    async fn expire_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE users
            SET subscription_status = 'expired', updated_at = NOW()
            WHERE subscription_status = 'active'
              AND subscription_period_end IS NOT NULL
              AND subscription_period_end < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn subscription_state(&self, user_id: Uuid) -> Result<Option<SubscriptionState>, sqlx::Error> {
        let row = sqlx::query(
            "SELECT subscription_status, daily_fortune_trial_started_at FROM users WHERE id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok::<_, sqlx::Error>(SubscriptionState {
                subscription_status: r.try_get("subscription_status")?,
                trial_started_at: r.try_get("daily_fortune_trial_started_at")?,
            })
        })
        .transpose()
    }

    async fn start_trial(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET daily_fortune_trial_started_at = $2, updated_at = NOW()
            WHERE id = $1 AND daily_fortune_trial_started_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
