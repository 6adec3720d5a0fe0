use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::models::credit::{CreditRequest, CreditSummary, DeductOutcome, ExpirySummary, SubscriptionState};
use crate::models::job::{AnalysisJob, JobError, JobKind, NewJob, ProgressUpdate, StepStatuses};
use crate::models::profile::Profile;

pub mod credit_queries;
pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Profiles and analysis job rows.
///
/// State transitions (`mark_processing`, `record_progress`, `complete_job`,
/// `fail_job`) only apply to rows that are not yet terminal and return `None`
/// when the row was already completed or failed.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<Profile>, sqlx::Error>;

    async fn primary_profile(&self, user_id: Uuid) -> Result<Option<Profile>, sqlx::Error>;

    /// Most recent job for a subject, in any state.
    async fn latest_job(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error>;

    async fn latest_completed(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error>;

    /// Non-failed consultation turns of type `user_question` in a session.
    async fn count_questions(&self, user_id: Uuid, subject_key: &str) -> Result<i64, sqlx::Error>;

    async fn insert_job(&self, job: NewJob) -> Result<AnalysisJob, sqlx::Error>;

    /// Put a failed row back to `pending` for a free retry.
    async fn reset_for_retry(
        &self,
        job_id: Uuid,
        params: serde_json::Value,
        step_statuses: StepStatuses,
    ) -> Result<Option<AnalysisJob>, sqlx::Error>;

    async fn delete_job(&self, job_id: Uuid) -> Result<(), sqlx::Error>;

    /// Owner-scoped lookup.
    async fn get_job(&self, user_id: Uuid, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error>;

    async fn list_jobs(
        &self,
        user_id: Uuid,
        kind: Option<JobKind>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, sqlx::Error>;

    async fn mark_processing(
        &self,
        job_id: Uuid,
        external_job_id: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error>;

    /// Reported step states are merged into the stored map.
    async fn record_progress(
        &self,
        job_id: Uuid,
        update: &ProgressUpdate,
    ) -> Result<Option<AnalysisJob>, sqlx::Error>;

    /// Terminal success. A `None` result keeps whatever result is stored.
    async fn complete_job(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<Option<AnalysisJob>, sqlx::Error>;

    async fn fail_job(&self, job_id: Uuid, error: &JobError) -> Result<Option<AnalysisJob>, sqlx::Error>;

    /// Fail every non-terminal row last updated before `older_than`.
    async fn fail_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        error: &JobError,
    ) -> Result<Vec<AnalysisJob>, sqlx::Error>;

    async fn ping(&self) -> Result<(), sqlx::Error>;
}

/// Credit balance, ledger and subscription state.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Atomic check-and-deduct. Never leaves a negative balance.
    async fn deduct_credits(&self, request: &CreditRequest) -> Result<DeductOutcome, sqlx::Error>;

    /// Returns the balance after the refund.
    async fn refund_credits(&self, request: &CreditRequest) -> Result<i32, sqlx::Error>;

    async fn credit_summary(
        &self,
        user_id: Uuid,
        window: chrono::Duration,
    ) -> Result<CreditSummary, sqlx::Error>;

    async fn expire_credits(&self, now: DateTime<Utc>) -> Result<ExpirySummary, sqlx::Error>;

    /// Moves active subscriptions whose period ended before `now` to
    /// `expired`. Returns how many users changed.
    async fn expire_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error>;

    async fn subscription_state(&self, user_id: Uuid) -> Result<Option<SubscriptionState>, sqlx::Error>;

    async fn start_trial(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), sqlx::Error>;
}

/// PostgreSQL implementation of both stores.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
