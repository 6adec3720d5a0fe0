use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::db::{CreditLedger, JobStore};
use crate::error::ApiError;
use crate::models::credit::{CreditRequest, DeductOutcome};
use crate::models::job::{
    clamp_progress, AnalysisJob, DedupPolicy, JobError, JobKind, JobStatus, NewJob, ProgressUpdate,
};
use crate::models::requests::{JobAccepted, JobStatusResponse};
use crate::services::backend::{AnalysisBackend, BackendError, BackendJobStatus};
use crate::services::intake::{self, JobRequest, PreparedJob};

pub const DEFAULT_LIST_LIMIT: i64 = 20;
pub const MAX_LIST_LIMIT: i64 = 100;

const STALE_MESSAGE: &str = "connection to the analysis service was lost";
const ABANDONED_MESSAGE: &str = "analysis was abandoned without a final status";

/// What the status poller learned from the backend.
#[derive(Debug, Clone)]
pub enum BackendObservation {
    Reported(BackendJobStatus),
    /// Transport failure, 404, or no external job id to ask about.
    Unavailable,
}

/// Decision taken for a non-terminal job after asking the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciliation {
    Complete(Option<serde_json::Value>),
    Fail(JobError),
    Progress(ProgressUpdate),
    Stale(JobError),
    Unchanged,
}

/// Decide how a non-terminal job row changes given the backend's answer.
pub fn reconcile(
    job: &AnalysisJob,
    observation: &BackendObservation,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> Reconciliation {
    match observation {
        BackendObservation::Reported(status) => match status.job_status() {
            JobStatus::Completed => Reconciliation::Complete(status.result.clone()),
            JobStatus::Failed => {
                let message = status
                    .error_message()
                    .unwrap_or_else(|| "analysis failed".to_string());
                let step = status.error_step().or_else(|| {
                    status.current_step.clone().or_else(|| job.current_step.clone())
                });
                Reconciliation::Fail(JobError::new(message).at_step(step))
            }
            JobStatus::Pending | JobStatus::Processing => {
                Reconciliation::Progress(ProgressUpdate {
                    // The backend has the job once it reports on it.
                    status: JobStatus::Processing,
                    progress_percent: status
                        .progress_percent
                        .map(clamp_progress)
                        .unwrap_or(job.progress_percent),
                    current_step: status.current_step.clone(),
                    step_statuses: status.steps(),
                })
            }
        },
        BackendObservation::Unavailable => {
            if now - job.updated_at > stale_after {
                Reconciliation::Stale(JobError::new(STALE_MESSAGE).at_step(job.current_step.clone()))
            } else {
                Reconciliation::Unchanged
            }
        }
    }
}

/// Orchestrates job initiation and status polling for every job kind.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    ledger: Arc<dyn CreditLedger>,
    backend: Arc<dyn AnalysisBackend>,
    stale_after: Duration,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        ledger: Arc<dyn CreditLedger>,
        backend: Arc<dyn AnalysisBackend>,
        stale_after: std::time::Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            backend,
            stale_after: Duration::from_std(stale_after).unwrap_or_else(|_| Duration::minutes(5)),
        }
    }

    /// Intake plus initiation.
    pub async fn submit(&self, user_id: Uuid, request: JobRequest) -> Result<JobAccepted, ApiError> {
        let prepared = intake::prepare(
            self.store.as_ref(),
            self.ledger.as_ref(),
            user_id,
            request,
            Utc::now(),
        )
        .await?;
        self.initiate(user_id, prepared).await
    }

    pub async fn initiate(&self, user_id: Uuid, prepared: PreparedJob) -> Result<JobAccepted, ApiError> {
        let kind = prepared.kind;
        let policy = kind.dedup_policy();

        let mut retry_row = None;
        if policy != DedupPolicy::None {
            if let Some(existing) = self
                .store
                .latest_job(user_id, kind, &prepared.subject_key)
                .await?
            {
                if existing.is_in_flight() {
                    tracing::info!(job_id = %existing.id, kind = %kind, "Returning in-flight job");
                    return Ok(accepted(&existing, "analysis already in progress", 0, false));
                }
                if existing.status == JobStatus::Completed && policy == DedupPolicy::InFlightOrCompleted {
                    return Ok(accepted(&existing, "analysis already completed", 0, false));
                }
                if existing.is_free_retry_candidate() {
                    retry_row = Some(existing);
                }
            }
        }

        let free_retry = retry_row.is_some();
        let (job, charged) = match retry_row {
            Some(failed) => {
                let job = self
                    .store
                    .reset_for_retry(failed.id, prepared.params.clone(), kind.initial_step_statuses())
                    .await?
                    .ok_or_else(|| ApiError::Internal(format!("job {} changed during retry", failed.id)))?;
                tracing::info!(job_id = %job.id, kind = %kind, user_id = %user_id, "Free retry of failed job");
                (job, 0)
            }
            None => self.charge_and_insert(user_id, &prepared).await?,
        };

        let mut payload = prepared.payload;
        if let Some(map) = payload.as_object_mut() {
            map.insert("job_id".to_string(), serde_json::json!(job.id));
        }

        match self.backend.start_job(kind, &payload).await {
            Ok(external_id) => {
                let job = match self.store.mark_processing(job.id, &external_id).await? {
                    Some(updated) => updated,
                    None => job,
                };
                metrics::counter!("analysis_jobs_started_total", "kind" => kind.to_string()).increment(1);
                tracing::info!(
                    job_id = %job.id,
                    kind = %kind,
                    user_id = %user_id,
                    external_job_id = %external_id,
                    credits_used = charged,
                    "Analysis job started"
                );
                Ok(accepted(&job, "analysis started", charged, free_retry))
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, kind = %kind, error = %err, "Backend failed to start job");
                metrics::counter!("analysis_jobs_failed_total", "kind" => kind.to_string()).increment(1);
                self.roll_back_start(&job, charged, &err).await;
                Err(ApiError::ExternalService(err.to_string()))
            }
        }
    }

    async fn charge_and_insert(
        &self,
        user_id: Uuid,
        prepared: &PreparedJob,
    ) -> Result<(AnalysisJob, i32), ApiError> {
        let kind = prepared.kind;
        let cost = kind.credit_cost();

        if cost > 0 {
            match self.ledger.deduct_credits(&CreditRequest::charge(user_id, kind)).await? {
                DeductOutcome::Deducted { new_balance } => {
                    tracing::debug!(user_id = %user_id, cost, new_balance, "Credits deducted");
                }
                DeductOutcome::Insufficient { current } => {
                    return Err(ApiError::InsufficientCredits {
                        required: cost,
                        current,
                    })
                }
                DeductOutcome::UnknownUser => return Err(ApiError::NotFound("user")),
            }
        }

        let new_job = NewJob {
            user_id,
            kind,
            subject_key: prepared.subject_key.clone(),
            params: prepared.params.clone(),
            credits_used: cost,
        };
        match self.store.insert_job(new_job).await {
            Ok(job) => Ok((job, cost)),
            Err(err) => {
                if cost > 0 {
                    let refund = CreditRequest::refund(user_id, kind, cost, "job creation failed");
                    if let Err(refund_err) = self.ledger.refund_credits(&refund).await {
                        tracing::error!(user_id = %user_id, error = %refund_err, "Refund after failed insert failed");
                    } else {
                        metrics::counter!("credits_refunded_total").increment(cost as u64);
                    }
                }
                Err(err.into())
            }
        }
    }

    /// Undo a job whose backend start failed. A charged job is refunded and
    /// removed; if the refund fails the row is kept as failed so the next
    /// request becomes a free retry.
    async fn roll_back_start(&self, job: &AnalysisJob, charged: i32, err: &BackendError) {
        let error = JobError::new(format!("failed to start analysis: {err}"));

        if charged > 0 {
            let refund = CreditRequest::refund(job.user_id, job.kind, charged, "analysis start failed")
                .for_job(job.id);
            match self.ledger.refund_credits(&refund).await {
                Ok(balance) => {
                    metrics::counter!("credits_refunded_total").increment(charged as u64);
                    tracing::info!(job_id = %job.id, refunded = charged, balance, "Credits refunded");
                }
                Err(refund_err) => {
                    tracing::error!(job_id = %job.id, error = %refund_err, "Refund failed, keeping job as failed");
                    if let Err(e) = self.store.fail_job(job.id, &error).await {
                        tracing::error!(job_id = %job.id, error = %e, "Failed to mark job failed");
                    }
                    return;
                }
            }
        }

        let cleanup = if job.credits_used > 0 && charged == 0 {
            // Free retry: nothing was charged, the row stays as a failed attempt.
            self.store.fail_job(job.id, &error).await.map(|_| ())
        } else {
            self.store.delete_job(job.id).await
        };
        if let Err(e) = cleanup {
            tracing::error!(job_id = %job.id, error = %e, "Failed to clean up job after start failure");
        }
    }

    /// Owner-scoped status poll.
    pub async fn poll(&self, user_id: Uuid, job_id: Uuid) -> Result<JobStatusResponse, ApiError> {
        let job = self
            .store
            .get_job(user_id, job_id)
            .await?
            .ok_or(ApiError::NotFound("job"))?;

        if job.status.is_terminal() {
            return Ok(job.into());
        }

        let observation = match job.external_job_id.as_deref() {
            None => BackendObservation::Unavailable,
            Some(external_id) => match self.backend.job_status(job.kind, external_id).await {
                Ok(status) => BackendObservation::Reported(status),
                Err(BackendError::NotFound) => {
                    tracing::warn!(job_id = %job.id, external_job_id = %external_id, "Backend does not know job");
                    BackendObservation::Unavailable
                }
                Err(err) => {
                    tracing::warn!(job_id = %job.id, error = %err, "Backend status check failed");
                    BackendObservation::Unavailable
                }
            },
        };

        let updated = match reconcile(&job, &observation, Utc::now(), self.stale_after) {
            Reconciliation::Unchanged => Some(job.clone()),
            Reconciliation::Progress(update) => self.store.record_progress(job.id, &update).await?,
            Reconciliation::Complete(result) => {
                let done = self.store.complete_job(job.id, result).await?;
                if done.is_some() {
                    metrics::counter!("analysis_jobs_completed_total", "kind" => job.kind.to_string())
                        .increment(1);
                    tracing::info!(job_id = %job.id, kind = %job.kind, "Analysis job completed");
                }
                done
            }
            Reconciliation::Fail(error) => {
                let failed = self.store.fail_job(job.id, &error).await?;
                if let Some(lost) = &failed {
                    metrics::counter!("analysis_jobs_failed_total", "kind" => job.kind.to_string())
                        .increment(1);
                    tracing::warn!(job_id = %job.id, kind = %job.kind, error = %error.message, "Analysis job failed");
                    self.compensate_failure(lost).await;
                }
                failed
            }
            Reconciliation::Stale(error) => {
                let failed = self.store.fail_job(job.id, &error).await?;
                if let Some(stale) = &failed {
                    metrics::counter!("analysis_jobs_stale_total", "kind" => job.kind.to_string())
                        .increment(1);
                    tracing::warn!(job_id = %job.id, kind = %job.kind, "Stale job marked failed");
                    self.compensate_failure(stale).await;
                }
                failed
            }
        };

        // `None` means another poller finished the row first.
        let job = match updated {
            Some(job) => job,
            None => self
                .store
                .get_job(user_id, job_id)
                .await?
                .ok_or(ApiError::NotFound("job"))?,
        };

        let mut response = JobStatusResponse::from(job);
        if let BackendObservation::Reported(status) = &observation {
            if !response.status.is_terminal() {
                response.estimated_seconds_remaining = status.estimated_seconds();
            }
        }
        Ok(response)
    }

    pub async fn list(
        &self,
        user_id: Uuid,
        kind: Option<JobKind>,
        limit: Option<i64>,
    ) -> Result<Vec<JobStatusResponse>, ApiError> {
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
        let jobs = self.store.list_jobs(user_id, kind, limit).await?;
        Ok(jobs.into_iter().map(JobStatusResponse::from).collect())
    }

    /// Fail jobs nobody has polled to a terminal state. Returns how many.
    pub async fn sweep_abandoned(&self, threshold: std::time::Duration) -> Result<usize, sqlx::Error> {
        let threshold = Duration::from_std(threshold).unwrap_or_else(|_| Duration::minutes(30));
        let failed = self
            .store
            .fail_stale_jobs(Utc::now() - threshold, &JobError::new(ABANDONED_MESSAGE))
            .await?;

        for job in &failed {
            metrics::counter!("analysis_jobs_stale_total", "kind" => job.kind.to_string()).increment(1);
            tracing::warn!(job_id = %job.id, kind = %job.kind, "Abandoned job marked failed");
            self.compensate_failure(job).await;
        }
        Ok(failed.len())
    }

    /// Kinds without a free-retry path get their credits back when their
    /// job fails, whether the backend reported it or it went stale.
    async fn compensate_failure(&self, job: &AnalysisJob) {
        if job.kind.dedup_policy() != DedupPolicy::None || job.credits_used <= 0 {
            return;
        }
        let refund = CreditRequest::refund(job.user_id, job.kind, job.credits_used, "analysis lost")
            .for_job(job.id);
        match self.ledger.refund_credits(&refund).await {
            Ok(_) => metrics::counter!("credits_refunded_total").increment(job.credits_used as u64),
            Err(e) => tracing::error!(job_id = %job.id, error = %e, "Refund for failed job failed"),
        }
    }
}

fn accepted(job: &AnalysisJob, message: &str, credits_used: i32, free_retry: bool) -> JobAccepted {
    JobAccepted {
        job_id: job.id,
        kind: job.kind,
        status: job.status,
        poll_url: format!("/api/v1/jobs/{}", job.id),
        message: message.to_string(),
        credits_used,
        free_retry,
    }
}
