//! Test helpers: an in-memory store, a scripted analysis backend and a
//! router harness driven with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use saju_gateway::app_state::AppState;
use saju_gateway::auth::AuthKeys;
use saju_gateway::db::{CreditLedger, JobStore};
use saju_gateway::models::credit::{
    CreditRequest, CreditSummary, DeductOutcome, ExpirySummary, SubscriptionState,
};
use saju_gateway::models::job::{
    AnalysisJob, JobError, JobKind, JobStatus, NewJob, ProgressUpdate, StepStatus, StepStatuses,
};
use saju_gateway::models::profile::Profile;
use saju_gateway::routes;
use saju_gateway::services::backend::{AnalysisBackend, BackendError, BackendJobStatus};

pub const STALE_AFTER_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct UserRow {
    pub credits: i32,
    pub subscription_status: Option<String>,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub subscription_period_end: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, UserRow>,
    profiles: HashMap<Uuid, Profile>,
    jobs: Vec<AnalysisJob>,
}

/// In-memory `JobStore` + `CreditLedger` with the same conditional-update
/// rules as the Postgres store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn add_user(&self, credits: i32) -> Uuid {
        let id = Uuid::new_v4();
        self.inner.lock().unwrap().users.insert(
            id,
            UserRow {
                credits,
                subscription_status: None,
                trial_started_at: None,
                subscription_period_end: None,
            },
        );
        id
    }

    pub fn add_profile(&self, user_id: Uuid, name: &str) -> Profile {
        let profile = Profile {
            id: Uuid::new_v4(),
            user_id,
            name: name.to_string(),
            gender: "female".to_string(),
            birth_date: NaiveDate::from_ymd_opt(1990, 3, 15).unwrap(),
            birth_time: Some("09:30".to_string()),
            calendar_type: "solar".to_string(),
            is_primary: true,
            created_at: Utc::now(),
        };
        self.inner
            .lock()
            .unwrap()
            .profiles
            .insert(profile.id, profile.clone());
        profile
    }

    /// Insert a job row directly in the given state.
    pub fn seed_job(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
        status: JobStatus,
        credits_used: i32,
    ) -> AnalysisJob {
        let now = Utc::now();
        let job = AnalysisJob {
            id: Uuid::new_v4(),
            user_id,
            kind,
            subject_key: subject_key.to_string(),
            params: serde_json::json!({}),
            status,
            external_job_id: Some(format!("seeded-{}", Uuid::new_v4())),
            progress_percent: if status == JobStatus::Completed { 100 } else { 0 },
            current_step: None,
            step_statuses: kind.initial_step_statuses(),
            error: (status == JobStatus::Failed).then(|| JobError::new("seeded failure")),
            result: (status == JobStatus::Completed).then(|| serde_json::json!({"summary": "seeded"})),
            credits_used,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().jobs.push(job.clone());
        job
    }

    pub fn add_completed_report(&self, user_id: Uuid, profile_id: Uuid) -> AnalysisJob {
        self.seed_job(
            user_id,
            JobKind::ProfileReport,
            &format!("profile:{profile_id}"),
            JobStatus::Completed,
            50,
        )
    }

    pub fn balance(&self, user_id: Uuid) -> i32 {
        self.inner.lock().unwrap().users[&user_id].credits
    }

    pub fn job(&self, job_id: Uuid) -> Option<AnalysisJob> {
        self.inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == job_id)
            .cloned()
    }

    pub fn job_count(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    /// Move a job's last update into the past.
    pub fn age_job(&self, job_id: Uuid, by: Duration) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(job) = inner.jobs.iter_mut().find(|j| j.id == job_id) {
            job.updated_at = job.updated_at - by;
        }
    }

    pub fn set_subscription(&self, user_id: Uuid, status: Option<&str>, trial_started_at: Option<DateTime<Utc>>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.subscription_status = status.map(str::to_string);
            user.trial_started_at = trial_started_at;
        }
    }

    pub fn set_subscription_period_end(&self, user_id: Uuid, period_end: Option<DateTime<Utc>>) {
        if let Some(user) = self.inner.lock().unwrap().users.get_mut(&user_id) {
            user.subscription_period_end = period_end;
        }
    }

    pub fn subscription_status(&self, user_id: Uuid) -> Option<String> {
        self.inner.lock().unwrap().users.get(&user_id)?.subscription_status.clone()
    }

    pub fn user(&self, user_id: Uuid) -> UserRow {
        self.inner.lock().unwrap().users[&user_id].clone()
    }

    fn update_open<F>(&self, job_id: Uuid, apply: F) -> Option<AnalysisJob>
    where
        F: FnOnce(&mut AnalysisJob),
    {
        let mut inner = self.inner.lock().unwrap();
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && !j.status.is_terminal())?;
        apply(job);
        job.updated_at = Utc::now();
        Some(job.clone())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<Profile>, sqlx::Error> {
        Ok(self.inner.lock().unwrap().profiles.get(&profile_id).cloned())
    }

    async fn primary_profile(&self, user_id: Uuid) -> Result<Option<Profile>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .profiles
            .values()
            .find(|p| p.user_id == user_id && p.is_primary)
            .cloned())
    }

    async fn latest_job(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .rev()
            .find(|j| j.user_id == user_id && j.kind == kind && j.subject_key == subject_key)
            .cloned())
    }

    async fn latest_completed(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .rev()
            .find(|j| {
                j.user_id == user_id
                    && j.kind == kind
                    && j.subject_key == subject_key
                    && j.status == JobStatus::Completed
            })
            .cloned())
    }

    async fn count_questions(&self, user_id: Uuid, subject_key: &str) -> Result<i64, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .filter(|j| {
                j.user_id == user_id
                    && j.kind == JobKind::ConsultationMessage
                    && j.subject_key == subject_key
                    && j.status != JobStatus::Failed
                    && j.params["message_type"] == "user_question"
            })
            .count() as i64)
    }

    async fn insert_job(&self, job: NewJob) -> Result<AnalysisJob, sqlx::Error> {
        let now = Utc::now();
        let row = AnalysisJob {
            id: Uuid::new_v4(),
            user_id: job.user_id,
            kind: job.kind,
            subject_key: job.subject_key,
            params: job.params,
            status: JobStatus::Pending,
            external_job_id: None,
            progress_percent: 0,
            current_step: None,
            step_statuses: job.kind.initial_step_statuses(),
            error: None,
            result: None,
            credits_used: job.credits_used,
            created_at: now,
            updated_at: now,
        };
        self.inner.lock().unwrap().jobs.push(row.clone());
        Ok(row)
    }

    async fn reset_for_retry(
        &self,
        job_id: Uuid,
        params: Value,
        step_statuses: StepStatuses,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let Some(job) = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id && j.status == JobStatus::Failed)
        else {
            return Ok(None);
        };
        job.status = JobStatus::Pending;
        job.params = params;
        job.step_statuses = step_statuses;
        job.progress_percent = 0;
        job.current_step = None;
        job.error = None;
        job.result = None;
        job.external_job_id = None;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), sqlx::Error> {
        self.inner.lock().unwrap().jobs.retain(|j| j.id != job_id);
        Ok(())
    }

    async fn get_job(&self, user_id: Uuid, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .find(|j| j.id == job_id && j.user_id == user_id)
            .cloned())
    }

    async fn list_jobs(
        &self,
        user_id: Uuid,
        kind: Option<JobKind>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, sqlx::Error> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .iter()
            .rev()
            .filter(|j| j.user_id == user_id && kind.map_or(true, |k| j.kind == k))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_processing(
        &self,
        job_id: Uuid,
        external_job_id: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self.update_open(job_id, |job| {
            job.status = JobStatus::Processing;
            job.external_job_id = Some(external_job_id.to_string());
        }))
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        update: &ProgressUpdate,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self.update_open(job_id, |job| {
            job.status = update.status;
            job.progress_percent = update.progress_percent;
            if let Some(step) = &update.current_step {
                job.current_step = Some(step.clone());
            }
            if let Some(steps) = &update.step_statuses {
                job.step_statuses.extend(steps.clone());
            }
        }))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: Option<Value>,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self.update_open(job_id, |job| {
            job.status = JobStatus::Completed;
            job.progress_percent = 100;
            job.current_step = None;
            if result.is_some() {
                job.result = result;
            }
            job.error = None;
        }))
    }

    async fn fail_job(&self, job_id: Uuid, error: &JobError) -> Result<Option<AnalysisJob>, sqlx::Error> {
        Ok(self.update_open(job_id, |job| {
            job.status = JobStatus::Failed;
            if let Some(step) = error.step.clone().or_else(|| job.current_step.clone()) {
                job.step_statuses.insert(step, StepStatus::Failed);
            }
            job.error = Some(error.clone());
        }))
    }

    async fn fail_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        error: &JobError,
    ) -> Result<Vec<AnalysisJob>, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let mut failed = Vec::new();
        for job in inner
            .jobs
            .iter_mut()
            .filter(|j| !j.status.is_terminal() && j.updated_at < older_than)
        {
            job.status = JobStatus::Failed;
            if let Some(step) = job.current_step.clone() {
                job.step_statuses.insert(step, StepStatus::Failed);
            }
            job.error = Some(error.clone().at_step(job.current_step.clone()));
            job.updated_at = now;
            failed.push(job.clone());
        }
        Ok(failed)
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        Ok(())
    }
}

#[async_trait]
impl CreditLedger for MemoryStore {
    async fn deduct_credits(&self, request: &CreditRequest) -> Result<DeductOutcome, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let Some(user) = inner.users.get_mut(&request.user_id) else {
            return Ok(DeductOutcome::UnknownUser);
        };
        if user.credits < request.amount {
            return Ok(DeductOutcome::Insufficient {
                current: user.credits,
            });
        }
        user.credits -= request.amount;
        Ok(DeductOutcome::Deducted {
            new_balance: user.credits,
        })
    }

    async fn refund_credits(&self, request: &CreditRequest) -> Result<i32, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let user = inner
            .users
            .get_mut(&request.user_id)
            .ok_or(sqlx::Error::RowNotFound)?;
        user.credits += request.amount.abs();
        Ok(user.credits)
    }

    async fn credit_summary(
        &self,
        user_id: Uuid,
        _window: chrono::Duration,
    ) -> Result<CreditSummary, sqlx::Error> {
        let inner = self.inner.lock().unwrap();
        Ok(CreditSummary {
            current: inner.users.get(&user_id).map(|u| u.credits).unwrap_or(0),
            expiring_soon: 0,
            nearest_expiry: None,
            nearest_expiry_amount: 0,
        })
    }

    async fn expire_credits(&self, _now: DateTime<Utc>) -> Result<ExpirySummary, sqlx::Error> {
        Ok(ExpirySummary::default())
    }

    async fn expire_subscriptions(&self, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        let mut expired = 0;
        for user in inner.users.values_mut() {
            let lapsed = user.subscription_period_end.is_some_and(|end| end < now);
            if user.subscription_status.as_deref() == Some("active") && lapsed {
                user.subscription_status = Some("expired".to_string());
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn subscription_state(&self, user_id: Uuid) -> Result<Option<SubscriptionState>, sqlx::Error> {
        Ok(self.inner.lock().unwrap().users.get(&user_id).map(|u| SubscriptionState {
            subscription_status: u.subscription_status.clone(),
            trial_started_at: u.trial_started_at,
        }))
    }

    async fn start_trial(&self, user_id: Uuid, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(user) = inner.users.get_mut(&user_id) {
            user.trial_started_at.get_or_insert(now);
        }
        Ok(())
    }
}

/// How the scripted backend answers status calls.
#[derive(Debug, Clone)]
pub enum StatusScript {
    Report(Value),
    NotFound,
    Unreachable,
}

/// Analysis backend double that records every call.
pub struct ScriptedBackend {
    reject_start: Mutex<bool>,
    status: Mutex<StatusScript>,
    pub start_calls: AtomicUsize,
    pub status_calls: AtomicUsize,
    pub payloads: Mutex<Vec<(JobKind, Value)>>,
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self {
            reject_start: Mutex::new(false),
            status: Mutex::new(StatusScript::Report(serde_json::json!({"status": "processing"}))),
            start_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedBackend {
    pub fn reject_starts(&self, reject: bool) {
        *self.reject_start.lock().unwrap() = reject;
    }

    pub fn script_status(&self, script: StatusScript) {
        *self.status.lock().unwrap() = script;
    }

    pub fn starts(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn status_checks(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn last_payload(&self) -> Option<(JobKind, Value)> {
        self.payloads.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    async fn start_job(&self, kind: JobKind, payload: &Value) -> Result<String, BackendError> {
        let n = self.start_calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push((kind, payload.clone()));
        if *self.reject_start.lock().unwrap() {
            return Err(BackendError::Rejected {
                status: 503,
                detail: "backend overloaded".to_string(),
            });
        }
        Ok(format!("ext-{n}"))
    }

    async fn job_status(&self, _kind: JobKind, _external_job_id: &str) -> Result<BackendJobStatus, BackendError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        match self.status.lock().unwrap().clone() {
            StatusScript::Report(value) => Ok(serde_json::from_value(value)?),
            StatusScript::NotFound => Err(BackendError::NotFound),
            StatusScript::Unreachable => Err(BackendError::Rejected {
                status: 502,
                detail: "bad gateway".to_string(),
            }),
        }
    }

    async fn health(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

/// Router wired to in-memory doubles.
pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub backend: Arc<ScriptedBackend>,
    pub state: AppState,
    router: Router,
}

impl TestApp {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let backend = Arc::new(ScriptedBackend::default());
        let state = AppState::new(
            store.clone(),
            store.clone(),
            backend.clone(),
            AuthKeys::new("test-secret"),
            std::time::Duration::from_secs(STALE_AFTER_SECS),
        );
        let router = routes::router(state.clone());
        Self {
            store,
            backend,
            state,
            router,
        }
    }

    pub fn token(&self, user_id: Uuid) -> String {
        self.state
            .auth
            .issue_token(user_id, Duration::hours(1))
            .unwrap()
    }

    /// Send a request and return the status and JSON body (`Null` when empty).
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        user: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user_id) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(user_id)));
        }
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
            None => Body::empty(),
        };

        let response = self
            .router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn post(&self, uri: &str, user: Uuid, body: Value) -> (StatusCode, Value) {
        self.request(Method::POST, uri, Some(user), Some(body)).await
    }

    pub async fn get(&self, uri: &str, user: Uuid) -> (StatusCode, Value) {
        self.request(Method::GET, uri, Some(user), None).await
    }
}

pub fn job_id(body: &Value) -> Uuid {
    body["job_id"].as_str().unwrap().parse().unwrap()
}
