use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::Row;
use uuid::Uuid;

use super::{JobStore, PgStore};
use crate::models::job::{
    AnalysisJob, JobError, JobKind, JobStatus, NewJob, ProgressUpdate, StepStatuses,
};
use crate::models::profile::Profile;

const JOB_COLUMNS: &str = "id, user_id, kind, subject_key, params, status, external_job_id, \
     progress_percent, current_step, step_statuses, error, result, credits_used, \
     created_at, updated_at";

const PROFILE_COLUMNS: &str =
    "id, user_id, name, gender, birth_date, birth_time, calendar_type, is_primary, created_at";

fn decode_error<E>(err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(err))
}

fn job_from_row(row: &PgRow) -> Result<AnalysisJob, sqlx::Error> {
    let kind: String = row.try_get("kind")?;
    let status: String = row.try_get("status")?;
    let step_statuses: Json<StepStatuses> = row.try_get("step_statuses")?;
    let error: Option<Json<JobError>> = row.try_get("error")?;

    Ok(AnalysisJob {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: kind.parse::<JobKind>().map_err(decode_error)?,
        subject_key: row.try_get("subject_key")?,
        params: row.try_get("params")?,
        status: status.parse::<JobStatus>().map_err(decode_error)?,
        external_job_id: row.try_get("external_job_id")?,
        progress_percent: row.try_get("progress_percent")?,
        current_step: row.try_get("current_step")?,
        step_statuses: step_statuses.0,
        error: error.map(|e| e.0),
        result: row.try_get("result")?,
        credits_used: row.try_get("credits_used")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// `step_statuses` with the step named by `step` set to failed, unchanged
/// when `step` is NULL.
fn flag_failed_step(step: &str) -> String {
    format!(
        "CASE WHEN {step} IS NULL THEN step_statuses \
         ELSE jsonb_set(step_statuses, ARRAY[{step}], '\"failed\"'::jsonb) END"
    )
}

#[async_trait]
impl JobStore for PgStore {
    async fn get_profile(&self, profile_id: Uuid) -> Result<Option<Profile>, sqlx::Error> {
        let sql = format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE id = $1");
        sqlx::query_as::<_, Profile>(&sql)
            .bind(profile_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn primary_profile(&self, user_id: Uuid) -> Result<Option<Profile>, sqlx::Error> {
        let sql = format!(
            "SELECT {PROFILE_COLUMNS} FROM profiles WHERE user_id = $1 \
             ORDER BY is_primary DESC, created_at ASC LIMIT 1"
        );
        sqlx::query_as::<_, Profile>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
    }

    async fn latest_job(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE user_id = $1 AND kind = $2 AND subject_key = $3 \
             ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(kind.as_ref())
            .bind(subject_key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn latest_completed(
        &self,
        user_id: Uuid,
        kind: JobKind,
        subject_key: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE user_id = $1 AND kind = $2 AND subject_key = $3 AND status = 'completed' \
             ORDER BY updated_at DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(kind.as_ref())
            .bind(subject_key)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn count_questions(&self, user_id: Uuid, subject_key: &str) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS questions
            FROM analysis_jobs
            WHERE user_id = $1
              AND kind = $2
              AND subject_key = $3
              AND status <> 'failed'
              AND params->>'message_type' = 'user_question'
            "#,
        )
        .bind(user_id)
        .bind(JobKind::ConsultationMessage.as_ref())
        .bind(subject_key)
        .fetch_one(&self.pool)
        .await?;

        row.try_get("questions")
    }

    async fn insert_job(&self, job: NewJob) -> Result<AnalysisJob, sqlx::Error> {
        let sql = format!(
            "INSERT INTO analysis_jobs \
                 (user_id, kind, subject_key, params, status, step_statuses, credits_used) \
             VALUES ($1, $2, $3, $4, 'pending', $5, $6) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job.user_id)
            .bind(job.kind.as_ref())
            .bind(&job.subject_key)
            .bind(&job.params)
            .bind(Json(job.kind.initial_step_statuses()))
            .bind(job.credits_used)
            .fetch_one(&self.pool)
            .await?;

        job_from_row(&row)
    }

    async fn reset_for_retry(
        &self,
        job_id: Uuid,
        params: serde_json::Value,
        step_statuses: StepStatuses,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "UPDATE analysis_jobs \
             SET status = 'pending', params = $2, step_statuses = $3, progress_percent = 0, \
                 current_step = NULL, error = NULL, result = NULL, external_job_id = NULL, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'failed' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(&params)
            .bind(Json(step_statuses))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM analysis_jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get_job(&self, user_id: Uuid, job_id: Uuid) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1 AND user_id = $2");
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn list_jobs(
        &self,
        user_id: Uuid,
        kind: Option<JobKind>,
        limit: i64,
    ) -> Result<Vec<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM analysis_jobs \
             WHERE user_id = $1 AND ($2::TEXT IS NULL OR kind = $2) \
             ORDER BY created_at DESC LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id)
            .bind(kind.map(|k| k.to_string()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn mark_processing(
        &self,
        job_id: Uuid,
        external_job_id: &str,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "UPDATE analysis_jobs \
             SET status = 'processing', external_job_id = $2, updated_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(external_job_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn record_progress(
        &self,
        job_id: Uuid,
        update: &ProgressUpdate,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "UPDATE analysis_jobs \
             SET status = $2, progress_percent = $3, \
                 current_step = COALESCE($4, current_step), \
                 step_statuses = step_statuses || COALESCE($5, '{{}}'::jsonb), \
                 updated_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(update.status.as_ref())
            .bind(update.progress_percent)
            .bind(update.current_step.as_deref())
            .bind(update.step_statuses.as_ref().map(Json))
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        result: Option<serde_json::Value>,
    ) -> Result<Option<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "UPDATE analysis_jobs \
             SET status = 'completed', progress_percent = 100, current_step = NULL, \
                 result = COALESCE($2, result), error = NULL, updated_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(result)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn fail_job(&self, job_id: Uuid, error: &JobError) -> Result<Option<AnalysisJob>, sqlx::Error> {
        // The failing step (or the current one) is flagged in the step map.
        let sql = format!(
            "UPDATE analysis_jobs \
             SET status = 'failed', error = $2, \
                 step_statuses = {flagged}, \
                 updated_at = NOW() \
             WHERE id = $1 AND status NOT IN ('completed', 'failed') \
             RETURNING {JOB_COLUMNS}",
            flagged = flag_failed_step("COALESCE($3, current_step)"),
        );
        let row = sqlx::query(&sql)
            .bind(job_id)
            .bind(Json(error))
            .bind(error.step.as_deref())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn fail_stale_jobs(
        &self,
        older_than: DateTime<Utc>,
        error: &JobError,
    ) -> Result<Vec<AnalysisJob>, sqlx::Error> {
        let sql = format!(
            "UPDATE analysis_jobs \
             SET status = 'failed', \
                 error = CASE WHEN current_step IS NULL THEN $2 \
                     ELSE $2 || jsonb_build_object('step', current_step) END, \
                 step_statuses = {flagged}, \
                 updated_at = NOW() \
             WHERE status IN ('pending', 'processing') AND updated_at < $1 \
             RETURNING {JOB_COLUMNS}",
            flagged = flag_failed_step("current_step"),
        );
        let rows = sqlx::query(&sql)
            .bind(older_than)
            .bind(Json(error))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(job_from_row).collect()
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
