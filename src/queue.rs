//! Lease-based job queue on SQLite.
//!
//! Workers in independent processes share one `jobs` table. A claim is a
//! single `UPDATE … WHERE id = (SELECT … LIMIT 1) RETURNING *` statement,
//! so two workers can never both observe the same job as claimable:
//!
//! 1. the oldest queued job (by `created_at`) that is not parked;
//! 2. otherwise the running job whose heartbeat is oldest past
//!    `stale_ms` (by `updated_at`), with attempts left.
//!
//! Both paths stamp a fresh `process_id` and bump `attempts`. Writes that
//! take a `process_id` only apply while that process still owns the
//! lease; once a job is reclaimed the old owner's writes stop mattering.
//!
//! All timestamps are stored as epoch milliseconds. `logs_json` and
//! `trace_json` are append-only and written with `json_insert`, so
//! concurrent appends never drop entries.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info, warn};
use uuid::Uuid;

use docflow_core::error::PipelineError;
use docflow_core::models::{
    trace_names, Job, JobError, JobStatus, LogEntry, NewJob, Phase, Step, TraceEvent,
};

use crate::config::{Config, MIN_STALE_MS};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub stale_ms: i64,
    pub max_attempts: u32,
    /// Steps pre-populated on every new job, in order.
    pub phases: Vec<Phase>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            stale_ms: 60_000,
            max_attempts: 3,
            phases: Phase::ALL.to_vec(),
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stale_ms: config.queue.effective_stale_ms(),
            max_attempts: config.queue.max_attempts,
            phases: config.pipeline.phases.clone(),
        }
    }
}

/// How a job came to be claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimKind {
    Fresh,
    /// Taken over from a worker whose lease went stale.
    Reclaimed,
}

#[derive(Debug, Clone)]
pub struct Claim {
    pub job: Job,
    pub kind: ClaimKind,
}

impl Claim {
    /// The lease owner id assigned by this claim.
    pub fn process_id(&self) -> &str {
        self.job.process_id.as_deref().unwrap_or_default()
    }
}

/// Aggregate job counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub queued: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
}

impl Counters {
    pub fn total(&self) -> i64 {
        self.queued + self.running + self.completed + self.failed
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub batch_id: Option<String>,
    pub job_type: Option<String>,
    pub include_archived: bool,
    pub limit: Option<i64>,
}

#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    options: QueueOptions,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, mut options: QueueOptions) -> Self {
        options.stale_ms = options.stale_ms.max(MIN_STALE_MS);
        Self { pool, options }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn stale_ms(&self) -> i64 {
        self.options.stale_ms
    }

    /// Insert a new queued job with pending steps for every configured phase.
    pub async fn enqueue(&self, new: NewJob) -> Result<Job> {
        let source = &new.correlation.source;
        if source.item_id.trim().is_empty() {
            return Err(PipelineError::BadRequest("correlation.source.item_id is required".into()).into());
        }
        if source.name.trim().is_empty() {
            return Err(PipelineError::BadRequest("correlation.source.name is required".into()).into());
        }
        if new.correlation.options.target_language.trim().is_empty() {
            return Err(PipelineError::BadRequest(
                "correlation.options.target_language is required".into(),
            )
            .into());
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let steps: Vec<Step> = self.options.phases.iter().map(|p| Step::pending(*p)).collect();
        let max_attempts = new.max_attempts.unwrap_or(self.options.max_attempts).max(1);

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, job_type, status, attempts, max_attempts, user_email, library_id,
                              correlation_json, policies_json, steps_json, batch_id, created_at, updated_at)
            VALUES (?, ?, 'queued', 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING *
            "#,
        )
        .bind(&id)
        .bind(&new.job_type)
        .bind(max_attempts as i64)
        .bind(&new.user_email)
        .bind(&new.library_id)
        .bind(serde_json::to_string(&new.correlation)?)
        .bind(serde_json::to_string(&new.policies)?)
        .bind(serde_json::to_string(&steps)?)
        .bind(&new.batch_id)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        let job = job_from_row(&row)?;
        debug!(job_id = %job.id, source = %job.correlation.source.name, "job enqueued");
        Ok(job)
    }

    pub async fn claim(&self) -> Result<Option<Claim>> {
        self.claim_at(Utc::now()).await
    }

    /// Claim with an explicit clock; queued jobs always win over stale ones.
    pub async fn claim_at(&self, now: DateTime<Utc>) -> Result<Option<Claim>> {
        let now_ms = now.timestamp_millis();
        let process_id = Uuid::new_v4().to_string();

        let fresh = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'running', attempts = attempts + 1, process_id = ?,
                started_at = ?, heartbeat_at = ?, updated_at = ?, parked_until = NULL
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued' AND (parked_until IS NULL OR parked_until <= ?)
                ORDER BY created_at ASC, rowid ASC
                LIMIT 1
            ) AND status = 'queued'
            RETURNING *
            "#,
        )
        .bind(&process_id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = fresh {
            let job = job_from_row(&row)?;
            debug!(job_id = %job.id, attempts = job.attempts, "claimed queued job");
            return Ok(Some(Claim {
                job,
                kind: ClaimKind::Fresh,
            }));
        }

        let threshold = now_ms - self.options.stale_ms;
        let reclaimed = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1, process_id = ?,
                started_at = ?, heartbeat_at = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'running' AND heartbeat_at < ? AND attempts < max_attempts
                ORDER BY updated_at ASC, rowid ASC
                LIMIT 1
            ) AND status = 'running' AND heartbeat_at < ?
            RETURNING *
            "#,
        )
        .bind(&process_id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .bind(threshold)
        .bind(threshold)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = reclaimed else {
            return Ok(None);
        };
        let job = job_from_row(&row)?;
        info!(job_id = %job.id, attempts = job.attempts, "reclaimed stale lease");
        self.append_trace(
            &job.id,
            &TraceEvent::at(
                now,
                trace_names::STALE_LEASE_RECLAIM,
                serde_json::json!({ "attempts": job.attempts, "process_id": process_id }),
            ),
        )
        .await?;
        let job = self.get(&job.id).await?.ok_or_else(|| anyhow!("job vanished after reclaim"))?;
        Ok(Some(Claim {
            job,
            kind: ClaimKind::Reclaimed,
        }))
    }

    /// Refresh the lease. With `process_id`, only the current owner may.
    ///
    /// Returns `false` when nothing was updated (job reclaimed or finished).
    pub async fn heartbeat(&self, id: &str, process_id: Option<&str>) -> Result<bool> {
        self.heartbeat_at(id, process_id, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        id: &str,
        process_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET heartbeat_at = ? WHERE id = ? AND status = 'running' AND (? IS NULL OR process_id = ?)",
        )
        .bind(now.timestamp_millis())
        .bind(id)
        .bind(process_id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn complete(
        &self,
        id: &str,
        process_id: Option<&str>,
        result: Option<serde_json::Value>,
    ) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let result_json = result.map(|v| v.to_string());
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', result_json = ?, error_json = NULL,
                finished_at = ?, updated_at = ?
            WHERE id = ? AND status = 'running' AND (? IS NULL OR process_id = ?)
            "#,
        )
        .bind(result_json)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(process_id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn fail(&self, id: &str, process_id: Option<&str>, error: &JobError) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed', error_json = ?, finished_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'running') AND (? IS NULL OR process_id = ?)
            "#,
        )
        .bind(serde_json::to_string(error)?)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(process_id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() > 0 {
            warn!(job_id = %id, code = %error.code, message = %error.message, "job failed");
        }
        Ok(done.rows_affected() > 0)
    }

    pub async fn counters(&self) -> Result<Counters> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut counters = Counters::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => counters.queued = n,
                Ok(JobStatus::Running) => counters.running = n,
                Ok(JobStatus::Completed) => counters.completed = n,
                Ok(JobStatus::Failed) => counters.failed = n,
                Err(_) => warn!(status = %status, "unknown status in jobs table"),
            }
        }
        Ok(counters)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// Jobs matching `filter`, oldest first.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM jobs WHERE 1 = 1");
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(batch) = &filter.batch_id {
            qb.push(" AND batch_id = ").push_bind(batch.clone());
        }
        if let Some(job_type) = &filter.job_type {
            qb.push(" AND job_type = ").push_bind(job_type.clone());
        }
        if !filter.include_archived {
            qb.push(" AND archived = 0");
        }
        qb.push(" ORDER BY created_at ASC, rowid ASC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Replace the stored step for `step.name`.
    ///
    /// Status changes must follow the step lifecycle; a write with an
    /// unchanged status only updates details.
    pub async fn update_step(&self, id: &str, process_id: Option<&str>, step: &Step) -> Result<bool> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", id)))?;
        let index = job
            .steps
            .iter()
            .position(|s| s.name == step.name)
            .ok_or_else(|| {
                PipelineError::BadRequest(format!("job {} has no {} step", id, step.name))
            })?;

        let current = &job.steps[index];
        if current.status != step.status && !current.status.can_transition_to(step.status) {
            return Err(PipelineError::InvalidStepTransition {
                phase: step.name,
                from: current.status,
                to: step.status,
            }
            .into());
        }

        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET steps_json = json_set(steps_json, ?, json(?)), updated_at = ?
            WHERE id = ? AND (? IS NULL OR process_id = ?)
            "#,
        )
        .bind(format!("$[{}]", index))
        .bind(serde_json::to_string(step)?)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(process_id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Put every step back to `pending` for a fresh pass by the lease owner.
    ///
    /// Gates are re-derived from artifact state on each claim, so a resumed
    /// or reclaimed job starts its step records over.
    pub async fn reset_steps(&self, id: &str, process_id: &str) -> Result<bool> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", id)))?;
        let steps: Vec<Step> = job.phases().into_iter().map(Step::pending).collect();
        let done = sqlx::query(
            "UPDATE jobs SET steps_json = ?, updated_at = ? WHERE id = ? AND status = 'running' AND process_id = ?",
        )
        .bind(serde_json::to_string(&steps)?)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn append_log(&self, id: &str, level: &str, message: &str) -> Result<()> {
        let entry = LogEntry {
            at: Utc::now(),
            level: level.to_string(),
            message: message.to_string(),
        };
        sqlx::query("UPDATE jobs SET logs_json = json_insert(logs_json, '$[#]', json(?)) WHERE id = ?")
            .bind(serde_json::to_string(&entry)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn append_trace(&self, id: &str, event: &TraceEvent) -> Result<()> {
        sqlx::query("UPDATE jobs SET trace_json = json_insert(trace_json, '$[#]', json(?)) WHERE id = ?")
            .bind(serde_json::to_string(event)?)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Hand a running job back to the queue, unclaimable until `until`.
    pub async fn park(&self, id: &str, process_id: &str, until: DateTime<Utc>) -> Result<bool> {
        let now = Utc::now().timestamp_millis();
        let done = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', parked_until = ?, process_id = NULL, heartbeat_at = NULL,
                updated_at = ?
            WHERE id = ? AND status = 'running' AND process_id = ?
            "#,
        )
        .bind(until.timestamp_millis())
        .bind(now)
        .bind(id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Make a parked job claimable at once.
    pub async fn unpark(&self, id: &str) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET parked_until = NULL WHERE id = ? AND status = 'queued' AND parked_until IS NOT NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    /// Store the SHA-256 digest of the current dispatch's callback secret.
    pub async fn set_callback_secret(&self, id: &str, process_id: &str, secret_hash: &str) -> Result<bool> {
        let done = sqlx::query(
            "UPDATE jobs SET callback_secret_hash = ? WHERE id = ? AND process_id = ?",
        )
        .bind(secret_hash)
        .bind(id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn callback_secret_hash(&self, id: &str) -> Result<Option<String>> {
        let hash: Option<Option<String>> =
            sqlx::query_scalar("SELECT callback_secret_hash FROM jobs WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        match hash {
            Some(h) => Ok(h),
            None => Err(PipelineError::NotFound(format!("job {}", id)).into()),
        }
    }

    /// Fail stale running jobs that have no attempts left.
    pub async fn fail_exhausted(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let now_ms = now.timestamp_millis();
        let error = JobError {
            code: "attempts_exhausted".to_string(),
            message: "lease expired and no attempts remain".to_string(),
        };
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET status = 'failed', error_json = ?, finished_at = ?, updated_at = ?
            WHERE status = 'running' AND heartbeat_at < ? AND attempts >= max_attempts
            RETURNING id
            "#,
        )
        .bind(serde_json::to_string(&error)?)
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms - self.options.stale_ms)
        .fetch_all(&self.pool)
        .await?;

        for id in &ids {
            warn!(job_id = %id, "attempts exhausted, job failed");
        }
        Ok(ids)
    }

    /// Reset a job to `queued` with pending steps and zero attempts.
    ///
    /// Logs and trace are kept; a `job_restarted` event is appended.
    pub async fn restart(&self, id: &str) -> Result<Job> {
        let job = self
            .get(id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", id)))?;
        let steps: Vec<Step> = job.phases().into_iter().map(Step::pending).collect();
        let event = TraceEvent::new(
            trace_names::JOB_RESTARTED,
            serde_json::json!({ "previous_status": job.status.as_str(), "attempts": job.attempts }),
        );

        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued', attempts = 0, steps_json = ?, result_json = NULL,
                error_json = NULL, process_id = NULL, heartbeat_at = NULL, parked_until = NULL,
                callback_secret_hash = NULL, started_at = NULL, finished_at = NULL,
                updated_at = ?, trace_json = json_insert(trace_json, '$[#]', json(?))
            WHERE id = ?
            RETURNING *
            "#,
        )
        .bind(serde_json::to_string(&steps)?)
        .bind(Utc::now().timestamp_millis())
        .bind(serde_json::to_string(&event)?)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("job {}", id)))?;

        info!(job_id = %id, previous = %job.status, "job restarted");
        job_from_row(&row)
    }

    pub async fn set_archived(&self, id: &str, archived: bool) -> Result<bool> {
        let done = sqlx::query("UPDATE jobs SET archived = ? WHERE id = ?")
            .bind(archived)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

fn from_ms(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("invalid timestamp: {}", ms))
}

fn opt_from_ms(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_ms).transpose()
}

fn column_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column)?;
    serde_json::from_str(&raw).with_context(|| format!("Invalid JSON in jobs.{}", column))
}

fn opt_column_json<T: DeserializeOwned>(row: &SqliteRow, column: &str) -> Result<Option<T>> {
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| serde_json::from_str(&s).with_context(|| format!("Invalid JSON in jobs.{}", column)))
        .transpose()
}

fn job_from_row(row: &SqliteRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;

    Ok(Job {
        id: row.try_get("id")?,
        job_type: row.try_get("job_type")?,
        status: status.parse()?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        user_email: row.try_get("user_email")?,
        library_id: row.try_get("library_id")?,
        correlation: column_json(row, "correlation_json")?,
        policies: column_json(row, "policies_json")?,
        steps: column_json(row, "steps_json")?,
        logs: column_json(row, "logs_json")?,
        trace: column_json(row, "trace_json")?,
        result: opt_column_json(row, "result_json")?,
        error: opt_column_json(row, "error_json")?,
        process_id: row.try_get("process_id")?,
        heartbeat_at: opt_from_ms(row.try_get("heartbeat_at")?)?,
        parked_until: opt_from_ms(row.try_get("parked_until")?)?,
        batch_id: row.try_get("batch_id")?,
        archived: row.try_get("archived")?,
        created_at: from_ms(row.try_get("created_at")?)?,
        updated_at: from_ms(row.try_get("updated_at")?)?,
        started_at: opt_from_ms(row.try_get("started_at")?)?,
        finished_at: opt_from_ms(row.try_get("finished_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::models::{Correlation, JobOptions, SourceRef, StepStatus};
    use tempfile::TempDir;

    async fn queue() -> (TempDir, JobQueue) {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::open(&tmp.path().join("q.sqlite")).await.unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        (tmp, JobQueue::new(pool, QueueOptions::default()))
    }

    fn new_job(name: &str) -> NewJob {
        NewJob {
            job_type: "pdf".to_string(),
            correlation: Correlation {
                source: SourceRef {
                    item_id: name.to_string(),
                    parent_id: "root".to_string(),
                    name: name.to_string(),
                    mime_type: None,
                },
                options: JobOptions {
                    target_language: "de".to_string(),
                    source_language: None,
                    template: None,
                    use_cache: true,
                },
            },
            policies: Default::default(),
            user_email: None,
            library_id: None,
            batch_id: Some("b1".to_string()),
            max_attempts: None,
        }
    }

    #[tokio::test]
    async fn enqueue_prepopulates_pending_steps() {
        let (_tmp, q) = queue().await;
        let job = q.enqueue(new_job("a.pdf")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.phases(), Phase::ALL.to_vec());
        assert!(job.steps.iter().all(|s| s.status == StepStatus::Pending));
    }

    #[tokio::test]
    async fn enqueue_rejects_missing_source() {
        let (_tmp, q) = queue().await;
        let mut bad = new_job("a.pdf");
        bad.correlation.source.item_id = String::new();
        let err = q.enqueue(bad).await.unwrap_err();
        assert_eq!(docflow_core::error::error_code(&err), "bad_request");
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let (_tmp, q) = queue().await;
        assert!(q.claim().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_step_rejects_backwards_transition() {
        let (_tmp, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        let claim = q.claim().await.unwrap().unwrap();
        let pid = claim.process_id().to_string();

        let mut step = claim.job.step(Phase::Extract).unwrap().clone();
        step.transition(StepStatus::Running, Utc::now()).unwrap();
        assert!(q.update_step(&claim.job.id, Some(&pid), &step).await.unwrap());
        step.transition(StepStatus::Completed, Utc::now()).unwrap();
        assert!(q.update_step(&claim.job.id, Some(&pid), &step).await.unwrap());

        let mut back = step.clone();
        back.status = StepStatus::Running;
        assert!(q.update_step(&claim.job.id, Some(&pid), &back).await.is_err());

        let stored = q.get(&claim.job.id).await.unwrap().unwrap();
        assert_eq!(stored.step(Phase::Extract).unwrap().status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn appends_accumulate() {
        let (_tmp, q) = queue().await;
        let job = q.enqueue(new_job("a.pdf")).await.unwrap();
        for i in 0..3 {
            q.append_trace(&job.id, &TraceEvent::new("e", serde_json::json!({ "i": i })))
                .await
                .unwrap();
        }
        q.append_log(&job.id, "info", "hello").await.unwrap();
        let stored = q.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.trace.len(), 3);
        assert_eq!(stored.logs[0].message, "hello");
    }

    #[tokio::test]
    async fn parked_job_waits_until_unparked() {
        let (_tmp, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        let claim = q.claim().await.unwrap().unwrap();
        let until = Utc::now() + chrono::Duration::minutes(10);
        assert!(q.park(&claim.job.id, claim.process_id(), until).await.unwrap());

        assert!(q.claim().await.unwrap().is_none());
        assert!(q.unpark(&claim.job.id).await.unwrap());
        let again = q.claim().await.unwrap().unwrap();
        assert_eq!(again.job.id, claim.job.id);
        assert_eq!(again.job.attempts, 2);
    }

    #[tokio::test]
    async fn restart_resets_state_and_keeps_trace() {
        let (_tmp, q) = queue().await;
        q.enqueue(new_job("a.pdf")).await.unwrap();
        let claim = q.claim().await.unwrap().unwrap();
        let error = JobError {
            code: "internal".to_string(),
            message: "boom".to_string(),
        };
        assert!(q.fail(&claim.job.id, Some(claim.process_id()), &error).await.unwrap());

        let job = q.restart(&claim.job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 0);
        assert!(job.error.is_none());
        assert!(job.process_id.is_none());
        assert!(job.latest_trace(trace_names::JOB_RESTARTED).is_some());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_archive() {
        let (_tmp, q) = queue().await;
        let a = q.enqueue(new_job("a.pdf")).await.unwrap();
        q.enqueue(new_job("b.pdf")).await.unwrap();
        q.set_archived(&a.id, true).await.unwrap();

        let visible = q.list(&JobFilter::default()).await.unwrap();
        assert_eq!(visible.len(), 1);

        let all = q
            .list(&JobFilter {
                include_archived: true,
                status: Some(JobStatus::Queued),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
