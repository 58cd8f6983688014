//! Postgres-backed job queue.
//!
//! ## Claim
//!
//! `claim` is one statement: a CTE picks candidate ids with
//! `FOR UPDATE SKIP LOCKED` and the outer `UPDATE ... RETURNING` leases them.
//! Rows another transaction is already leasing are skipped rather than waited
//! on, so concurrent workers never receive the same job.
//!
//! ## Lease-guarded transitions
//!
//! `complete` is a single conditional `UPDATE` on
//! `(id, status = 'processing', locked_by)`. `fail` needs the row's attempt
//! counters, so it locks the row with `SELECT ... FOR UPDATE`, applies
//! [`Job::fail`] and writes the result back in the same transaction.
//!
//! Time always comes from the database (`NOW()`), never from the worker host.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::{Executor, FromRow, PgPool, Postgres, Row};
use tracing::{debug, instrument};

use jobrelay_core::{EventId, JobId, WorkerId};

use super::store::{JobQueue, QueueConfig};
use super::types::{
    EnqueueOutcome, FailOutcome, FailureKind, Job, JobStatus, JobStatusCounts, NewJob,
};
use crate::error::StoreError;
use crate::postgres::{decode_status, interval_secs, is_unique_violation, map_sqlx_error};

const JOB_COLUMNS: &str = "id, job_type, payload, status, attempts, max_attempts, run_at, \
     locked_by, locked_at, last_error, created_at, updated_at, idempotency_key, \
     source_event_id, replayed_from";

#[derive(Debug, Clone)]
pub struct PostgresJobQueue {
    pool: Arc<PgPool>,
    config: QueueConfig,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool, config: QueueConfig) -> Self {
        Self {
            pool: Arc::new(pool),
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Resolve the job that made an insert collide.
    async fn find_existing(&self, job: &NewJob) -> Result<Option<JobId>, StoreError> {
        if let Some(key) = &job.idempotency_key {
            let id: Option<i64> =
                sqlx::query_scalar("SELECT id FROM jobs WHERE idempotency_key = $1")
                    .bind(key)
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("find_existing_job", e))?;
            if let Some(id) = id {
                return Ok(Some(JobId::new(id)));
            }
        }
        if let Some(event) = job.source_event_id {
            let id: Option<i64> =
                sqlx::query_scalar("SELECT id FROM jobs WHERE source_event_id = $1")
                    .bind(event.get())
                    .fetch_optional(&*self.pool)
                    .await
                    .map_err(|e| map_sqlx_error("find_existing_job", e))?;
            if let Some(id) = id {
                return Ok(Some(JobId::new(id)));
            }
        }
        Ok(None)
    }

    async fn exists(&self, id: JobId) -> Result<bool, StoreError> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM jobs WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_exists", e))?;
        Ok(found.is_some())
    }
}

async fn insert_job<'e, E>(executor: E, job: &NewJob) -> Result<JobId, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO jobs (
            job_type,
            payload,
            max_attempts,
            run_at,
            idempotency_key,
            source_event_id,
            replayed_from
        )
        VALUES ($1, $2, $3, COALESCE($4, NOW()), $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&job.job_type)
    .bind(&job.payload)
    .bind(job.max_attempts as i32)
    .bind(job.run_at)
    .bind(&job.idempotency_key)
    .bind(job.source_event_id.map(|id| id.get()))
    .bind(job.replayed_from.map(|id| id.get()))
    .fetch_one(executor)
    .await?;
    Ok(JobId::new(id))
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    #[instrument(
        skip(self, job),
        fields(job_type = %job.job_type, source_event_id = ?job.source_event_id),
        err
    )]
    async fn enqueue(&self, job: NewJob) -> Result<EnqueueOutcome, StoreError> {
        job.validate()?;

        match insert_job(&*self.pool, &job).await {
            Ok(id) => Ok(EnqueueOutcome::Created(id)),
            Err(e) if is_unique_violation(&e) => {
                let existing = self.find_existing(&job).await?.ok_or_else(|| {
                    StoreError::storage("unique violation on enqueue but no conflicting job found")
                })?;
                debug!(job_id = %existing, "enqueue collided with an existing job");
                Ok(EnqueueOutcome::Duplicate(existing))
            }
            Err(e) => Err(map_sqlx_error("enqueue", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.as_ref().map(decode_row).transpose()
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn claim(&self, worker_id: &WorkerId, batch_size: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH candidates AS (
                SELECT id AS candidate_id
                FROM jobs
                WHERE (status = 'pending' AND run_at <= NOW())
                   OR (status = 'processing'
                       AND locked_at < NOW() - make_interval(secs => $3))
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'processing',
                locked_by = $1,
                locked_at = NOW(),
                updated_at = NOW()
            FROM candidates
            WHERE jobs.id = candidates.candidate_id
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(worker_id.as_str())
        .bind(batch_size as i64)
        .bind(interval_secs(self.config.lease_timeout))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim", e))?;

        let mut jobs = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        // UPDATE ... RETURNING does not preserve the CTE's ordering.
        jobs.sort_by_key(|job| job.id);
        Ok(jobs)
    }

    #[instrument(skip(self), fields(job_id = %id, worker_id = %worker_id), err)]
    async fn complete(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done',
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            "#,
        )
        .bind(id.get())
        .bind(worker_id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::not_found(format!("job {id}")))
        }
    }

    #[instrument(skip(self), fields(job_id = %id, worker_id = %worker_id), err)]
    async fn release(&self, id: JobId, worker_id: &WorkerId) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                run_at = NOW(),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'processing' AND locked_by = $2
            "#,
        )
        .bind(id.get())
        .bind(worker_id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("release", e))?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(StoreError::not_found(format!("job {id}")))
        }
    }

    #[instrument(skip(self, error), fields(job_id = %id, worker_id = %worker_id, kind = ?kind), err)]
    async fn fail(
        &self,
        id: JobId,
        worker_id: &WorkerId,
        error: &str,
        kind: FailureKind,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS}, NOW() AS db_now FROM jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?
        .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;

        let now: DateTime<Utc> = row
            .try_get("db_now")
            .map_err(|e| map_sqlx_error("fail", e))?;
        let mut job = decode_row(&row)?;

        let outcome = job.fail(worker_id, error, kind, &self.config.retry, now);
        if outcome == FailOutcome::Ignored {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(outcome);
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                attempts = $3,
                run_at = $4,
                last_error = $5,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(id.get())
        .bind(job.status.as_str())
        .bind(job.attempts as i32)
        .bind(job.run_at)
        .bind(&job.last_error)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    #[instrument(skip(self), err)]
    async fn counts(&self) -> Result<JobStatusCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("job_counts", e))?;

        let mut counts = JobStatusCounts::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| map_sqlx_error("job_counts", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("job_counts", e))?;
            counts.add(status.parse::<JobStatus>()?, n.max(0) as u64);
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn recent_failures(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status IN ('dead', 'failed')
               OR (status = 'pending' AND last_error IS NOT NULL)
            ORDER BY updated_at DESC, id DESC
            LIMIT $1
            "#
        ))
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recent_failures", e))?;

        rows.iter().map(decode_row).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn replay_dead(&self, id: JobId) -> Result<JobId, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR SHARE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("replay_dead", e))?
        .ok_or_else(|| StoreError::not_found(format!("job {id}")))?;

        let dead = decode_row(&row)?;
        if dead.status != JobStatus::Dead {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::InvalidState(format!(
                "job {id} is {}, only dead jobs can be replayed",
                dead.status
            )));
        }

        let replayed = insert_job(&mut *tx, &dead.replay_request())
            .await
            .map_err(|e| map_sqlx_error("replay_dead", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(replayed)
    }

    #[instrument(skip(self), err)]
    async fn prune_done(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        // A job whose outbox row is still unbridged keeps its source_event_id
        // reserved, otherwise a late bridge retry would enqueue it again.
        let removed = sqlx::query(
            r#"
            DELETE FROM jobs j
            WHERE j.status = 'done'
              AND j.updated_at < $1
              AND NOT EXISTS (
                  SELECT 1 FROM event_outbox e
                  WHERE e.id = j.source_event_id AND e.queue_status <> 'bridged'
              )
            "#,
        )
        .bind(older_than)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_done", e))?
        .rows_affected();
        Ok(removed)
    }
}

fn decode_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
    JobRow::from_row(row)
        .map(Into::into)
        .map_err(|e| StoreError::storage(format!("failed to deserialize job row: {e}")))
}

#[derive(Debug)]
struct JobRow {
    id: i64,
    job_type: String,
    payload: JsonValue,
    status: JobStatus,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    locked_by: Option<WorkerId>,
    locked_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    idempotency_key: Option<String>,
    source_event_id: Option<i64>,
    replayed_from: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for JobRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        let locked_by: Option<String> = row.try_get("locked_by")?;
        let locked_by = locked_by
            .map(WorkerId::parse)
            .transpose()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: decode_status(row.try_get("status")?)?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            run_at: row.try_get("run_at")?,
            locked_by,
            locked_at: row.try_get("locked_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            idempotency_key: row.try_get("idempotency_key")?,
            source_event_id: row.try_get("source_event_id")?,
            replayed_from: row.try_get("replayed_from")?,
        })
    }
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job {
            id: JobId::new(row.id),
            job_type: row.job_type,
            payload: row.payload,
            status: row.status,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            run_at: row.run_at,
            locked_by: row.locked_by,
            locked_at: row.locked_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            idempotency_key: row.idempotency_key,
            source_event_id: row.source_event_id.map(EventId::new),
            replayed_from: row.replayed_from.map(JobId::new),
        }
    }
}
