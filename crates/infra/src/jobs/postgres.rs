//! Postgres-backed job store.
//!
//! Each job is one row: the full record as a `jsonb` document plus the scalar
//! columns the sweeps filter on (`status`, `updated_at`,
//! `auto_resume_attempts`) and the `revision` used for compare-and-swap.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, `Storage` otherwise |
//! | Database (other) | any | `Storage` |
//! | PoolClosed | N/A | `Storage` |
//! | ColumnDecode / Decode | N/A | `Serialization` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Row};
use tracing::{Span, instrument};

use storyforge_core::{ExpectedVersion, JobId};
use storyforge_generation::GenerationJob;

use super::store::{AttemptFilter, JobStore, JobStoreError, StaleQuery, fail_in_place};

const SCHEMA: [&str; 2] = [
    r#"
    CREATE TABLE IF NOT EXISTS generation_jobs (
        id                    UUID PRIMARY KEY,
        status                TEXT NOT NULL,
        step                  TEXT NOT NULL,
        progress              SMALLINT NOT NULL,
        auto_resume_attempts  INTEGER NOT NULL,
        revision              BIGINT NOT NULL,
        lease_expires_at      TIMESTAMPTZ NULL,
        created_at            TIMESTAMPTZ NOT NULL,
        updated_at            TIMESTAMPTZ NOT NULL,
        document              JSONB NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS generation_jobs_activity_idx
        ON generation_jobs (status, updated_at)
    "#,
];

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the table and index if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Lock the row, let `f` edit it, and write it back if `f` returns true.
    async fn modify<F>(
        &self,
        operation: &'static str,
        id: JobId,
        f: F,
    ) -> Result<Option<GenerationJob>, JobStoreError>
    where
        F: FnOnce(&mut GenerationJob) -> bool + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        let row = sqlx::query("SELECT document FROM generation_jobs WHERE id = $1 FOR UPDATE")
            .bind(id.as_uuid())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?
            .ok_or(JobStoreError::NotFound(id))?;

        let mut job = decode(&row)?;
        if !f(&mut job) {
            tx.rollback().await.map_err(|e| map_sqlx_error(operation, e))?;
            return Ok(None);
        }
        job.revision += 1;

        write_row(&mut *tx, &job, None)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        tx.commit().await.map_err(|e| map_sqlx_error(operation, e))?;
        Ok(Some(job))
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: GenerationJob) -> Result<GenerationJob, JobStoreError> {
        let mut stored = job;
        stored.revision = 1;
        let document = Json(&stored);

        sqlx::query(
            r#"
            INSERT INTO generation_jobs (
                id, status, step, progress, auto_resume_attempts, revision,
                lease_expires_at, created_at, updated_at, document
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(stored.id.as_uuid())
        .bind(stored.status.as_str())
        .bind(stored.step.to_string())
        .bind(stored.progress as i16)
        .bind(stored.auto_resume_attempts as i32)
        .bind(stored.revision as i64)
        .bind(stored.lease_expires_at)
        .bind(stored.created_at)
        .bind(stored.updated_at)
        .bind(document)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(stored.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(stored)
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Option<GenerationJob>, JobStoreError> {
        let row = sqlx::query("SELECT document FROM generation_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(decode).transpose()
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, step = %job.step, expected = ?expected),
        err
    )]
    async fn update(
        &self,
        job: &GenerationJob,
        expected: ExpectedVersion,
    ) -> Result<GenerationJob, JobStoreError> {
        let current_revision = sqlx::query("SELECT revision FROM generation_jobs WHERE id = $1")
            .bind(job.id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("update", e))?
            .ok_or(JobStoreError::NotFound(job.id))?
            .try_get::<i64, _>("revision")
            .map_err(|e| map_sqlx_error("update", e))? as u64;

        if !expected.matches(current_revision) {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: current_revision,
            });
        }

        let mut stored = job.clone();
        stored.revision = current_revision + 1;

        // The revision guard in the WHERE clause closes the race between the
        // read above and this write.
        let affected = write_row(&*self.pool, &stored, Some(current_revision))
            .await
            .map_err(|e| map_sqlx_error("update", e))?;
        if affected == 0 {
            return Err(JobStoreError::Conflict {
                id: job.id,
                expected,
                actual: current_revision + 1,
            });
        }
        Ok(stored)
    }

    #[instrument(skip(self), fields(limit = query.limit, rows = tracing::field::Empty), err)]
    async fn list_stale(&self, query: &StaleQuery) -> Result<Vec<GenerationJob>, JobStoreError> {
        let span = Span::current();
        let statuses: Vec<&str> = query.statuses.iter().map(|s| s.as_str()).collect();
        let (below, at_least) = match query.attempts {
            AttemptFilter::Any => (None, None),
            AttemptFilter::Below(n) => (Some(n as i32), None),
            AttemptFilter::AtLeast(n) => (None, Some(n as i32)),
        };

        let rows = sqlx::query(
            r#"
            SELECT document
            FROM generation_jobs
            WHERE status = ANY($1)
              AND ($2::TIMESTAMPTZ IS NULL OR updated_at < $2)
              AND ($3::INTEGER IS NULL OR auto_resume_attempts < $3)
              AND ($4::INTEGER IS NULL OR auto_resume_attempts >= $4)
            ORDER BY updated_at ASC, id ASC
            LIMIT $5
            "#,
        )
        .bind(&statuses)
        .bind(query.updated_before)
        .bind(below)
        .bind(at_least)
        .bind(query.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale", e))?;

        span.record("rows", rows.len());
        rows.iter().map(decode).collect()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn increment_auto_resume(&self, id: JobId) -> Result<GenerationJob, JobStoreError> {
        self.modify("increment_auto_resume", id, |job| {
            job.auto_resume_attempts += 1;
            true
        })
        .await?
        .ok_or(JobStoreError::NotFound(id))
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn fail_if_active(
        &self,
        id: JobId,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        let failed = self
            .modify("fail_if_active", id, |job| {
                !job.status.is_terminal() && fail_in_place(job, message, now)
            })
            .await?;
        Ok(failed.is_some())
    }
}

/// Write every column of `job`. With `guard`, only if the stored revision
/// still equals it. Returns rows affected.
async fn write_row<'e, E: PgExecutor<'e>>(
    executor: E,
    job: &GenerationJob,
    guard: Option<u64>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = $2,
            step = $3,
            progress = $4,
            auto_resume_attempts = $5,
            revision = $6,
            lease_expires_at = $7,
            updated_at = $8,
            document = $9
        WHERE id = $1
          AND ($10::BIGINT IS NULL OR revision = $10)
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(job.step.to_string())
    .bind(job.progress as i16)
    .bind(job.auto_resume_attempts as i32)
    .bind(job.revision as i64)
    .bind(job.lease_expires_at)
    .bind(job.updated_at)
    .bind(Json(job))
    .bind(guard.map(|r| r as i64))
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

fn decode(row: &PgRow) -> Result<GenerationJob, JobStoreError> {
    row.try_get::<Json<GenerationJob>, _>("document")
        .map(|Json(job)| job)
        .map_err(|e| JobStoreError::Serialization(format!("failed to decode job document: {e}")))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            JobStoreError::Serialization(format!("decode error in {operation}: {err}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}
