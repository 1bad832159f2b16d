//! Postgres-backed job store.
//!
//! The whole compare-and-set of [`JobStore::transition`] is a single
//! `UPDATE ... WHERE status = ANY(..) RETURNING ..` statement, so concurrent
//! workers serialize on the row lock and at most one of them sees a row back.
//! A miss is then classified with a plain `SELECT`: no row means `NotFound`,
//! anything else means the caller lost the race.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` (on `create`) |
//! | Database (check constraint violation) | `23514` | `Storage` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / Io / other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::instrument;

use docflow_core::{BlobRef, Job, JobError, JobId, JobStatus, JobUpdate, Owner, validate_transition};

use super::store::{JobStats, JobStore, JobStoreError};

/// Table definition, applied statement by statement by [`PostgresJobStore::ensure_schema`].
pub const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id            UUID PRIMARY KEY,
        owner         TEXT NOT NULL,
        status        TEXT NOT NULL CHECK (status IN
                          ('pending', 'queued', 'running', 'succeeded', 'failed', 'dead_lettered')),
        attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
        input_ref     TEXT,
        output_ref    TEXT,
        last_error    JSONB,
        created_at    TIMESTAMPTZ NOT NULL,
        updated_at    TIMESTAMPTZ NOT NULL,
        completed_at  TIMESTAMPTZ
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_status_updated_at_idx ON jobs (status, updated_at)",
    "CREATE INDEX IF NOT EXISTS jobs_owner_idx ON jobs (owner)",
];

const JOB_COLUMNS: &str = "id, owner, status, attempt_count, input_ref, output_ref, last_error, \
                           created_at, updated_at, completed_at";

/// Postgres-backed job store.
///
/// `Send + Sync`; clones share the pool.
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

    /// Open a pool against `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `jobs` table and its indexes if they do not exist.
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

    async fn current_status(&self, id: JobId) -> Result<Option<JobStatus>, JobStoreError> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("current_status", e))?;

        row.map(|r| {
            let status: String = r.try_get("status").map_err(|e| map_sqlx_error("current_status", e))?;
            parse_status(&status)
        })
        .transpose()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::Invalid(format!(
                "new jobs must be pending, got {}",
                job.status
            )));
        }

        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, owner, status, attempt_count, input_ref, output_ref,
                              last_error, created_at, updated_at, completed_at)
            VALUES ($1, $2, $3, $4, $5, NULL, NULL, $6, $7, NULL)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.owner.as_str())
        .bind(job.status.as_str())
        .bind(job.attempt_count as i32)
        .bind(job.input_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(e) if is_unique_violation(&e) => Err(JobStoreError::AlreadyExists(job.id)),
            Err(e) => Err(map_sqlx_error("create", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        match row {
            Some(row) => JobRow::decode(&row)?.try_into(),
            None => Err(JobStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self, update), fields(job_id = %id, to = %to), err(level = "debug"))]
    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, JobStoreError> {
        validate_transition(from, to, &update).map_err(|e| {
            // Status is irrelevant for request-shape errors.
            JobStoreError::from_domain(id, from.first().copied().unwrap_or(to), to, e)
        })?;

        let from_names: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                status        = $2,
                attempt_count = attempt_count + $3,
                output_ref    = $4,
                last_error    = $5,
                updated_at    = GREATEST(updated_at, now()),
                completed_at  = CASE WHEN $6 THEN GREATEST(updated_at, now()) ELSE NULL END
            WHERE id = $1
              AND status = ANY($7)
              AND ($8::INTEGER IS NULL OR attempt_count = $8)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(to.as_str())
        .bind(if update.increment_attempt { 1_i32 } else { 0_i32 })
        .bind(update.output_ref.as_ref().map(|r| r.as_str().to_string()))
        .bind(update.last_error.map(Json))
        .bind(to.is_terminal())
        .bind(&from_names)
        .bind(update.expect_attempt.map(|a| a as i32))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("transition", e))?;

        match row {
            Some(row) => JobRow::decode(&row)?.try_into(),
            None => match self.current_status(id).await? {
                Some(current) => Err(JobStoreError::Conflict {
                    id,
                    current,
                    attempted: to,
                }),
                None => Err(JobStoreError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err(level = "debug"))]
    async fn renew_claim(&self, id: JobId, attempt: u32) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET updated_at = GREATEST(updated_at, now())
            WHERE id = $1 AND status = 'running' AND attempt_count = $2
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(id.as_uuid())
        .bind(attempt as i32)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("renew_claim", e))?;

        match row {
            Some(row) => JobRow::decode(&row)?.try_into(),
            None => match self.current_status(id).await? {
                Some(current) => Err(JobStoreError::Conflict {
                    id,
                    current,
                    attempted: JobStatus::Running,
                }),
                None => Err(JobStoreError::NotFound(id)),
            },
        }
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE status = $1 AND updated_at <= $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(status.as_str())
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_stale", e))?;

        rows.iter().map(|row| JobRow::decode(row)?.try_into()).collect()
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("count_by_status", e))?;
            let count: i64 = row.try_get("count").map_err(|e| map_sqlx_error("count_by_status", e))?;
            stats.add(parse_status(&status)?, count.max(0) as u64);
        }
        Ok(stats)
    }
}

/// Map SQLx errors to job store errors.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {} ({}): {}",
                operation,
                code,
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => JobStoreError::Storage(format!("connection pool closed in {}", operation)),
        sqlx::Error::PoolTimedOut => JobStoreError::Storage(format!("connection pool timed out in {}", operation)),
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

fn parse_status(raw: &str) -> Result<JobStatus, JobStoreError> {
    raw.parse()
        .map_err(|_| JobStoreError::Storage(format!("unknown status in jobs table: {raw}")))
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    owner: String,
    status: String,
    attempt_count: i32,
    input_ref: Option<String>,
    output_ref: Option<String>,
    last_error: Option<Json<JobError>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn decode(row: &PgRow) -> Result<Self, JobStoreError> {
        Self::from_pg_row(row).map_err(|e| JobStoreError::Storage(format!("failed to decode job row: {}", e)))
    }

    fn from_pg_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            owner: row.try_get("owner")?,
            status: row.try_get("status")?,
            attempt_count: row.try_get("attempt_count")?,
            input_ref: row.try_get("input_ref")?,
            output_ref: row.try_get("output_ref")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |e: docflow_core::DomainError| JobStoreError::Storage(format!("corrupt job row {}: {}", row.id, e));

        Ok(Job {
            id: JobId::from_uuid(row.id),
            owner: Owner::new(row.owner.clone()).map_err(corrupt)?,
            status: parse_status(&row.status)?,
            attempt_count: row.attempt_count.max(0) as u32,
            input_ref: row.input_ref.clone().map(BlobRef::new).transpose().map_err(corrupt)?,
            output_ref: row.output_ref.clone().map(BlobRef::new).transpose().map_err(corrupt)?,
            last_error: row.last_error.map(|Json(e)| e),
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}
