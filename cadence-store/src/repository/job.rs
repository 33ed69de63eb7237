//! Job Repository
//!
//! Postgres implementation of `JobStore`.

use async_trait::async_trait;
use cadence_core::{DependencyRef, Job, JobId, JobState, RelatedEntity};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::{Result, StoreError};
use crate::repository::JobStore;

const JOB_COLUMNS: &str = r#"
    j.id, j.state, j.command, j.args, j.created_at, j.started_at, j.checked_at,
    j.closed_at, j.execute_after, j.interval_secs, j.expires_at, j.output,
    j.error_output, j.exit_code, j.max_runtime, j.max_retries, j.original_job_id,
    j.stack_trace, j.runtime, j.memory_usage, j.memory_usage_real
"#;

/// Job store backed by a Postgres connection pool
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Loads edges and retry links for each row
    async fn hydrate_all(&self, rows: Vec<JobRow>) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            jobs.push(self.hydrate(row).await?);
        }
        Ok(jobs)
    }

    async fn hydrate(&self, row: JobRow) -> Result<Job> {
        let id = row.id;

        let dependencies = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT d.dest_job_id, j.state
            FROM job_dependencies d
            INNER JOIN jobs j ON j.id = d.dest_job_id
            WHERE d.source_job_id = $1
            ORDER BY d.dest_job_id ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let retry_jobs = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM jobs WHERE original_job_id = $1 ORDER BY id ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let related = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT related_kind, related_id
            FROM job_related_entities
            WHERE job_id = $1
            ORDER BY related_kind, related_id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        let mut job = row.into_job()?;
        job.dependencies = dependencies
            .into_iter()
            .map(|(dep_id, state)| {
                Ok(DependencyRef {
                    id: JobId(dep_id),
                    state: state.parse::<JobState>()?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        job.retry_jobs = retry_jobs.into_iter().map(JobId).collect();
        job.related_entities = related
            .into_iter()
            .map(|(kind, id)| RelatedEntity::new(kind, id))
            .collect();

        Ok(job)
    }

    async fn fetch_one(&self, sql: &str, id: i64) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &mut Job) -> Result<JobId> {
        let args = serde_json::to_value(&job.args)?;
        let mut tx = self.pool.begin().await?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                state, command, args, created_at, started_at, checked_at, closed_at,
                execute_after, interval_secs, expires_at, output, error_output, exit_code,
                max_runtime, max_retries, original_job_id, stack_trace, runtime,
                memory_usage, memory_usage_real
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            RETURNING id
            "#,
        )
        .bind(job.state().as_str())
        .bind(&job.command)
        .bind(args)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.checked_at)
        .bind(job.closed_at)
        .bind(job.execute_after)
        .bind(job.interval.map(to_i64).transpose()?)
        .bind(job.expires_at)
        .bind(&job.output)
        .bind(&job.error_output)
        .bind(job.exit_code)
        .bind(to_i64(job.max_runtime)?)
        .bind(to_i32(job.max_retries)?)
        .bind(job.original_job.map(JobId::get))
        .bind(&job.stack_trace)
        .bind(job.runtime.map(to_i64).transpose()?)
        .bind(job.memory_usage.map(to_i64).transpose()?)
        .bind(job.memory_usage_real.map(to_i64).transpose()?)
        .fetch_one(&mut *tx)
        .await?;

        write_edges(&mut tx, id, job).await?;
        tx.commit().await?;

        let id = JobId(id);
        job.id = Some(id);
        job.mark_persisted();
        Ok(id)
    }

    async fn update(&self, job: &mut Job) -> Result<()> {
        let id = job.id.ok_or_else(|| cadence_core::JobError::NotPersisted {
            job: job.to_string(),
        })?;
        let expected = job
            .persisted_state()
            .ok_or_else(|| cadence_core::JobError::NotPersisted {
                job: job.to_string(),
            })?;

        let mut tx = self.pool.begin().await?;

        // The state guard turns concurrent claims and close-outs into conflicts.
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $3, started_at = $4, checked_at = $5, closed_at = $6,
                execute_after = $7, interval_secs = $8, expires_at = $9, output = $10,
                error_output = $11, exit_code = $12, max_runtime = $13, max_retries = $14,
                original_job_id = $15, stack_trace = $16, runtime = $17,
                memory_usage = $18, memory_usage_real = $19
            WHERE id = $1 AND state = $2
            "#,
        )
        .bind(id.get())
        .bind(expected.as_str())
        .bind(job.state().as_str())
        .bind(job.started_at)
        .bind(job.checked_at)
        .bind(job.closed_at)
        .bind(job.execute_after)
        .bind(job.interval.map(to_i64).transpose()?)
        .bind(job.expires_at)
        .bind(&job.output)
        .bind(&job.error_output)
        .bind(job.exit_code)
        .bind(to_i64(job.max_runtime)?)
        .bind(to_i32(job.max_retries)?)
        .bind(job.original_job.map(JobId::get))
        .bind(&job.stack_trace)
        .bind(job.runtime.map(to_i64).transpose()?)
        .bind(job.memory_usage.map(to_i64).transpose()?)
        .bind(job.memory_usage_real.map(to_i64).transpose()?)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::Conflict { id, expected });
        }

        write_edges(&mut tx, id.get(), job).await?;
        tx.commit().await?;

        job.mark_persisted();
        Ok(())
    }

    async fn delete(&self, id: JobId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.get())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs j WHERE j.id = $1");
        self.fetch_one(&sql, id.get()).await
    }

    async fn find_pending_job(
        &self,
        excluded_ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let excluded: Vec<i64> = excluded_ids.iter().map(|id| id.get()).collect();
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            WHERE j.state = 'pending'
              AND j.execute_after < $1
              AND NOT (j.id = ANY($2))
            ORDER BY j.created_at DESC, j.id DESC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(now)
            .bind(excluded)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_by_state(&self, state: JobState) -> Result<Vec<Job>> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j WHERE j.state = $1 ORDER BY j.created_at ASC, j.id ASC"
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await?;

        self.hydrate_all(rows).await
    }

    async fn find_job(&self, command: &str, args: &[String]) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            WHERE j.command = $1 AND j.args = $2
            ORDER BY j.id ASC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(command)
            .bind(serde_json::to_value(args)?)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_incoming_dependencies(&self, id: JobId) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            INNER JOIN job_dependencies d ON d.source_job_id = j.id
            WHERE d.dest_job_id = $1
            ORDER BY j.id ASC
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.get())
            .fetch_all(&self.pool)
            .await?;

        self.hydrate_all(rows).await
    }

    async fn find_all_for_related_entity(&self, entity: &RelatedEntity) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            INNER JOIN job_related_entities r ON r.job_id = j.id
            WHERE r.related_kind = $1 AND r.related_id = $2
            ORDER BY j.id ASC
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&entity.kind)
            .bind(&entity.id)
            .fetch_all(&self.pool)
            .await?;

        self.hydrate_all(rows).await
    }

    async fn find_job_for_related_entity(
        &self,
        command: &str,
        entity: &RelatedEntity,
    ) -> Result<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            INNER JOIN job_related_entities r ON r.job_id = j.id
            WHERE r.related_kind = $1 AND r.related_id = $2 AND j.command = $3
            ORDER BY j.id ASC
            LIMIT 1
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(&entity.kind)
            .bind(&entity.id)
            .bind(command)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_last_jobs_with_error(&self, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            WHERE j.state IN ('failed', 'terminated') AND j.original_job_id IS NULL
            ORDER BY j.closed_at DESC NULLS LAST, j.id DESC
            LIMIT $1
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(to_i64(limit as u64)?)
            .fetch_all(&self.pool)
            .await?;

        self.hydrate_all(rows).await
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs j
            WHERE ($1::TEXT IS NULL OR j.state = $1)
            ORDER BY j.created_at DESC, j.id DESC
            LIMIT $2
            "#
        );

        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(state.map(|s| s.as_str()))
            .bind(to_i64(limit as u64)?)
            .fetch_all(&self.pool)
            .await?;

        self.hydrate_all(rows).await
    }
}

/// Adds missing dependency edges and related entities of `job`
async fn write_edges(tx: &mut Transaction<'_, Postgres>, id: i64, job: &Job) -> Result<()> {
    for dep in &job.dependencies {
        sqlx::query(
            r#"
            INSERT INTO job_dependencies (source_job_id, dest_job_id)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(dep.id.get())
        .execute(&mut **tx)
        .await?;
    }

    for entity in &job.related_entities {
        sqlx::query(
            r#"
            INSERT INTO job_related_entities (job_id, related_kind, related_id)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(id)
        .bind(&entity.kind)
        .bind(&entity.id)
        .execute(&mut **tx)
        .await?;
    }

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} does not fit BIGINT")))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{value} does not fit INTEGER")))
}

fn to_u64(column: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} is negative: {value}")))
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: i64,
    state: String,
    command: String,
    args: serde_json::Value,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    checked_at: Option<DateTime<Utc>>,
    closed_at: Option<DateTime<Utc>>,
    execute_after: DateTime<Utc>,
    interval_secs: Option<i64>,
    expires_at: Option<DateTime<Utc>>,
    output: Option<String>,
    error_output: Option<String>,
    exit_code: Option<i32>,
    max_runtime: i64,
    max_retries: i32,
    original_job_id: Option<i64>,
    stack_trace: Option<String>,
    runtime: Option<i64>,
    memory_usage: Option<i64>,
    memory_usage_real: Option<i64>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let state = self.state.parse::<JobState>()?;
        let args: Vec<String> = serde_json::from_value(self.args)?;

        let mut job = Job::new(self.command, args);
        job.created_at = self.created_at;
        job.started_at = self.started_at;
        job.checked_at = self.checked_at;
        job.closed_at = self.closed_at;
        job.execute_after = self.execute_after;
        job.interval = self
            .interval_secs
            .map(|v| to_u64("interval_secs", v))
            .transpose()?;
        job.expires_at = self.expires_at;
        job.output = self.output;
        job.error_output = self.error_output;
        job.exit_code = self.exit_code;
        job.max_runtime = to_u64("max_runtime", self.max_runtime)?;
        job.max_retries = u32::try_from(self.max_retries).map_err(|_| {
            StoreError::Corrupt(format!("max_retries is negative: {}", self.max_retries))
        })?;
        job.original_job = self.original_job_id.map(JobId);
        job.stack_trace = self.stack_trace;
        job.runtime = self.runtime.map(|v| to_u64("runtime", v)).transpose()?;
        job.memory_usage = self
            .memory_usage
            .map(|v| to_u64("memory_usage", v))
            .transpose()?;
        job.memory_usage_real = self
            .memory_usage_real
            .map(|v| to_u64("memory_usage_real", v))
            .transpose()?;

        Ok(job.restored(JobId(self.id), state))
    }
}
