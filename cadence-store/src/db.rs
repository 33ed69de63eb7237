use sqlx::{PgPool, postgres::PgPoolOptions};
use std::time::Duration;

pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    // Create jobs table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id BIGSERIAL PRIMARY KEY,
            state VARCHAR(15) NOT NULL,
            command VARCHAR(255) NOT NULL,
            args JSONB NOT NULL DEFAULT '[]',
            created_at TIMESTAMPTZ NOT NULL,
            started_at TIMESTAMPTZ,
            checked_at TIMESTAMPTZ,
            closed_at TIMESTAMPTZ,
            execute_after TIMESTAMPTZ NOT NULL,
            interval_secs BIGINT,
            expires_at TIMESTAMPTZ,
            output TEXT,
            error_output TEXT,
            exit_code INTEGER,
            max_runtime BIGINT NOT NULL DEFAULT 0,
            max_retries INTEGER NOT NULL DEFAULT 0,
            original_job_id BIGINT REFERENCES jobs(id) ON DELETE SET NULL,
            stack_trace TEXT,
            runtime BIGINT,
            memory_usage BIGINT,
            memory_usage_real BIGINT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create dependency edges: source waits for dest
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_dependencies (
            source_job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            dest_job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            PRIMARY KEY (source_job_id, dest_job_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create related entity side table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_related_entities (
            job_id BIGINT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
            related_kind VARCHAR(150) NOT NULL,
            related_id VARCHAR(255) NOT NULL,
            PRIMARY KEY (job_id, related_kind, related_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for the selection and close-out queries
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_selection ON jobs(state, execute_after, created_at DESC)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_command ON jobs(command)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_original_job_id ON jobs(original_job_id)")
        .execute(pool)
        .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_closed_at ON jobs(closed_at DESC)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_dependencies_dest ON job_dependencies(dest_job_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_related_entities_lookup ON job_related_entities(related_kind, related_id)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
