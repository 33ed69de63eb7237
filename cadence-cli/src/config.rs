//! Configuration module
//!
//! Handles CLI configuration and the connection to the job store.

use anyhow::{Context, Result};
use cadence_store::{JobService, PgJobStore, db};
use std::sync::Arc;

/// CLI configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string of the job store
    pub database_url: String,
}

impl Config {
    /// Connects to the store, runs migrations and builds the job service
    pub async fn connect(&self) -> Result<JobService> {
        tracing::debug!("Connecting to database...");

        let pool = db::create_pool(&self.database_url)
            .await
            .context("Failed to create database pool")?;

        db::run_migrations(&pool)
            .await
            .context("Failed to run database migrations")?;

        Ok(JobService::new(Arc::new(PgJobStore::new(pool))))
    }
}
