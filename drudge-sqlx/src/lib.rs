//! A Postgres [`Backend`](drudge::backend::Backend) for drudge built on [`sqlx`].
//!
//! Jobs live in `drudge_jobs`, failed jobs in `drudge_failed_jobs` and rate limit counters in
//! `drudge_rate_limits`. The tables are created by the migrations embedded in this crate, which
//! [`DrudgePgBackend::from_pool`] runs on construction.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the same tables
//! without handing a job to more than one of them.
//!
//! ```no_run
//! use drudge::{prelude::*, rate_limit::RateLimiter};
//! use drudge_sqlx::{DrudgePgBackend, PgCounterStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = DrudgePgBackend::from_db_url("postgres://localhost/app").await?;
//! let limiter = RateLimiter::new(PgCounterStore::from(&backend));
//! let worker = Worker::new(backend, JobRegistry::new(), WorkerConfig::new())
//!     .with_rate_limiter(limiter);
//! # Ok(())
//! # }
//! ```
use std::time::Duration;

use async_trait::async_trait;
use chrono::TimeDelta;
use drudge::{
    backend::{BackendError, DEFAULT_STALE_AFTER},
    rate_limit::{CounterStore, CounterStoreError},
};
use sqlx::{postgres::PgPoolOptions, PgPool};

mod backend;
mod types;

/// A Postgres implementation of [`drudge::backend::Backend`].
#[derive(Clone, Debug)]
pub struct DrudgePgBackend {
    pool: PgPool,
    stale_after: TimeDelta,
}

impl DrudgePgBackend {
    /// Creates a backend on an existing pool, running the embedded migrations.
    pub async fn from_pool(pool: PgPool) -> Result<Self, BackendError> {
        let this = Self {
            pool,
            stale_after: DEFAULT_STALE_AFTER,
        };
        this.run_migrations().await?;
        Ok(this)
    }

    /// Connects to `db_url` and creates a backend on the resulting pool.
    pub async fn from_db_url(db_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .connect(db_url)
            .await
            .map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Sets how long a reservation lasts before another worker can reclaim the job.
    pub fn with_stale_after(self, stale_after: TimeDelta) -> Self {
        Self {
            stale_after,
            ..self
        }
    }

    async fn run_migrations(&self) -> Result<(), BackendError> {
        tracing::info!("Running drudge migrations");
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .map_err(BackendError::unavailable)
    }
}

impl std::ops::Deref for DrudgePgBackend {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

/// A [`CounterStore`] keeping rate limit windows in `drudge_rate_limits`.
#[derive(Clone, Debug)]
pub struct PgCounterStore {
    pool: PgPool,
}

impl From<&DrudgePgBackend> for PgCounterStore {
    fn from(backend: &DrudgePgBackend) -> Self {
        Self {
            pool: backend.pool.clone(),
        }
    }
}

impl From<PgPool> for PgCounterStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgCounterStore {
    /// Deletes counters whose window has closed, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, BackendError> {
        sqlx::query("DELETE FROM drudge_rate_limits WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected())
            .map_err(map_err)
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"INSERT INTO drudge_rate_limits AS limits (key, count, expires_at)
            VALUES ($1, 1, now() + make_interval(secs => $2))
            ON CONFLICT (key) DO UPDATE SET
                count = CASE WHEN limits.expires_at <= now() THEN 1 ELSE limits.count + 1 END,
                expires_at = CASE WHEN limits.expires_at <= now()
                    THEN EXCLUDED.expires_at ELSE limits.expires_at END
            RETURNING count"#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.unsigned_abs())
    }
}

pub(crate) fn map_err(error: sqlx::Error) -> BackendError {
    match error {
        sqlx::Error::Decode(_) | sqlx::Error::ColumnDecode { .. } => {
            BackendError::Corrupt(error.to_string())
        }
        error => BackendError::unavailable(error),
    }
}

/// `delta` as fractional seconds, the unit `make_interval` takes.
pub(crate) fn seconds(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}
