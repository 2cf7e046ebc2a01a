//! Background jobs for async Rust.
//!
//! Jobs are plain serializable types implementing [`job::Job`]. They are dispatched onto named
//! queues of a [`backend::Backend`] and later claimed and run by a [`Worker`], which retries
//! failures up to each job's attempt budget, enforces optional rate limits and records jobs that
//! failed for good in the backend's failed store.
//!
//! ```
//! use drudge::{backend::memory::InMemoryBackend, prelude::*};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendMail {
//!     to: String,
//! }
//!
//! #[async_trait]
//! impl Job for SendMail {
//!     const NAME: &'static str = "send_mail";
//!
//!     async fn run(&self) -> ExecutionResult {
//!         ExecutionResult::Done
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let backend = InMemoryBackend::new();
//! SendMail { to: "ada@example.com".to_owned() }
//!     .dispatch()
//!     .enqueue_to_backend(&backend)
//!     .await?;
//!
//! let worker = Worker::new(
//!     backend,
//!     JobRegistry::new().register::<SendMail>(),
//!     WorkerConfig::new().with_cooldown(std::time::Duration::from_millis(10)),
//! );
//! let report = worker.run().await?;
//! assert_eq!(report.processed, 1);
//! # Ok::<_, DrudgeError>(())
//! # }).unwrap();
//! ```
pub mod backend;
pub mod backoff;
pub mod clock;
pub mod job;
pub mod lifecycle;
pub mod prelude;
pub mod rate_limit;
pub mod registry;
pub mod worker;

use backend::BackendError;
use rate_limit::RateLimitError;
use thiserror::Error;

pub use worker::{Worker, WorkerConfig, WorkerReport};

#[derive(Debug, Error)]
pub enum DrudgeError {
    #[error("Error communicating with the backend: {0}")]
    Backend(#[from] BackendError),
    #[error("Invalid rate limit: {0}")]
    RateLimit(#[from] RateLimitError),
    #[error("Job {job_type} declares a rate limit but the worker has no rate limiter")]
    RateLimiterNotConfigured { job_type: String },
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
}
