//! Storage for dispatched jobs.
//!
//! A [`Backend`] keeps pending and reserved jobs plus a store of jobs that failed for good. The
//! worker only talks to storage through this trait, so every backend must honour the same
//! contract:
//!
//! - [`Backend::claim_next`] hands a job to at most one caller, picking from the first queue in
//!   the given order that holds a due job, earliest `available_at` first.
//! - a reservation whose `reserved_at` is older than the backend's staleness threshold is
//!   reclaimable and counts as a spent attempt, without ever raising `attempts` past
//!   `max_attempts`. Workers keep a running job's reservation fresh with [`Backend::heartbeat`].
//! - [`Backend::release`], [`Backend::delete`] and [`Backend::mark_failed`] only act on the
//!   reservation identified by the record's `reserved_at`. Once a job has been reclaimed the
//!   previous holder can no longer resolve it.
//! - [`Backend::release`] returns a job to pending and consumes an attempt.
//! - [`Backend::delete`] is idempotent.
//!
//! [`testing`] holds a conformance suite, exposed through [`test_suite!`](crate::test_suite),
//! that backend implementations run against themselves.
use std::{error::Error, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::job::{JobFailure, JobId, JobStatus};

pub mod memory;
pub mod null;
pub mod sync;
#[doc(hidden)]
pub mod testing;

/// How long a reservation may go without being resolved before another worker can reclaim it.
pub const DEFAULT_STALE_AFTER: TimeDelta = TimeDelta::seconds(90);

#[async_trait]
pub trait Backend: Send + Sync {
    /// Stores a new pending job, available once its delay has elapsed.
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError>;
    /// Atomically reserves the next due job from `queues`.
    async fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, BackendError>;
    /// Moves the reservation of a running job to now, so it is not reclaimed as stale.
    ///
    /// Returns the new `reserved_at`, or [`BackendError::JobNotFound`] when `job` no longer holds
    /// its reservation.
    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError>;
    /// Returns a reserved job to pending, available from `available_at`.
    async fn release(
        &self,
        job: &JobRecord,
        available_at: DateTime<Utc>,
    ) -> Result<(), BackendError>;
    /// Removes a reserved job. Deleting a job that no longer exists, or that was reclaimed by
    /// another worker, succeeds without touching it.
    async fn delete(&self, job: &JobRecord) -> Result<(), BackendError>;
    /// Moves a reserved job into the failed store.
    async fn mark_failed(&self, job: &JobRecord, failure: &JobFailure)
        -> Result<(), BackendError>;
    /// Counts the pending jobs on `queue`.
    async fn size(&self, queue: &str) -> Result<u64, BackendError>;
    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, BackendError>;
    /// Moves a failed job back onto its queue with a fresh attempt budget.
    async fn retry_failed(&self, id: JobId) -> Result<(), BackendError>;
    async fn forget_failed(&self, id: JobId) -> Result<(), BackendError>;
    /// Deletes failed jobs recorded at least `older_than` ago, returning how many were removed.
    async fn prune_failed(&self, older_than: TimeDelta) -> Result<u64, BackendError>;
}

#[async_trait]
impl<B> Backend for Arc<B>
where
    B: Backend + ?Sized,
{
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        self.as_ref().enqueue(job).await
    }

    async fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, BackendError> {
        self.as_ref().claim_next(queues).await
    }

    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError> {
        self.as_ref().heartbeat(job).await
    }

    async fn release(
        &self,
        job: &JobRecord,
        available_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        self.as_ref().release(job, available_at).await
    }

    async fn delete(&self, job: &JobRecord) -> Result<(), BackendError> {
        self.as_ref().delete(job).await
    }

    async fn mark_failed(
        &self,
        job: &JobRecord,
        failure: &JobFailure,
    ) -> Result<(), BackendError> {
        self.as_ref().mark_failed(job, failure).await
    }

    async fn size(&self, queue: &str) -> Result<u64, BackendError> {
        self.as_ref().size(queue).await
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, BackendError> {
        self.as_ref().failed_jobs().await
    }

    async fn retry_failed(&self, id: JobId) -> Result<(), BackendError> {
        self.as_ref().retry_failed(id).await
    }

    async fn forget_failed(&self, id: JobId) -> Result<(), BackendError> {
        self.as_ref().forget_failed(id).await
    }

    async fn prune_failed(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        self.as_ref().prune_failed(older_than).await
    }
}

/// A job ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuableJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub max_attempts: u16,
    /// Offset from the backend's notion of now at which the job becomes claimable.
    pub delay: TimeDelta,
}

impl EnqueuableJob {
    /// Builds the pending record for this job as of `now`.
    pub fn into_record(self, id: JobId, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            available_at: now + self.delay,
            reserved_at: None,
            created_at: now,
        }
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    /// Attempts already spent. Incremented when the job is released, reclaimed after going
    /// stale, or failed. Never exceeds `max_attempts`.
    pub attempts: u16,
    pub max_attempts: u16,
    pub available_at: DateTime<Utc>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Whether another attempt is allowed after the current one.
    pub fn has_attempts_remaining(&self) -> bool {
        self.attempts.saturating_add(1) < self.max_attempts
    }

    /// Whether every attempt was spent before this reservation, which happens when the final
    /// attempt went stale.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Whether `self` is the reservation `stored` is currently held under.
    pub fn holds(&self, stored: &JobRecord) -> bool {
        stored.status == JobStatus::Reserved && stored.reserved_at == self.reserved_at
    }

    /// Whether a worker may claim this job: pending and due, or reserved before `stale_cutoff`.
    pub fn is_claimable(&self, now: DateTime<Utc>, stale_cutoff: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => self.available_at <= now,
            JobStatus::Reserved => self.reserved_at.is_some_and(|at| at <= stale_cutoff),
            JobStatus::Failed => false,
        }
    }

    /// Marks the job reserved at `now`. Reclaiming a stale reservation spends an attempt.
    pub fn reserve(&mut self, now: DateTime<Utc>) {
        if self.status == JobStatus::Reserved {
            self.attempts = self.spend_attempt();
        }
        self.status = JobStatus::Reserved;
        self.reserved_at = Some(now);
    }

    fn spend_attempt(&self) -> u16 {
        self.attempts.saturating_add(1).min(self.max_attempts)
    }

    pub fn into_failed(self, failure: &JobFailure, failed_at: DateTime<Utc>) -> FailedJob {
        let attempts = self.spend_attempt();
        FailedJob {
            id: self.id,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            attempts,
            max_attempts: self.max_attempts,
            created_at: self.created_at,
            error_type: failure.error_type.as_str().to_owned(),
            message: failure.message.clone(),
            failed_at,
        }
    }
}

/// A job that exhausted its attempts or could not be run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedJob {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    /// Attempts spent, including the final one.
    pub attempts: u16,
    pub max_attempts: u16,
    pub created_at: DateTime<Utc>,
    pub error_type: String,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedJob {
    /// The pending record a retried failed job goes back to, with its attempts reset.
    pub fn into_retry(self, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: self.id,
            queue: self.queue,
            job_type: self.job_type,
            payload: self.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: self.max_attempts,
            available_at: now,
            reserved_at: None,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
    #[error("System in bad state")]
    BadState,
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    #[error("Stored job record is malformed: {0}")]
    Corrupt(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(#[source] Box<dyn Error + Send + Sync>),
    #[error("Job failed while running synchronously: {0}")]
    SyncExecution(JobFailure),
}

impl BackendError {
    pub fn unavailable(error: impl Error + Send + Sync + 'static) -> Self {
        Self::Unavailable(Box::new(error))
    }
}
