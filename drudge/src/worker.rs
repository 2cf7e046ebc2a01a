//! The worker loop: claim, run, resolve, repeat.
//!
//! Each iteration first checks whether the worker should stop, then claims the next due job
//! from the configured queues in priority order. When nothing is due the worker sleeps for the
//! poll interval, waking early on shutdown or when the cooldown deadline passes. A claimed job
//! is always resolved before the stop conditions are checked again, so shutdown never abandons a
//! job half way.
//!
//! While a job runs the worker renews its reservation every heartbeat interval. The interval
//! must stay well below the backend's staleness threshold, otherwise a long running job is
//! reclaimed and run by a second worker.
use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use tokio::{
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    backend::{Backend, BackendError, JobRecord},
    clock::{Clock, SystemClock},
    job::{
        runner::{self, Outcome},
        ErrorType, JobFailure,
    },
    lifecycle::{self, ExitReason, Lifecycle},
    rate_limit::{default_key, Admission, RateLimiter},
    registry::{DynJob, JobRegistry},
    DrudgeError,
};

const DEFAULT_QUEUE: &str = "default";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Settings for a [`Worker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    queues: Vec<String>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    cooldown: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: vec![DEFAULT_QUEUE.to_owned()],
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cooldown: None,
        }
    }
}

impl WorkerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queues to work, highest priority first.
    pub fn with_queues<I, Q>(self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// How long to sleep when no job is due.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    /// How often a running job's reservation is renewed. Defaults to a third of
    /// [`DEFAULT_STALE_AFTER`](crate::backend::DEFAULT_STALE_AFTER).
    pub fn with_heartbeat_interval(self, heartbeat_interval: Duration) -> Self {
        Self {
            heartbeat_interval: heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL),
            ..self
        }
    }

    /// Stops the worker once `cooldown` has elapsed since it started. A zero cooldown disables
    /// the deadline.
    pub fn with_cooldown(self, cooldown: Duration) -> Self {
        Self {
            cooldown: (!cooldown.is_zero()).then_some(cooldown),
            ..self
        }
    }

    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn cooldown(&self) -> Option<Duration> {
        self.cooldown
    }
}

/// What a finished [`Worker::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerReport {
    pub exit: ExitReason,
    /// Jobs claimed from the backend.
    pub claimed: u64,
    /// Jobs that ran successfully and were deleted.
    pub processed: u64,
    /// Jobs put back on their queue for another attempt.
    pub released: u64,
    /// Jobs moved to the failed store.
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Tally {
    claimed: u64,
    processed: u64,
    released: u64,
    failed: u64,
}

impl Tally {
    fn finish(self, exit: ExitReason) -> WorkerReport {
        WorkerReport {
            exit,
            claimed: self.claimed,
            processed: self.processed,
            released: self.released,
            failed: self.failed,
        }
    }
}

/// Runs jobs from a backend until shutdown or cooldown.
///
/// # Example
///
/// ```no_run
/// # use drudge::prelude::*;
/// # use drudge::backend::memory::InMemoryBackend;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct SendMail;
/// # #[async_trait]
/// # impl Job for SendMail {
/// #     const NAME: &'static str = "send_mail";
/// #     async fn run(&self) -> ExecutionResult { ExecutionResult::Done }
/// # }
/// # async fn example() -> Result<(), DrudgeError> {
/// let worker = Worker::new(
///     InMemoryBackend::new(),
///     JobRegistry::new().register::<SendMail>(),
///     WorkerConfig::new().with_queues(["emails", "default"]),
/// );
/// let _signals = worker.listen_for_signals();
/// let report = worker.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: JobRegistry,
    rate_limiter: Option<RateLimiter>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(backend: impl Backend + 'static, registry: JobRegistry, config: WorkerConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            registry,
            rate_limiter: None,
            clock: Arc::new(SystemClock),
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Enables rate limited jobs. Without a limiter, claiming a job that declares a rate limit
    /// stops the worker with [`DrudgeError::RateLimiterNotConfigured`].
    pub fn with_rate_limiter(self, rate_limiter: RateLimiter) -> Self {
        Self {
            rate_limiter: Some(rate_limiter),
            ..self
        }
    }

    /// Reads "now" from `clock` when scheduling retries.
    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// Uses `shutdown` to stop the worker, for sharing one token between several tasks.
    pub fn with_shutdown_token(self, shutdown: CancellationToken) -> Self {
        Self { shutdown, ..self }
    }

    /// A token which, once cancelled, stops the worker after its current job.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Requests shutdown when the process receives SIGTERM or SIGINT.
    pub fn listen_for_signals(&self) -> JoinHandle<()> {
        lifecycle::listen_for_signals(self.shutdown.clone())
    }

    /// Processes jobs until shutdown is requested or the cooldown elapses.
    ///
    /// Backend failures and rate limit misconfiguration end the run with an error.
    pub async fn run(&self) -> Result<WorkerReport, DrudgeError> {
        let lifecycle = Lifecycle::start(self.shutdown.clone(), self.config.cooldown);
        let mut tally = Tally::default();
        tracing::info!(queues = ?self.config.queues, "Worker started");

        let exit = loop {
            if let Some(reason) = lifecycle.stop_reason() {
                break reason;
            }
            match self.backend.claim_next(&self.config.queues).await? {
                Some(record) => {
                    tally.claimed += 1;
                    self.process(record, &mut tally).await?;
                }
                None => lifecycle.idle(self.config.poll_interval).await,
            }
        };

        let report = tally.finish(exit);
        tracing::info!(
            ?exit,
            processed = report.processed,
            released = report.released,
            failed = report.failed,
            "Worker stopped"
        );
        Ok(report)
    }

    #[instrument(
        skip_all,
        fields(job_id = %record.id, queue = %record.queue, job_type = %record.job_type, attempts = record.attempts)
    )]
    async fn process(&self, mut record: JobRecord, tally: &mut Tally) -> Result<(), DrudgeError> {
        if record.is_exhausted() {
            let failure = JobFailure::new(
                ErrorType::MaxAttemptsExceeded,
                format!("reservation went stale after {} attempts", record.attempts),
            );
            tracing::error!(%failure, "Job {} failed: {failure}", record.id);
            tolerate_missing(self.backend.mark_failed(&record, &failure).await)?;
            tally.failed += 1;
            if let Ok(job) = self.registry.decode(&record) {
                runner::after_failure(job, record.id, failure).await;
            }
            return Ok(());
        }

        let job = match self.registry.decode(&record) {
            Ok(job) => job,
            Err(failure) => {
                tracing::error!(%failure, "Job {} cannot be run: {failure}", record.id);
                tolerate_missing(self.backend.mark_failed(&record, &failure).await)?;
                tally.failed += 1;
                return Ok(());
            }
        };

        if let Some(limit) = job.rate_limit() {
            let limiter = self.rate_limiter.as_ref().ok_or_else(|| {
                DrudgeError::RateLimiterNotConfigured {
                    job_type: record.job_type.clone(),
                }
            })?;
            if let Admission::Denied { retry_in } =
                limiter.admit(&limit, &default_key(job.name())).await?
            {
                tracing::debug!(%retry_in, "Job {} is rate limited", record.id);
                let failure = JobFailure::new(
                    ErrorType::RateLimited,
                    "rate limit denied every attempt",
                );
                return self
                    .retry_or_fail(job, &record, retry_in, failure, tally)
                    .await;
            }
        }

        tracing::debug!("Running job {}", record.id);
        match self.execute(job.clone(), &mut record).await {
            Outcome::Done => {
                tolerate_missing(self.backend.delete(&record).await)?;
                tally.processed += 1;
                tracing::info!("Job {} processed", record.id);
                runner::after_success(job, record.id).await;
                Ok(())
            }
            Outcome::Release { delay } => {
                let failure = JobFailure::new(
                    ErrorType::MaxAttemptsExceeded,
                    format!("released after {} attempts", record.max_attempts),
                );
                self.retry_or_fail(job, &record, delay, failure, tally).await
            }
            Outcome::Failed(failure) => {
                let delay = job.retry_after(record.attempts);
                self.retry_or_fail(job, &record, delay, failure, tally).await
            }
        }
    }

    /// Runs `job`, renewing the reservation in `record` on every heartbeat until it finishes.
    async fn execute(&self, job: Arc<dyn DynJob>, record: &mut JobRecord) -> Outcome {
        let run = runner::execute(job);
        tokio::pin!(run);
        let period = self.config.heartbeat_interval;
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut held = true;

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = heartbeat.tick(), if held => match self.backend.heartbeat(record).await {
                    Ok(reserved_at) => record.reserved_at = Some(reserved_at),
                    Err(BackendError::JobNotFound(_)) => {
                        tracing::warn!("Job {} lost its reservation while running", record.id);
                        held = false;
                    }
                    Err(error) => {
                        tracing::warn!(%error, "Failed to renew reservation of job {}", record.id);
                    }
                },
            }
        }
    }

    async fn retry_or_fail(
        &self,
        job: Arc<dyn DynJob>,
        record: &JobRecord,
        delay: TimeDelta,
        failure: JobFailure,
        tally: &mut Tally,
    ) -> Result<(), DrudgeError> {
        if record.has_attempts_remaining() {
            let available_at = self.clock.now() + delay;
            tracing::warn!(
                %failure,
                %available_at,
                "Job {} will be retried at {available_at}: {failure}",
                record.id
            );
            tolerate_missing(self.backend.release(record, available_at).await)?;
            tally.released += 1;
        } else {
            tracing::error!(%failure, "Job {} failed: {failure}", record.id);
            tolerate_missing(self.backend.mark_failed(record, &failure).await)?;
            tally.failed += 1;
            runner::after_failure(job, record.id, failure).await;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("rate_limiter", &self.rate_limiter)
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// A job deleted from under a worker has nothing left to resolve.
fn tolerate_missing(result: Result<(), BackendError>) -> Result<(), BackendError> {
    match result {
        Err(BackendError::JobNotFound(id)) => {
            tracing::warn!(job_id = %id, "Job {id} disappeared before it could be resolved");
            Ok(())
        }
        other => other,
    }
}
