//! A [`Backend`] that runs jobs inline as they are dispatched.
//!
//! Nothing is stored: [`Backend::enqueue`] decodes the job through the registry, runs it to
//! completion before returning, then calls the matching hook. A failing run surfaces to the dispatcher as
//! [`BackendError::SyncExecution`]. Delays, attempts and releases have no meaning here and are
//! ignored.
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    job::{
        runner::{self, Outcome},
        JobFailure, JobId,
    },
    registry::JobRegistry,
};

use super::{Backend, BackendError, EnqueuableJob, FailedJob, JobRecord};

#[derive(Debug, Clone)]
pub struct SyncBackend {
    registry: Arc<JobRegistry>,
    id_counter: Arc<AtomicI64>,
}

impl SyncBackend {
    pub fn new(registry: JobRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            id_counter: Default::default(),
        }
    }
}

#[async_trait]
impl Backend for SyncBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = JobId::from(self.id_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let record = job.into_record(id, Utc::now());
        let job = self
            .registry
            .decode(&record)
            .map_err(BackendError::SyncExecution)?;

        tracing::debug!(job_id = %id, job_type = %record.job_type, "Running job {id} inline");
        match runner::execute(job.clone()).await {
            Outcome::Done => {
                runner::after_success(job, id).await;
                Ok(id)
            }
            Outcome::Release { delay } => {
                tracing::debug!(job_id = %id, %delay, "Ignoring release of inline job {id}");
                Ok(id)
            }
            Outcome::Failed(failure) => {
                runner::after_failure(job, id, failure.clone()).await;
                Err(BackendError::SyncExecution(failure))
            }
        }
    }

    async fn claim_next(&self, _queues: &[String]) -> Result<Option<JobRecord>, BackendError> {
        Ok(None)
    }

    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError> {
        Err(BackendError::JobNotFound(job.id))
    }

    async fn release(
        &self,
        job: &JobRecord,
        _available_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        Err(BackendError::JobNotFound(job.id))
    }

    async fn delete(&self, _job: &JobRecord) -> Result<(), BackendError> {
        Ok(())
    }

    async fn mark_failed(
        &self,
        job: &JobRecord,
        _failure: &JobFailure,
    ) -> Result<(), BackendError> {
        Err(BackendError::JobNotFound(job.id))
    }

    async fn size(&self, _queue: &str) -> Result<u64, BackendError> {
        Ok(0)
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, BackendError> {
        Ok(Vec::new())
    }

    async fn retry_failed(&self, id: JobId) -> Result<(), BackendError> {
        Err(BackendError::JobNotFound(id))
    }

    async fn forget_failed(&self, id: JobId) -> Result<(), BackendError> {
        Err(BackendError::JobNotFound(id))
    }

    async fn prune_failed(&self, _older_than: TimeDelta) -> Result<u64, BackendError> {
        Ok(0)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::job::{test::MockError, ErrorType, ExecutionResult, HookError, Job};

    static RUNS: AtomicUsize = AtomicUsize::new(0);
    static SUCCESSES: AtomicUsize = AtomicUsize::new(0);
    static FAILURES: AtomicUsize = AtomicUsize::new(0);

    #[derive(Serialize, Deserialize)]
    struct Charge {
        succeed: bool,
    }

    #[async_trait]
    impl Job for Charge {
        const NAME: &'static str = "charge";
        const MAX_ATTEMPTS: u16 = 3;

        async fn run(&self) -> ExecutionResult {
            RUNS.fetch_add(1, Ordering::SeqCst);
            if self.succeed {
                ExecutionResult::Done
            } else {
                MockError("card declined").into()
            }
        }

        async fn on_success(&self) -> Result<(), HookError> {
            SUCCESSES.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_failure(&self, _failure: &JobFailure) -> Result<(), HookError> {
            FAILURES.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatch_runs_job_inline() {
        let backend = SyncBackend::new(JobRegistry::new().register::<Charge>());

        Charge { succeed: true }
            .dispatch()
            .enqueue_to_backend(&backend)
            .await
            .unwrap();
        assert_eq!(RUNS.load(Ordering::SeqCst), 1);
        assert_eq!(SUCCESSES.load(Ordering::SeqCst), 1);

        let result = Charge { succeed: false }
            .dispatch()
            .enqueue_to_backend(&backend)
            .await;
        assert_matches!(
            result,
            Err(crate::DrudgeError::Backend(BackendError::SyncExecution(JobFailure {
                error_type: ErrorType::Other(_),
                ..
            })))
        );
        assert_eq!(RUNS.load(Ordering::SeqCst), 2);
        assert_eq!(FAILURES.load(Ordering::SeqCst), 1);
        assert_eq!(backend.size("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dispatch_of_unregistered_job_fails() {
        let backend = SyncBackend::new(JobRegistry::new());

        let result = backend.enqueue(EnqueuableJob::mock_job()).await;

        assert_matches!(
            result,
            Err(BackendError::SyncExecution(JobFailure {
                error_type: ErrorType::UnknownJob,
                ..
            }))
        );
    }
}
