//! A [`Backend`] that discards everything dispatched to it.
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{JobFailure, JobId};

use super::{Backend, BackendError, EnqueuableJob, FailedJob, JobRecord};

#[derive(Debug, Clone, Copy, Default)]
pub struct NullBackend;

#[async_trait]
impl Backend for NullBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        tracing::trace!(job_type = %job.job_type, queue = %job.queue, "Discarding dispatched job");
        Ok(JobId::from(0))
    }

    async fn claim_next(&self, _queues: &[String]) -> Result<Option<JobRecord>, BackendError> {
        Ok(None)
    }

    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError> {
        Err(BackendError::JobNotFound(job.id))
    }

    async fn release(
        &self,
        _job: &JobRecord,
        _available_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        Ok(())
    }

    async fn delete(&self, _job: &JobRecord) -> Result<(), BackendError> {
        Ok(())
    }

    async fn mark_failed(
        &self,
        _job: &JobRecord,
        _failure: &JobFailure,
    ) -> Result<(), BackendError> {
        Ok(())
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
    use super::*;
    use crate::backend::testing::queue;

    #[tokio::test]
    async fn dispatched_jobs_disappear() {
        let backend = NullBackend;

        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

        assert_eq!(backend.size("default").await.unwrap(), 0);
        assert!(backend.claim_next(&queue()).await.unwrap().is_none());
        assert!(backend.failed_jobs().await.unwrap().is_empty());
    }
}
