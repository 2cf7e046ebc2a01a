//! Provides an in memory implementation of [`Backend`].
//!
//! Jobs live only as long as the process, so this is intended for tests and single process
//! setups. Clones share the same storage.
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    clock::{Clock, SystemClock},
    job::{JobFailure, JobId, JobStatus},
};

use super::{
    Backend, BackendError, EnqueuableJob, FailedJob, JobRecord, DEFAULT_STALE_AFTER,
};

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobId, JobRecord>,
    failed: BTreeMap<JobId, FailedJob>,
}

/// An in memory implementation of [`Backend`].
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    state: Arc<RwLock<State>>,
    id_counter: Arc<AtomicI64>,
    clock: Arc<dyn Clock>,
    stale_after: TimeDelta,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: Default::default(),
            id_counter: Default::default(),
            clock: Arc::new(SystemClock),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

impl InMemoryBackend {
    /// Creates a new instance of [`InMemoryBackend`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads "now" from `clock` instead of the system clock.
    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// Sets how long a reservation lasts before it can be reclaimed.
    pub fn with_stale_after(self, stale_after: TimeDelta) -> Self {
        Self {
            stale_after,
            ..self
        }
    }

    fn next_id(&self) -> JobId {
        JobId::from(self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = self.next_id();
        let record = job.into_record(id, self.clock.now());
        self.state
            .write()
            .map_err(|_| BackendError::BadState)?
            .jobs
            .insert(id, record);
        Ok(id)
    }

    async fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, BackendError> {
        let now = self.clock.now();
        let stale_cutoff = now - self.stale_after;
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;

        let next = queues.iter().find_map(|queue| {
            state
                .jobs
                .values()
                .filter(|job| &job.queue == queue && job.is_claimable(now, stale_cutoff))
                .min_by_key(|job| (job.available_at, job.id))
                .map(|job| job.id)
        });

        Ok(next
            .and_then(|id| state.jobs.get_mut(&id))
            .map(|job| {
                job.reserve(now);
                job.clone()
            }))
    }

    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .filter(|stored| job.holds(stored))
            .ok_or(BackendError::JobNotFound(job.id))?;
        stored.reserved_at = Some(now);
        Ok(now)
    }

    async fn release(
        &self,
        job: &JobRecord,
        available_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;
        let stored = state
            .jobs
            .get_mut(&job.id)
            .filter(|stored| job.holds(stored))
            .ok_or(BackendError::JobNotFound(job.id))?;
        stored.status = JobStatus::Pending;
        stored.attempts = stored.attempts.saturating_add(1);
        stored.available_at = available_at;
        stored.reserved_at = None;
        Ok(())
    }

    async fn delete(&self, job: &JobRecord) -> Result<(), BackendError> {
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;
        if state.jobs.get(&job.id).is_some_and(|stored| job.holds(stored)) {
            state.jobs.remove(&job.id);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job: &JobRecord,
        failure: &JobFailure,
    ) -> Result<(), BackendError> {
        let failed_at = self.clock.now();
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;
        let held = state.jobs.get(&job.id).is_some_and(|stored| job.holds(stored));
        let stored = held
            .then(|| state.jobs.remove(&job.id))
            .flatten()
            .ok_or(BackendError::JobNotFound(job.id))?;
        state
            .failed
            .insert(job.id, stored.into_failed(failure, failed_at));
        Ok(())
    }

    async fn size(&self, queue: &str) -> Result<u64, BackendError> {
        let count = self
            .state
            .read()
            .map_err(|_| BackendError::BadState)?
            .jobs
            .values()
            .filter(|job| job.queue == queue && job.status == JobStatus::Pending)
            .count();
        Ok(count as u64)
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, BackendError> {
        Ok(self
            .state
            .read()
            .map_err(|_| BackendError::BadState)?
            .failed
            .values()
            .cloned()
            .collect())
    }

    async fn retry_failed(&self, id: JobId) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;
        let failed = state
            .failed
            .remove(&id)
            .ok_or(BackendError::JobNotFound(id))?;
        state.jobs.insert(id, failed.into_retry(now));
        Ok(())
    }

    async fn forget_failed(&self, id: JobId) -> Result<(), BackendError> {
        self.state
            .write()
            .map_err(|_| BackendError::BadState)?
            .failed
            .remove(&id)
            .map(|_| ())
            .ok_or(BackendError::JobNotFound(id))
    }

    async fn prune_failed(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        let cutoff = self.clock.now() - older_than;
        let mut state = self.state.write().map_err(|_| BackendError::BadState)?;
        let before = state.failed.len();
        state.failed.retain(|_, job| job.failed_at > cutoff);
        Ok((before - state.failed.len()) as u64)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{backend::testing::queue, clock::MockClock, test_suite};

    test_suite!(
        for: InMemoryBackend::new(),
        stale: InMemoryBackend::new().with_stale_after(TimeDelta::zero())
    );

    #[tokio::test]
    async fn stale_reservation_is_reclaimed_with_an_extra_attempt() {
        let clock = MockClock::new(Utc::now());
        let backend = InMemoryBackend::new()
            .with_clock(clock.clone())
            .with_stale_after(TimeDelta::seconds(60));
        let id = backend
            .enqueue(EnqueuableJob::mock_job())
            .await
            .unwrap();
        let first = backend.claim_next(&queue()).await.unwrap().unwrap();
        let available_at = first.available_at;

        clock.advance(TimeDelta::seconds(59));
        assert_matches!(backend.claim_next(&queue()).await, Ok(None));

        clock.advance(TimeDelta::seconds(1));
        let reclaimed = backend.claim_next(&queue()).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 1);
        assert_eq!(reclaimed.available_at, available_at);
        assert_eq!(reclaimed.reserved_at, Some(clock.now()));
    }

    #[tokio::test]
    async fn heartbeat_keeps_reservation_fresh() {
        let clock = MockClock::new(Utc::now());
        let backend = InMemoryBackend::new()
            .with_clock(clock.clone())
            .with_stale_after(TimeDelta::seconds(60));
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let mut job = backend.claim_next(&queue()).await.unwrap().unwrap();

        clock.advance(TimeDelta::seconds(45));
        job.reserved_at = Some(backend.heartbeat(&job).await.unwrap());
        assert_eq!(job.reserved_at, Some(clock.now()));

        clock.advance(TimeDelta::seconds(45));
        assert_matches!(backend.claim_next(&queue()).await, Ok(None));

        clock.advance(TimeDelta::seconds(15));
        let reclaimed = backend.claim_next(&queue()).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_matches!(
            backend.heartbeat(&job).await,
            Err(BackendError::JobNotFound(id)) if id == job.id
        );
    }

    #[tokio::test]
    async fn prune_failed_uses_clock() {
        let clock = MockClock::new(Utc::now());
        let backend = InMemoryBackend::new().with_clock(clock.clone());
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let job = backend.claim_next(&queue()).await.unwrap().unwrap();
        backend
            .mark_failed(&job, &JobFailure::new(crate::job::ErrorType::Panic, "boom"))
            .await
            .unwrap();

        clock.advance(TimeDelta::days(1));
        assert_eq!(backend.prune_failed(TimeDelta::days(2)).await.unwrap(), 0);
        assert_eq!(backend.prune_failed(TimeDelta::hours(1)).await.unwrap(), 1);
        assert!(backend.failed_jobs().await.unwrap().is_empty());
    }
}
