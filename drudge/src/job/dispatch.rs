//! Enqueuing jobs onto a backend.
use chrono::TimeDelta;

use crate::{
    backend::{Backend, EnqueuableJob},
    DrudgeError,
};

use super::{Job, JobId};

/// A job on its way to a backend.
///
/// Created by [`Job::dispatch`]; overrides apply to this dispatch only and never leak into
/// other instances of the same job type.
///
/// # Example
///
/// ```
/// # use drudge::prelude::*;
/// # use drudge::backend::memory::InMemoryBackend;
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Serialize, Deserialize)]
/// # struct SendReminder { user: String }
/// # #[async_trait]
/// # impl Job for SendReminder {
/// #     const NAME: &'static str = "send_reminder";
/// #     async fn run(&self) -> ExecutionResult { ExecutionResult::Done }
/// # }
/// # tokio_test(async {
/// let backend = InMemoryBackend::new();
/// let id = SendReminder { user: "ada".to_owned() }
///     .dispatch()
///     .on_queue("reminders")
///     .delay(TimeDelta::minutes(10))
///     .enqueue_to_backend(&backend)
///     .await?;
/// # Ok::<_, DrudgeError>(id)
/// # });
/// # fn tokio_test<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Debug)]
pub struct PendingDispatch<J: Job> {
    job: J,
    queue: String,
    delay: TimeDelta,
    max_attempts: u16,
}

impl<J: Job> PendingDispatch<J> {
    pub(crate) fn new(job: J) -> Self {
        Self {
            job,
            queue: J::QUEUE.to_owned(),
            delay: J::DELAY,
            max_attempts: J::MAX_ATTEMPTS,
        }
    }

    /// Makes the job claimable only after `delay` has elapsed.
    pub fn delay(self, delay: TimeDelta) -> Self {
        Self { delay, ..self }
    }

    pub fn on_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            ..self
        }
    }

    /// Overrides [`Job::MAX_ATTEMPTS`] for this dispatch. Values below one are raised to one.
    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    /// Serializes the job into the form stored by backends.
    pub fn into_enqueuable(self) -> Result<EnqueuableJob, serde_json::Error> {
        Ok(EnqueuableJob {
            queue: self.queue,
            job_type: J::NAME.to_owned(),
            payload: serde_json::to_value(&self.job)?,
            max_attempts: self.max_attempts,
            delay: self.delay,
        })
    }

    pub async fn enqueue_to_backend<B>(self, backend: &B) -> Result<JobId, DrudgeError>
    where
        B: Backend + ?Sized,
    {
        let job = self.into_enqueuable()?;
        let queue = job.queue.clone();
        let id = backend.enqueue(job).await?;
        tracing::debug!(job_id = %id, %queue, job_type = J::NAME, "Dispatched job {id} onto {queue}");
        Ok(id)
    }
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::{
        backend::memory::InMemoryBackend,
        clock::MockClock,
        job::{ExecutionResult, JobStatus},
    };

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct SendReminder {
        user: String,
    }

    #[async_trait]
    impl Job for SendReminder {
        const NAME: &'static str = "send_reminder";
        const QUEUE: &'static str = "reminders";
        const MAX_ATTEMPTS: u16 = 4;

        async fn run(&self) -> ExecutionResult {
            ExecutionResult::Done
        }
    }

    fn reminder() -> SendReminder {
        SendReminder {
            user: "ada".to_owned(),
        }
    }

    #[test]
    fn defaults_come_from_the_job_type() {
        let job = reminder().dispatch().into_enqueuable().unwrap();

        assert_eq!(job.queue, "reminders");
        assert_eq!(job.job_type, "send_reminder");
        assert_eq!(job.max_attempts, 4);
        assert_eq!(job.delay, TimeDelta::zero());
        assert_eq!(job.payload, serde_json::json!({ "user": "ada" }));
    }

    #[test]
    fn overrides_apply_to_one_dispatch() {
        let job = reminder()
            .dispatch()
            .on_queue("urgent")
            .delay(TimeDelta::minutes(3))
            .with_max_attempts(0)
            .into_enqueuable()
            .unwrap();

        assert_eq!(job.queue, "urgent");
        assert_eq!(job.delay, TimeDelta::minutes(3));
        assert_eq!(job.max_attempts, 1);

        let untouched = reminder().dispatch().into_enqueuable().unwrap();
        assert_eq!(untouched.queue, "reminders");
        assert_eq!(untouched.delay, TimeDelta::zero());
    }

    #[tokio::test]
    async fn enqueue_to_backend_stores_pending_job() {
        let clock = MockClock::new(Utc::now());
        let backend = InMemoryBackend::new().with_clock(clock.clone());

        reminder()
            .dispatch()
            .delay(TimeDelta::seconds(30))
            .enqueue_to_backend(&backend)
            .await
            .unwrap();

        let queues = ["reminders".to_owned()];
        assert!(backend.claim_next(&queues).await.unwrap().is_none());

        clock.advance(TimeDelta::seconds(30));
        let record = backend.claim_next(&queues).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Reserved);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, 4);
        let restored: SendReminder = serde_json::from_value(record.payload).unwrap();
        assert_eq!(restored, reminder());
    }
}
