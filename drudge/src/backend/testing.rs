//! Test suite for ensuring a correct implementation of a backend.
use chrono::TimeDelta;

use super::*;
use crate::job::ErrorType;

const DEFAULT_QUEUE: &str = "default";
const DEFAULT_JOB_TYPE: &str = "job";

impl EnqueuableJob {
    pub(crate) fn mock_job() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_owned(),
            job_type: DEFAULT_JOB_TYPE.to_owned(),
            payload: serde_json::json!({ "data": "data" }),
            max_attempts: 5,
            delay: TimeDelta::zero(),
        }
    }

    pub(crate) fn with_queue(self, queue: impl ToString) -> Self {
        Self {
            queue: queue.to_string(),
            ..self
        }
    }

    pub(crate) fn with_delay(self, delay: TimeDelta) -> Self {
        Self { delay, ..self }
    }

    pub(crate) fn with_payload(self, payload: Value) -> Self {
        Self { payload, ..self }
    }

    pub(crate) fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts,
            ..self
        }
    }
}

/// The queue list containing only the default queue.
pub fn queue() -> Vec<String> {
    vec![DEFAULT_QUEUE.to_owned()]
}

fn failure() -> JobFailure {
    JobFailure::new(ErrorType::Other("custom".to_owned()), "went wrong")
}

fn missing_job() -> JobRecord {
    EnqueuableJob::mock_job().into_record(JobId::from(i64::MAX - 7), Utc::now())
}

/// Create test suite for drudge backends.
///
/// For backend implementors, it is useful to include this as part of your test suites. The
/// `stale` backend must share nothing with other tests and treat every reservation as stale
/// the moment it is made, which exercises reclaiming without waiting.
///
/// # Example
///
/// ```
/// # use drudge::prelude::*;
/// use drudge::test_suite;
/// use drudge::backend::memory::InMemoryBackend;
/// test_suite!(
///     for: InMemoryBackend::new(),
///     stale: InMemoryBackend::new().with_stale_after(TimeDelta::zero())
/// );
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead, and attach further attributes ahead of it. For example when using `sqlx::test`:
///
/// ```ignore
/// # use drudge::prelude::*;
/// use drudge::test_suite;
/// test_suite!(
///     #[ignore = "requires a running postgres instance"]
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap(),
///     stale: BackendImplementation::from_pool(pool)
///         .await
///         .unwrap()
///         .with_stale_after(TimeDelta::zero())
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr, stale: $stale:expr) => {
        $crate::test_suite!(
            attr: tokio::test(flavor = "multi_thread", worker_threads = 8),
            args: (),
            backend: $backend,
            stale: $stale
        );
    };
    (
        $(#[$meta:meta])*
        attr: $attr:meta,
        args: $args:tt,
        backend: $backend:expr,
        stale: $stale:expr
    ) => {
        #[$attr]
        $(#[$meta])*
        async fn enqueue_assigns_distinct_ids $args {
            let backend = $backend;
            $crate::backend::testing::enqueue_assigns_distinct_ids(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_returns_none_when_empty $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_returns_none_when_empty(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_reserves_due_job $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_reserves_due_job(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_skips_delayed_jobs $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_skips_delayed_jobs(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_prefers_earliest_available $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_prefers_earliest_available(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_honours_queue_order $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_honours_queue_order(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_ignores_unlisted_queues $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_ignores_unlisted_queues(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn claim_next_is_exclusive $args {
            let backend = $backend;
            $crate::backend::testing::claim_next_is_exclusive(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn heartbeat_extends_reservation $args {
            let backend = $backend;
            $crate::backend::testing::heartbeat_extends_reservation(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn reclaim_never_exceeds_max_attempts $args {
            let backend = $stale;
            $crate::backend::testing::reclaim_never_exceeds_max_attempts(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn reclaimed_job_cannot_be_resolved_by_previous_holder $args {
            let backend = $stale;
            $crate::backend::testing::reclaimed_job_cannot_be_resolved_by_previous_holder(backend)
                .await;
        }
        #[$attr]
        $(#[$meta])*
        async fn release_returns_job_to_pending $args {
            let backend = $backend;
            $crate::backend::testing::release_returns_job_to_pending(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn release_into_the_future $args {
            let backend = $backend;
            $crate::backend::testing::release_into_the_future(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn release_missing_job $args {
            let backend = $backend;
            $crate::backend::testing::release_missing_job(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn delete_is_idempotent $args {
            let backend = $backend;
            $crate::backend::testing::delete_is_idempotent(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn mark_failed_moves_job_to_failed_store $args {
            let backend = $backend;
            $crate::backend::testing::mark_failed_moves_job_to_failed_store(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn retry_failed_requeues_job $args {
            let backend = $backend;
            $crate::backend::testing::retry_failed_requeues_job(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn forget_failed_removes_record $args {
            let backend = $backend;
            $crate::backend::testing::forget_failed_removes_record(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn prune_failed_keeps_recent_failures $args {
            let backend = $backend;
            $crate::backend::testing::prune_failed_keeps_recent_failures(backend).await;
        }
        #[$attr]
        $(#[$meta])*
        async fn size_counts_pending_jobs_per_queue $args {
            let backend = $backend;
            $crate::backend::testing::size_counts_pending_jobs_per_queue(backend).await;
        }
    };
}

#[doc(hidden)]
pub async fn enqueue_assigns_distinct_ids(backend: impl Backend) {
    let first = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let second = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 2);
}

#[doc(hidden)]
pub async fn claim_next_returns_none_when_empty(backend: impl Backend) {
    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_reserves_due_job(backend: impl Backend) {
    let payload = serde_json::json!({ "to": "ada@example.com", "retries": [1, 2] });
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_payload(payload.clone()))
        .await
        .unwrap();

    let job = backend.claim_next(&queue()).await.unwrap().unwrap();

    assert_eq!(job.id, id);
    assert_eq!(job.queue, DEFAULT_QUEUE);
    assert_eq!(job.job_type, DEFAULT_JOB_TYPE);
    assert_eq!(job.payload, payload);
    assert_eq!(job.status, JobStatus::Reserved);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 5);
    assert!(job.reserved_at.is_some());
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 0);
    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_next_skips_delayed_jobs(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_delay(TimeDelta::hours(1)))
        .await
        .unwrap();

    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn claim_next_prefers_earliest_available(backend: impl Backend) {
    let later = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let earlier = backend
        .enqueue(EnqueuableJob::mock_job().with_delay(TimeDelta::minutes(-5)))
        .await
        .unwrap();

    let first = backend.claim_next(&queue()).await.unwrap().unwrap();
    let second = backend.claim_next(&queue()).await.unwrap().unwrap();

    assert_eq!(first.id, earlier);
    assert_eq!(second.id, later);
}

#[doc(hidden)]
pub async fn claim_next_honours_queue_order(backend: impl Backend) {
    let low = backend
        .enqueue(
            EnqueuableJob::mock_job()
                .with_queue("low")
                .with_delay(TimeDelta::minutes(-5)),
        )
        .await
        .unwrap();
    let high = backend
        .enqueue(EnqueuableJob::mock_job().with_queue("high"))
        .await
        .unwrap();
    let queues = vec!["high".to_owned(), "low".to_owned()];

    let first = backend.claim_next(&queues).await.unwrap().unwrap();
    let second = backend.claim_next(&queues).await.unwrap().unwrap();

    assert_eq!(first.id, high);
    assert_eq!(first.queue, "high");
    assert_eq!(second.id, low);
}

#[doc(hidden)]
pub async fn claim_next_ignores_unlisted_queues(backend: impl Backend) {
    backend
        .enqueue(EnqueuableJob::mock_job().with_queue("other"))
        .await
        .unwrap();

    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    assert_eq!(backend.size("other").await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn claim_next_is_exclusive(backend: impl Backend + 'static) {
    let backend = Arc::new(backend);
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();

    let claims = futures::future::join_all((0..50).map(|_| {
        let backend = backend.clone();
        tokio::spawn(async move { backend.claim_next(&queue()).await })
    }))
    .await;

    let claimed: Vec<JobId> = claims
        .into_iter()
        .filter_map(|claim| claim.unwrap().unwrap())
        .map(|job| job.id)
        .collect();
    assert_eq!(claimed, vec![id]);
}

#[doc(hidden)]
pub async fn heartbeat_extends_reservation(backend: impl Backend) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let mut job = backend.claim_next(&queue()).await.unwrap().unwrap();
    let claimed_at = job.reserved_at.unwrap();

    let reserved_at = backend.heartbeat(&job).await.unwrap();
    assert!(reserved_at >= claimed_at);
    job.reserved_at = Some(reserved_at);

    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    backend
        .release(&job, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 1);

    let result = backend.heartbeat(&missing_job()).await;
    assert!(
        matches!(result, Err(BackendError::JobNotFound(_))),
        "unexpected result {result:?}"
    );
}

#[doc(hidden)]
pub async fn reclaim_never_exceeds_max_attempts(backend: impl Backend) {
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_max_attempts(2))
        .await
        .unwrap();

    let mut attempts = Vec::new();
    let mut job = None;
    for _ in 0..5 {
        let claimed = backend.claim_next(&queue()).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        attempts.push(claimed.attempts);
        job = Some(claimed);
    }
    assert_eq!(attempts, vec![0, 1, 2, 2, 2]);

    let job = job.unwrap();
    assert!(job.is_exhausted());
    backend.mark_failed(&job, &failure()).await.unwrap();

    let failed = backend.failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
    assert_eq!(failed[0].max_attempts, 2);
}

#[doc(hidden)]
pub async fn reclaimed_job_cannot_be_resolved_by_previous_holder(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let abandoned = backend.claim_next(&queue()).await.unwrap().unwrap();
    // Reservations are told apart by their timestamp, which some stores keep in milliseconds.
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let reclaimed = backend.claim_next(&queue()).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);
    assert_ne!(reclaimed.reserved_at, abandoned.reserved_at);

    assert!(matches!(
        backend.heartbeat(&abandoned).await,
        Err(BackendError::JobNotFound(_))
    ));
    assert!(matches!(
        backend.release(&abandoned, Utc::now()).await,
        Err(BackendError::JobNotFound(_))
    ));
    assert!(matches!(
        backend.mark_failed(&abandoned, &failure()).await,
        Err(BackendError::JobNotFound(_))
    ));
    backend.delete(&abandoned).await.unwrap();
    assert!(backend.failed_jobs().await.unwrap().is_empty());

    backend
        .release(&reclaimed, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn release_returns_job_to_pending(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();

    backend
        .release(&job, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 1);

    let job = backend.claim_next(&queue()).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);

    backend
        .release(&job, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();
    assert_eq!(job.attempts, 2);
}

#[doc(hidden)]
pub async fn release_into_the_future(backend: impl Backend) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();

    backend
        .release(&job, Utc::now() + TimeDelta::hours(1))
        .await
        .unwrap();

    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn release_missing_job(backend: impl Backend) {
    let job = missing_job();

    let result = backend.release(&job, Utc::now()).await;

    assert!(
        matches!(result, Err(BackendError::JobNotFound(id)) if id == job.id),
        "unexpected result {result:?}"
    );
}

#[doc(hidden)]
pub async fn delete_is_idempotent(backend: impl Backend) {
    backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();

    backend.delete(&job).await.unwrap();
    backend.delete(&job).await.unwrap();

    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 0);
    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    assert!(backend.failed_jobs().await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn mark_failed_moves_job_to_failed_store(backend: impl Backend) {
    let payload = serde_json::json!({ "invoice": 42 });
    let id = backend
        .enqueue(EnqueuableJob::mock_job().with_payload(payload.clone()))
        .await
        .unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();

    backend.mark_failed(&job, &failure()).await.unwrap();

    assert_eq!(backend.size(DEFAULT_QUEUE).await.unwrap(), 0);
    assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    let failed = backend.failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
    let failed = &failed[0];
    assert_eq!(failed.id, id);
    assert_eq!(failed.queue, DEFAULT_QUEUE);
    assert_eq!(failed.job_type, DEFAULT_JOB_TYPE);
    assert_eq!(failed.payload, payload);
    assert_eq!(failed.attempts, 1);
    assert_eq!(failed.error_type, "custom");
    assert_eq!(failed.message, "went wrong");
}

#[doc(hidden)]
pub async fn retry_failed_requeues_job(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();
    backend
        .release(&job, Utc::now() - TimeDelta::seconds(1))
        .await
        .unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();
    backend.mark_failed(&job, &failure()).await.unwrap();

    backend.retry_failed(id).await.unwrap();

    assert!(backend.failed_jobs().await.unwrap().is_empty());
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 0);
    assert!(matches!(
        backend.retry_failed(id).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn forget_failed_removes_record(backend: impl Backend) {
    let id = backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
    let job = backend.claim_next(&queue()).await.unwrap().unwrap();
    backend.mark_failed(&job, &failure()).await.unwrap();

    backend.forget_failed(id).await.unwrap();

    assert!(backend.failed_jobs().await.unwrap().is_empty());
    assert!(matches!(
        backend.forget_failed(id).await,
        Err(BackendError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn prune_failed_keeps_recent_failures(backend: impl Backend) {
    for _ in 0..3 {
        backend.enqueue(EnqueuableJob::mock_job()).await.unwrap();
        let job = backend.claim_next(&queue()).await.unwrap().unwrap();
        backend.mark_failed(&job, &failure()).await.unwrap();
    }

    assert_eq!(backend.prune_failed(TimeDelta::hours(1)).await.unwrap(), 0);
    assert_eq!(backend.failed_jobs().await.unwrap().len(), 3);

    assert_eq!(backend.prune_failed(TimeDelta::minutes(-1)).await.unwrap(), 3);
    assert!(backend.failed_jobs().await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn size_counts_pending_jobs_per_queue(backend: impl Backend) {
    for queue in ["emails", "emails", "reports"] {
        backend
            .enqueue(EnqueuableJob::mock_job().with_queue(queue))
            .await
            .unwrap();
    }

    assert_eq!(backend.size("emails").await.unwrap(), 2);
    assert_eq!(backend.size("reports").await.unwrap(), 1);
    assert_eq!(backend.size("missing").await.unwrap(), 0);
}
