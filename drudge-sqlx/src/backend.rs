use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use drudge::{
    backend::{Backend, BackendError, EnqueuableJob, FailedJob, JobRecord},
    job::{JobFailure, JobId},
};
use tracing::instrument;

use crate::{map_err, seconds, types, DrudgePgBackend};

impl DrudgePgBackend {
    fn handle_update(result: sqlx::Result<u64>, job_id: JobId) -> Result<(), BackendError> {
        match result {
            Ok(0) => Err(BackendError::JobNotFound(job_id)),
            Ok(1) => Ok(()),
            Ok(_) => Err(BackendError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn insert_job(&self, job: EnqueuableJob) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"INSERT INTO drudge_jobs (queue, job_type, payload, max_attempts, available_at)
            VALUES ($1, $2, $3, $4, now() + make_interval(secs => $5))
            RETURNING id"#,
        )
        .bind(job.queue)
        .bind(job.job_type)
        .bind(job.payload)
        .bind(i32::from(job.max_attempts))
        .bind(seconds(job.delay))
        .fetch_one(&self.pool)
        .await
    }

    async fn reserve_next(&self, queues: &[String]) -> sqlx::Result<Option<types::Job>> {
        sqlx::query_as(
            r#"UPDATE drudge_jobs
            SET status = 'reserved',
                reserved_at = now(),
                attempts = CASE WHEN status = 'reserved'
                    THEN LEAST(attempts + 1, max_attempts) ELSE attempts END
            WHERE id = (
                SELECT id FROM drudge_jobs
                WHERE queue = ANY($1)
                  AND ((status = 'pending' AND available_at <= now())
                    OR (status = 'reserved'
                        AND reserved_at <= now() - make_interval(secs => $2)))
                ORDER BY array_position($1, queue), available_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, queue, job_type, payload, status, attempts, max_attempts,
                available_at, reserved_at, created_at"#,
        )
        .bind(queues)
        .bind(seconds(self.stale_after))
        .fetch_optional(&self.pool)
        .await
    }

    async fn renew(&self, job: &JobRecord) -> sqlx::Result<Option<DateTime<Utc>>> {
        sqlx::query_scalar(
            r#"UPDATE drudge_jobs
            SET reserved_at = now()
            WHERE id = $1 AND status = 'reserved' AND reserved_at = $2
            RETURNING reserved_at"#,
        )
        .bind(i64::from(job.id))
        .bind(job.reserved_at)
        .fetch_optional(&self.pool)
        .await
    }

    async fn release_job(
        &self,
        job: &JobRecord,
        available_at: DateTime<Utc>,
    ) -> sqlx::Result<u64> {
        sqlx::query(
            r#"UPDATE drudge_jobs
            SET status = 'pending',
                attempts = attempts + 1,
                available_at = $3,
                reserved_at = NULL
            WHERE id = $1 AND status = 'reserved' AND reserved_at = $2"#,
        )
        .bind(i64::from(job.id))
        .bind(job.reserved_at)
        .bind(available_at)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
    }

    async fn move_to_failed(&self, job: &JobRecord, failure: &JobFailure) -> sqlx::Result<u64> {
        sqlx::query(
            r#"WITH moved AS (
                DELETE FROM drudge_jobs
                WHERE id = $1 AND status = 'reserved' AND reserved_at = $4
                RETURNING id, queue, job_type, payload, attempts, max_attempts, created_at
            )
            INSERT INTO drudge_failed_jobs (
                id, queue, job_type, payload, attempts, max_attempts, created_at,
                error_type, message, failed_at
            )
            SELECT id, queue, job_type, payload, LEAST(attempts + 1, max_attempts), max_attempts,
                created_at, $2, $3, now()
            FROM moved"#,
        )
        .bind(i64::from(job.id))
        .bind(failure.error_type.as_str())
        .bind(&failure.message)
        .bind(job.reserved_at)
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
    }

    async fn requeue_failed(&self, id: JobId) -> sqlx::Result<u64> {
        sqlx::query(
            r#"WITH moved AS (
                DELETE FROM drudge_failed_jobs WHERE id = $1
                RETURNING id, queue, job_type, payload, max_attempts, created_at
            )
            INSERT INTO drudge_jobs (
                id, queue, job_type, payload, status, attempts, max_attempts,
                available_at, created_at
            )
            SELECT id, queue, job_type, payload, 'pending', 0, max_attempts, now(), created_at
            FROM moved"#,
        )
        .bind(i64::from(id))
        .execute(&self.pool)
        .await
        .map(|result| result.rows_affected())
    }
}

#[async_trait]
impl Backend for DrudgePgBackend {
    #[instrument(skip(self, job), fields(queue = %job.queue, job_type = %job.job_type))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        self.insert_job(job).await.map(JobId::from).map_err(map_err)
    }

    async fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, BackendError> {
        self.reserve_next(queues)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError> {
        self.renew(job)
            .await
            .map_err(map_err)?
            .ok_or(BackendError::JobNotFound(job.id))
    }

    async fn release(
        &self,
        job: &JobRecord,
        available_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let result = self.release_job(job, available_at).await;
        Self::handle_update(result, job.id)
    }

    async fn delete(&self, job: &JobRecord) -> Result<(), BackendError> {
        sqlx::query("DELETE FROM drudge_jobs WHERE id = $1 AND reserved_at = $2")
            .bind(i64::from(job.id))
            .bind(job.reserved_at)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn mark_failed(
        &self,
        job: &JobRecord,
        failure: &JobFailure,
    ) -> Result<(), BackendError> {
        let result = self.move_to_failed(job, failure).await;
        Self::handle_update(result, job.id)
    }

    async fn size(&self, queue: &str) -> Result<u64, BackendError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM drudge_jobs WHERE queue = $1 AND status = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(count.unsigned_abs())
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, BackendError> {
        sqlx::query_as::<_, types::Failed>(
            r#"SELECT id, queue, job_type, payload, attempts, max_attempts, created_at,
                error_type, message, failed_at
            FROM drudge_failed_jobs
            ORDER BY failed_at, id"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_err)?
        .into_iter()
        .map(TryFrom::try_from)
        .collect()
    }

    async fn retry_failed(&self, id: JobId) -> Result<(), BackendError> {
        let result = self.requeue_failed(id).await;
        Self::handle_update(result, id)
    }

    async fn forget_failed(&self, id: JobId) -> Result<(), BackendError> {
        let result = sqlx::query("DELETE FROM drudge_failed_jobs WHERE id = $1")
            .bind(i64::from(id))
            .execute(&self.pool)
            .await
            .map(|result| result.rows_affected());
        Self::handle_update(result, id)
    }

    async fn prune_failed(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        let result = sqlx::query(
            "DELETE FROM drudge_failed_jobs WHERE failed_at <= now() - make_interval(secs => $1)",
        )
        .bind(seconds(older_than))
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        let pruned = result.rows_affected();
        tracing::debug!(pruned, "Pruned {pruned} failed jobs");
        Ok(pruned)
    }
}

#[cfg(test)]
mod test {
    use drudge::test_suite;
    use sqlx::PgPool;

    use super::*;

    test_suite!(
        #[ignore = "requires a running postgres instance, set DATABASE_URL"]
        attr: sqlx::test,
        args: (pool: PgPool),
        backend: DrudgePgBackend::from_pool(pool).await.unwrap(),
        stale: DrudgePgBackend::from_pool(pool)
            .await
            .unwrap()
            .with_stale_after(TimeDelta::zero())
    );

    fn job() -> EnqueuableJob {
        EnqueuableJob {
            queue: "default".to_owned(),
            job_type: "job".to_owned(),
            payload: serde_json::json!({ "data": "data" }),
            max_attempts: 3,
            delay: TimeDelta::zero(),
        }
    }

    #[sqlx::test]
    #[ignore = "requires a running postgres instance, set DATABASE_URL"]
    async fn stale_reservation_is_reclaimed(pool: PgPool) {
        let backend = DrudgePgBackend::from_pool(pool)
            .await
            .unwrap()
            .with_stale_after(TimeDelta::zero());
        let queues = vec!["default".to_owned()];
        let id = backend.enqueue(job()).await.unwrap();

        let first = backend.claim_next(&queues).await.unwrap().unwrap();
        let reclaimed = backend.claim_next(&queues).await.unwrap().unwrap();

        assert_eq!(first.id, id);
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 1);
        assert_eq!(reclaimed.available_at, first.available_at);
    }

    #[sqlx::test]
    #[ignore = "requires a running postgres instance, set DATABASE_URL"]
    async fn concurrent_workers_never_share_a_job(pool: PgPool) {
        let backend = DrudgePgBackend::from_pool(pool).await.unwrap();
        for _ in 0..20 {
            backend.enqueue(job()).await.unwrap();
        }

        let claims = futures::future::join_all((0..40).map(|_| {
            let backend = backend.clone();
            tokio::spawn(async move { backend.claim_next(&["default".to_owned()]).await })
        }))
        .await;

        let mut ids: Vec<JobId> = claims
            .into_iter()
            .filter_map(|claim| claim.unwrap().unwrap())
            .map(|job| job.id)
            .collect();
        let raced = ids.len();
        // SKIP LOCKED lets a racer come back empty while the remaining rows are locked.
        assert!(raced <= 20);
        while let Some(job) = backend.claim_next(&["default".to_owned()]).await.unwrap() {
            ids.push(job.id);
        }
        let claimed = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(claimed, 20);
        assert_eq!(ids.len(), 20);
    }
}
