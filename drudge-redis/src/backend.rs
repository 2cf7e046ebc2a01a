use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use drudge::{
    backend::{Backend, BackendError, EnqueuableJob, FailedJob, JobRecord},
    job::{JobFailure, JobId},
};
use redis::AsyncCommands;
use tracing::instrument;

use crate::{
    keys::{member, parse_member},
    map_err,
    stored::{fields, reservation, Stored},
    RedisBackend,
};

impl RedisBackend {
    fn handle_update(result: i64, job_id: JobId) -> Result<(), BackendError> {
        match result {
            0 => Err(BackendError::JobNotFound(job_id)),
            1 => Ok(()),
            _ => Err(BackendError::BadState),
        }
    }

    async fn next_id(&self) -> Result<JobId, BackendError> {
        let id: i64 = self
            .conn
            .clone()
            .incr(self.namespace.id_counter(), 1)
            .await
            .map_err(map_err)?;
        Ok(JobId::from(id))
    }

    async fn reserve_next(&self, queues: &[String]) -> Result<Option<JobId>, BackendError> {
        let now = self.clock.now();
        let stale_cutoff = now - self.stale_after;
        let mut invocation = self.scripts.claim.prepare_invoke();
        for queue in queues {
            invocation
                .key(self.namespace.pending(queue))
                .key(self.namespace.reserved(queue));
        }
        let claimed: Option<String> = invocation
            .arg(self.namespace.job_prefix())
            .arg(now.timestamp_millis())
            .arg(stale_cutoff.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        claimed
            .map(|member| {
                parse_member(&member)
                    .ok_or_else(|| BackendError::Corrupt(format!("invalid job id: {member}")))
            })
            .transpose()
    }

    async fn load(&self, id: JobId) -> Result<Stored, BackendError> {
        let hash: HashMap<String, String> = self
            .conn
            .clone()
            .hgetall(self.namespace.job(id))
            .await
            .map_err(map_err)?;
        Ok(Stored(hash))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    #[instrument(skip(self, job), fields(queue = %job.queue, job_type = %job.job_type))]
    async fn enqueue(&self, job: EnqueuableJob) -> Result<JobId, BackendError> {
        let id = self.next_id().await?;
        let record = job.into_record(id, self.clock.now());
        redis::pipe()
            .atomic()
            .hset_multiple(self.namespace.job(id), &fields(&record)?)
            .ignore()
            .zadd(
                self.namespace.pending(&record.queue),
                member(id),
                record.available_at.timestamp_millis(),
            )
            .ignore()
            .query_async::<_, ()>(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Ok(id)
    }

    async fn claim_next(&self, queues: &[String]) -> Result<Option<JobRecord>, BackendError> {
        if queues.is_empty() {
            return Ok(None);
        }
        let Some(id) = self.reserve_next(queues).await? else {
            return Ok(None);
        };
        let stored = self.load(id).await?;
        if stored.is_empty() {
            return Err(BackendError::Corrupt(format!("claimed job {id} has no data")));
        }
        stored.into_record(id).map(Some)
    }

    async fn heartbeat(&self, job: &JobRecord) -> Result<DateTime<Utc>, BackendError> {
        let now = self.clock.now().timestamp_millis();
        let result: i64 = self
            .scripts
            .heartbeat
            .key(self.namespace.job(job.id))
            .key(self.namespace.reserved(&job.queue))
            .arg(member(job.id))
            .arg(reservation(job))
            .arg(now)
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Self::handle_update(result, job.id)?;
        DateTime::from_timestamp_millis(now).ok_or(BackendError::BadState)
    }

    async fn release(
        &self,
        job: &JobRecord,
        available_at: DateTime<Utc>,
    ) -> Result<(), BackendError> {
        let result: i64 = self
            .scripts
            .release
            .key(self.namespace.job(job.id))
            .key(self.namespace.pending(&job.queue))
            .key(self.namespace.reserved(&job.queue))
            .arg(member(job.id))
            .arg(available_at.timestamp_millis())
            .arg(reservation(job))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Self::handle_update(result, job.id)
    }

    async fn delete(&self, job: &JobRecord) -> Result<(), BackendError> {
        let deleted: i64 = self
            .scripts
            .delete
            .key(self.namespace.job(job.id))
            .key(self.namespace.pending(&job.queue))
            .key(self.namespace.reserved(&job.queue))
            .arg(member(job.id))
            .arg(reservation(job))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        if deleted == 0 {
            tracing::debug!(job_id = %job.id, "Job {} was already gone or reclaimed", job.id);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        job: &JobRecord,
        failure: &JobFailure,
    ) -> Result<(), BackendError> {
        let result: i64 = self
            .scripts
            .fail
            .key(self.namespace.job(job.id))
            .key(self.namespace.pending(&job.queue))
            .key(self.namespace.reserved(&job.queue))
            .key(self.namespace.failed(job.id))
            .key(self.namespace.failed_set())
            .arg(member(job.id))
            .arg(failure.error_type.as_str())
            .arg(&failure.message)
            .arg(self.clock.now().timestamp_millis())
            .arg(reservation(job))
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Self::handle_update(result, job.id)
    }

    async fn size(&self, queue: &str) -> Result<u64, BackendError> {
        self.conn
            .clone()
            .zcard(self.namespace.pending(queue))
            .await
            .map_err(map_err)
    }

    async fn failed_jobs(&self) -> Result<Vec<FailedJob>, BackendError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .zrange(self.namespace.failed_set(), 0, -1)
            .await
            .map_err(map_err)?;
        let ids = members
            .iter()
            .map(|member| {
                parse_member(member)
                    .ok_or_else(|| BackendError::Corrupt(format!("invalid job id: {member}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.namespace.failed(*id));
        }
        let hashes: Vec<HashMap<String, String>> =
            pipe.query_async(&mut conn).await.map_err(map_err)?;

        ids.into_iter()
            .zip(hashes)
            .map(|(id, hash)| (id, Stored(hash)))
            .filter(|(_, stored)| !stored.is_empty())
            .map(|(id, stored)| stored.into_failed(id))
            .collect()
    }

    async fn retry_failed(&self, id: JobId) -> Result<(), BackendError> {
        let queue: Option<String> = self
            .conn
            .clone()
            .hget(self.namespace.failed(id), "queue")
            .await
            .map_err(map_err)?;
        let queue = queue.ok_or(BackendError::JobNotFound(id))?;
        let result: i64 = self
            .scripts
            .retry
            .key(self.namespace.failed(id))
            .key(self.namespace.failed_set())
            .key(self.namespace.job(id))
            .key(self.namespace.pending(&queue))
            .arg(member(id))
            .arg(self.clock.now().timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Self::handle_update(result, id)
    }

    async fn forget_failed(&self, id: JobId) -> Result<(), BackendError> {
        let (removed, _): (i64, i64) = redis::pipe()
            .atomic()
            .del(self.namespace.failed(id))
            .zrem(self.namespace.failed_set(), member(id))
            .query_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        Self::handle_update(removed, id)
    }

    async fn prune_failed(&self, older_than: TimeDelta) -> Result<u64, BackendError> {
        let cutoff = self.clock.now() - older_than;
        let pruned: u64 = self
            .scripts
            .prune
            .key(self.namespace.failed_set())
            .arg(self.namespace.failed_prefix())
            .arg(cutoff.timestamp_millis())
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(map_err)?;
        tracing::debug!(pruned, "Pruned {pruned} failed jobs");
        Ok(pruned)
    }
}

#[cfg(test)]
mod test {
    use drudge::{backend::testing::queue, clock::MockClock, test_suite};

    use super::*;
    use crate::test::{backend, namespace, REDIS_URL};

    test_suite!(
        #[ignore = "requires a running redis instance"]
        attr: tokio::test(flavor = "multi_thread", worker_threads = 8),
        args: (),
        backend: backend().await,
        stale: backend().await.with_stale_after(TimeDelta::zero())
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

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn stale_reservation_is_reclaimed() {
        let clock = MockClock::new(Utc::now());
        let backend = RedisBackend::from_url(REDIS_URL)
            .await
            .unwrap()
            .with_namespace(namespace())
            .with_clock(clock.clone());
        let id = backend.enqueue(job()).await.unwrap();

        let first = backend.claim_next(&queue()).await.unwrap().unwrap();
        assert!(backend.claim_next(&queue()).await.unwrap().is_none());

        clock.advance(TimeDelta::seconds(91));
        let reclaimed = backend.claim_next(&queue()).await.unwrap().unwrap();

        assert_eq!(first.id, id);
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 1);
        assert_eq!(reclaimed.available_at, first.available_at);
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn heartbeat_defers_reclaim() {
        let clock = MockClock::new(Utc::now());
        let backend = RedisBackend::from_url(REDIS_URL)
            .await
            .unwrap()
            .with_namespace(namespace())
            .with_clock(clock.clone());
        backend.enqueue(job()).await.unwrap();
        let mut claimed = backend.claim_next(&queue()).await.unwrap().unwrap();

        clock.advance(TimeDelta::seconds(60));
        claimed.reserved_at = Some(backend.heartbeat(&claimed).await.unwrap());
        clock.advance(TimeDelta::seconds(60));
        assert!(backend.claim_next(&queue()).await.unwrap().is_none());

        backend.delete(&claimed).await.unwrap();
        assert_eq!(backend.size("default").await.unwrap(), 0);
        clock.advance(TimeDelta::seconds(91));
        assert!(backend.claim_next(&queue()).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn namespaces_are_isolated() {
        let first = backend().await;
        let second = backend().await;

        first.enqueue(job()).await.unwrap();

        assert_eq!(first.size("default").await.unwrap(), 1);
        assert_eq!(second.size("default").await.unwrap(), 0);
        assert!(second.claim_next(&queue()).await.unwrap().is_none());
    }
}
