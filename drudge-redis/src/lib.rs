//! A Redis [`Backend`](drudge::backend::Backend) for drudge.
//!
//! Each queue is a pair of sorted sets: pending jobs scored by the instant they become
//! available, and reserved jobs scored by the instant they were claimed. Job data lives in a
//! hash per job. Claiming, releasing and failing run as Lua scripts so every transition is
//! atomic on the server, and a job can only be popped by one worker.
//!
//! All keys share a namespace:
//!
//! | key                       | type       | contents                        |
//! |---------------------------|------------|---------------------------------|
//! | `{ns}:id_counter`         | string     | last assigned job id            |
//! | `{ns}:job:{id}`           | hash       | a pending or reserved job       |
//! | `{ns}:queue:{queue}`      | sorted set | pending ids by `available_at`   |
//! | `{ns}:reserved:{queue}`   | sorted set | reserved ids by `reserved_at`   |
//! | `{ns}:failed`             | sorted set | failed ids by `failed_at`       |
//! | `{ns}:failed:{id}`        | hash       | a failed job                    |
//!
//! A reservation is identified by the `reserved_at` field of the job hash, in milliseconds.
//! Heartbeats move it forward, and resolving a job checks it so a worker whose job was
//! reclaimed cannot touch the new reservation.
//!
//! # Redis Cluster
//!
//! The claim and prune scripts derive job hash keys from sorted set members instead of
//! receiving them in `KEYS`, so they need every key of a namespace on one node. The backend
//! supports standalone servers and replicated setups with a single primary, not Redis
//! Cluster.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::TimeDelta;
use drudge::{
    backend::{BackendError, DEFAULT_STALE_AFTER},
    clock::{Clock, SystemClock},
    rate_limit::{CounterStore, CounterStoreError},
};
use redis::{aio::ConnectionManager, Client, ErrorKind, RedisError, Script};

mod backend;
mod keys;
mod stored;

use keys::NameSpace;

const DEFAULT_NAMESPACE: &str = "drudge";

#[derive(Clone)]
struct Scripts {
    claim: Script,
    heartbeat: Script,
    release: Script,
    delete: Script,
    fail: Script,
    retry: Script,
    prune: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            claim: Script::new(include_str!("lua/claim.lua")),
            heartbeat: Script::new(include_str!("lua/heartbeat.lua")),
            release: Script::new(include_str!("lua/release.lua")),
            delete: Script::new(include_str!("lua/delete.lua")),
            fail: Script::new(include_str!("lua/fail.lua")),
            retry: Script::new(include_str!("lua/retry.lua")),
            prune: Script::new(include_str!("lua/prune.lua")),
        }
    }
}

/// A Redis implementation of [`drudge::backend::Backend`].
#[derive(Clone)]
pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: NameSpace,
    scripts: Scripts,
    clock: Arc<dyn Clock>,
    stale_after: TimeDelta,
}

impl RedisBackend {
    /// Connects to `redis_url`, keeping keys under the default `drudge` namespace.
    pub async fn from_url(redis_url: &str) -> Result<Self, BackendError> {
        let client = Client::open(redis_url).map_err(map_err)?;
        Self::from_client(client).await
    }

    pub async fn from_client(client: Client) -> Result<Self, BackendError> {
        Ok(Self {
            conn: ConnectionManager::new(client).await.map_err(map_err)?,
            namespace: NameSpace(DEFAULT_NAMESPACE.to_owned()),
            scripts: Scripts::load(),
            clock: Arc::new(SystemClock),
            stale_after: DEFAULT_STALE_AFTER,
        })
    }

    /// Keeps keys under `namespace`, so several independent engines can share one server.
    pub fn with_namespace(self, namespace: impl ToString) -> Self {
        Self {
            namespace: NameSpace(namespace.to_string()),
            ..self
        }
    }

    /// Sets how long a reservation lasts before another worker can reclaim the job.
    pub fn with_stale_after(self, stale_after: TimeDelta) -> Self {
        Self {
            stale_after,
            ..self
        }
    }

    /// Reads time from `clock` when scoring jobs.
    ///
    /// All workers sharing a server must agree on the time for delays to be honoured.
    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// A counter store for the rate limiter on the same connection.
    pub fn counter_store(&self) -> RedisCounterStore {
        RedisCounterStore::new(self.conn.clone())
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("namespace", &self.namespace.0)
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

/// A [`CounterStore`] keeping rate limit windows as expiring Redis counters.
#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
    increment: Script,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            increment: Script::new(include_str!("lua/increment.lua")),
        }
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let count = self
            .increment
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut self.conn.clone())
            .await?;
        Ok(count)
    }
}

pub(crate) fn map_err(error: RedisError) -> BackendError {
    match error.kind() {
        ErrorKind::TypeError => BackendError::Corrupt(error.to_string()),
        _ => BackendError::unavailable(error),
    }
}

#[cfg(test)]
pub(crate) mod test {
    use drudge::rate_limit::RateLimiter;
    use rand::{distributions::Alphanumeric, Rng};

    use super::*;

    pub(crate) const REDIS_URL: &str = "redis://127.0.0.1/";

    /// A namespace no other test run shares.
    pub(crate) fn namespace() -> String {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();
        format!("drudge-test-{suffix}")
    }

    pub(crate) async fn backend() -> RedisBackend {
        RedisBackend::from_url(REDIS_URL)
            .await
            .unwrap()
            .with_namespace(namespace())
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn counter_store_counts_per_key() {
        let store = backend().await.counter_store();
        let prefix = namespace();
        let ttl = Duration::from_secs(60);

        assert_eq!(store.increment(&format!("{prefix}:a"), ttl).await.unwrap(), 1);
        assert_eq!(store.increment(&format!("{prefix}:a"), ttl).await.unwrap(), 2);
        assert_eq!(store.increment(&format!("{prefix}:b"), ttl).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore = "requires a running redis instance"]
    async fn limiter_denies_over_limit() {
        let limiter = RateLimiter::new(backend().await.counter_store());
        let key = namespace();

        assert!(limiter.attempt(&key, 1, 3600).await.unwrap());
        assert!(!limiter.attempt(&key, 1, 3600).await.unwrap());
    }
}
