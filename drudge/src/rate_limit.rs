//! Fixed window rate limiting for jobs.
//!
//! A job opts in by returning a [`RateLimit`] from [`Job::rate_limit`](crate::job::Job). Before
//! running such a job the worker asks its [`RateLimiter`] for admission; the limiter counts
//! attempts per key in windows aligned to multiples of the window length since the epoch, so
//! every worker sharing a [`CounterStore`] agrees on the window boundaries.
//!
//! # Example
//!
//! ```
//! # use drudge::prelude::*;
//! let limit = RateLimit::allow(10).minutes(1).by_key("reminders:ada");
//! assert_eq!(limit.window().unwrap(), TimeDelta::minutes(1));
//! ```
use std::{
    collections::HashMap,
    error::Error,
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};

const DEFAULT_PREFIX: &str = "drudge:rate_limit:";

/// How often a job may run within a time window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimit {
    limit: u64,
    seconds: Option<u64>,
    minutes: Option<u64>,
    hours: Option<u64>,
    key: Option<String>,
}

impl RateLimit {
    /// Allows `limit` runs per window. Exactly one window unit must be set afterwards.
    pub fn allow(limit: u64) -> Self {
        Self {
            limit,
            seconds: None,
            minutes: None,
            hours: None,
            key: None,
        }
    }

    pub fn seconds(self, seconds: u64) -> Self {
        Self {
            seconds: Some(seconds),
            ..self
        }
    }

    pub fn minutes(self, minutes: u64) -> Self {
        Self {
            minutes: Some(minutes),
            ..self
        }
    }

    pub fn hours(self, hours: u64) -> Self {
        Self {
            hours: Some(hours),
            ..self
        }
    }

    /// Counts runs under `key` instead of the job type's shared key.
    pub fn by_key(self, key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..self
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// The window length, or an error unless exactly one non-zero unit was given.
    pub fn window(&self) -> Result<TimeDelta, RateLimitError> {
        self.window_seconds().map(|seconds| TimeDelta::seconds(seconds as i64))
    }

    fn window_seconds(&self) -> Result<u64, RateLimitError> {
        let seconds = match (self.seconds, self.minutes, self.hours) {
            (Some(seconds), None, None) => seconds,
            (None, Some(minutes), None) => minutes.saturating_mul(60),
            (None, None, Some(hours)) => hours.saturating_mul(3600),
            (None, None, None) => return Err(RateLimitError::MissingTimeUnit),
            _ => return Err(RateLimitError::MultipleTimeUnits),
        };
        if seconds == 0 {
            return Err(RateLimitError::ZeroWindow);
        }
        Ok(seconds.min(i64::MAX as u64 / 1000))
    }
}

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("Rate limit has no time unit, set one of seconds, minutes or hours")]
    MissingTimeUnit,
    #[error("Rate limit sets more than one time unit")]
    MultipleTimeUnits,
    #[error("Rate limit window must be longer than zero")]
    ZeroWindow,
    #[error("Rate limit counter store failed: {0}")]
    Store(#[source] CounterStoreError),
}

pub type CounterStoreError = Box<dyn Error + Send + Sync>;

/// Shared storage for rate limit counters.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments the counter under `key`, creating it with a time to live of `ttl`
    /// when absent or expired, and returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError>;
}

/// A [`CounterStore`] local to the process.
#[derive(Debug, Clone)]
pub struct InMemoryCounterStore {
    counters: Arc<Mutex<HashMap<String, (u64, DateTime<Utc>)>>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryCounterStore {
    fn default() -> Self {
        Self {
            counters: Default::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let now = self.clock.now();
        let ttl = TimeDelta::from_std(ttl)?;
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters.retain(|_, (_, expires_at)| *expires_at > now);
        let (count, _) = counters.entry(key.to_owned()).or_insert((0, now + ttl));
        *count += 1;
        Ok(*count)
    }
}

/// Whether a rate limited job may run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The window is used up; try again after `retry_in`.
    Denied { retry_in: TimeDelta },
}

/// Counts attempts per key in fixed windows.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: impl CounterStore + 'static) -> Self {
        Self {
            store: Arc::new(store),
            clock: Arc::new(SystemClock),
            prefix: DEFAULT_PREFIX.to_owned(),
        }
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    /// Namespaces the counter keys, so applications sharing a store do not collide.
    pub fn with_prefix(self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            ..self
        }
    }

    /// Records an attempt under `key` and reports whether it is within `limit` for the current
    /// window of `window_seconds`.
    ///
    /// Denied attempts are counted too.
    pub async fn attempt(
        &self,
        key: &str,
        limit: u64,
        window_seconds: u64,
    ) -> Result<bool, RateLimitError> {
        if window_seconds == 0 {
            return Err(RateLimitError::ZeroWindow);
        }
        let window = self
            .clock
            .now()
            .timestamp()
            .div_euclid(window_seconds as i64);
        let key = format!("{}{key}:{window}", self.prefix);
        let count = self
            .store
            .increment(&key, Duration::from_secs(window_seconds))
            .await
            .map_err(RateLimitError::Store)?;
        Ok(count <= limit)
    }

    /// Applies `limit`, counting under `default_key` unless the limit names its own key.
    pub async fn admit(
        &self,
        limit: &RateLimit,
        default_key: &str,
    ) -> Result<Admission, RateLimitError> {
        let window_seconds = limit.window_seconds()?;
        let key = limit.key().unwrap_or(default_key);
        if self.attempt(key, limit.limit, window_seconds).await? {
            Ok(Admission::Allowed)
        } else {
            Ok(Admission::Denied {
                retry_in: TimeDelta::seconds(window_seconds as i64),
            })
        }
    }
}

impl Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("clock", &self.clock)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// The counter key shared by all instances of a job type without an explicit key.
pub(crate) fn default_key(job_type: &str) -> String {
    format!("job:{job_type}")
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use mockall::predicate::{always, eq};

    use super::*;
    use crate::clock::MockClock;

    #[test]
    fn window_requires_exactly_one_unit() {
        assert_matches!(
            RateLimit::allow(1).window(),
            Err(RateLimitError::MissingTimeUnit)
        );
        assert_matches!(
            RateLimit::allow(1).seconds(1).minutes(1).window(),
            Err(RateLimitError::MultipleTimeUnits)
        );
        assert_matches!(
            RateLimit::allow(1).hours(0).window(),
            Err(RateLimitError::ZeroWindow)
        );
        assert_eq!(
            RateLimit::allow(1).hours(2).window().unwrap(),
            TimeDelta::hours(2)
        );
    }

    #[tokio::test]
    async fn attempt_counts_within_aligned_windows() {
        let start = DateTime::from_timestamp(1_700_000_040, 0).unwrap();
        let clock = MockClock::new(start);
        let limiter = RateLimiter::new(InMemoryCounterStore::new().with_clock(clock.clone()))
            .with_clock(clock.clone());

        assert!(limiter.attempt("mail", 2, 60).await.unwrap());
        assert!(limiter.attempt("mail", 2, 60).await.unwrap());
        assert!(!limiter.attempt("mail", 2, 60).await.unwrap());
        assert!(limiter.attempt("other", 2, 60).await.unwrap());

        clock.advance(TimeDelta::seconds(19));
        assert!(!limiter.attempt("mail", 2, 60).await.unwrap());

        clock.advance(TimeDelta::seconds(1));
        assert!(limiter.attempt("mail", 2, 60).await.unwrap());
    }

    #[tokio::test]
    async fn attempt_uses_prefixed_window_key() {
        let clock = MockClock::new(DateTime::from_timestamp(125, 0).unwrap());
        let mut store = MockCounterStore::new();
        store
            .expect_increment()
            .with(eq("app:job:mail:2"), always())
            .times(1)
            .returning(|_, _| Ok(3));
        let limiter = RateLimiter::new(store)
            .with_clock(clock)
            .with_prefix("app:");

        assert!(!limiter.attempt("job:mail", 2, 60).await.unwrap());
    }

    #[tokio::test]
    async fn admit_prefers_explicit_key() {
        let mut store = MockCounterStore::new();
        store
            .expect_increment()
            .withf(|key, ttl| key.contains("user:7") && *ttl == Duration::from_secs(3600))
            .times(1)
            .returning(|_, _| Ok(1));
        let limiter = RateLimiter::new(store);

        let admission = limiter
            .admit(&RateLimit::allow(1).hours(1).by_key("user:7"), "job:mail")
            .await
            .unwrap();

        assert_eq!(admission, Admission::Allowed);
    }

    #[tokio::test]
    async fn admit_denial_retries_after_window() {
        let mut store = MockCounterStore::new();
        store.expect_increment().returning(|_, _| Ok(2));
        let limiter = RateLimiter::new(store);

        let admission = limiter
            .admit(&RateLimit::allow(1).seconds(30), &default_key("mail"))
            .await
            .unwrap();

        assert_eq!(
            admission,
            Admission::Denied {
                retry_in: TimeDelta::seconds(30)
            }
        );
    }

    #[tokio::test]
    async fn admit_surfaces_store_errors() {
        let mut store = MockCounterStore::new();
        store
            .expect_increment()
            .returning(|_, _| Err("connection refused".into()));
        let limiter = RateLimiter::new(store);

        assert_matches!(
            limiter.admit(&RateLimit::allow(1).seconds(1), "job:mail").await,
            Err(RateLimitError::Store(_))
        );
    }

    #[tokio::test]
    async fn admit_rejects_invalid_limit_without_touching_store() {
        let store = MockCounterStore::new();
        let limiter = RateLimiter::new(store);

        assert_matches!(
            limiter.admit(&RateLimit::allow(1), "job:mail").await,
            Err(RateLimitError::MissingTimeUnit)
        );
    }
}
