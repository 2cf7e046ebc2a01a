//! Sources of the current time.
//!
//! Everything in the engine that compares against "now" (claimability of delayed jobs, retry
//! timestamps, rate limit windows) reads it through a [`Clock`]. Production code uses
//! [`SystemClock`]; tests can use [`MockClock`] to move time by hand or [`TokioClock`] to follow
//! tokio's paused timer.
use std::{
    fmt::Debug,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, TimeDelta, Utc};

/// A source of the current instant.
pub trait Clock: Debug + Send + Sync {
    /// The current instant according to this clock.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant, so a test can hand one clone to a backend and keep another
/// to advance time.
///
/// # Example
///
/// ```
/// use chrono::{TimeDelta, Utc};
/// use drudge::clock::{Clock, MockClock};
///
/// let start = Utc::now();
/// let clock = MockClock::new(start);
/// clock.advance(TimeDelta::seconds(30));
///
/// assert_eq!(clock.now(), start + TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Creates a clock frozen at `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += delta;
    }

    /// Sets the clock to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A clock anchored to the wall clock at creation and advanced by tokio's timer.
///
/// Under `tokio::time::pause` the timer auto-advances whenever the runtime is idle, which makes
/// this clock useful for driving a worker through minutes of simulated time in a test.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: DateTime<Utc>,
    started: tokio::time::Instant,
}

impl TokioClock {
    /// Creates a clock reading the current wall time.
    pub fn new() -> Self {
        Self {
            origin: Utc::now(),
            started: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.started.elapsed()).unwrap_or(TimeDelta::zero());
        self.origin + elapsed
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn mock_clock_clones_share_time() {
        let start = Utc::now();
        let clock = MockClock::new(start);
        let other = clock.clone();

        other.advance(TimeDelta::minutes(5));

        assert_eq!(clock.now(), start + TimeDelta::minutes(5));

        clock.set(start);
        assert_eq!(other.now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_paused_time() {
        let clock = TokioClock::new();
        let before = clock.now();

        tokio::time::sleep(Duration::from_secs(90)).await;

        assert_eq!(clock.now() - before, TimeDelta::seconds(90));
    }
}
