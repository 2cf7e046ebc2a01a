//! Retry delay helpers for use in [`Job::retry_after`](crate::job::Job::retry_after).
//!
//! # Example
//!
//! ```
//! # use drudge::prelude::*;
//! let backoff = Backoff::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::minutes(1));
//!
//! assert_eq!(backoff.delay(0), TimeDelta::seconds(2));
//! assert_eq!(backoff.delay(3), TimeDelta::seconds(16));
//! assert_eq!(backoff.delay(10), TimeDelta::minutes(1));
//! ```
use chrono::TimeDelta;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Growth {
    Constant,
    Linear,
    Exponential,
}

/// A delay that grows with the number of attempts already made.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: TimeDelta,
    growth: Growth,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
}

/// Random variation added to a delay so retries from many jobs spread out.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Up to this much time either side of the delay.
    Absolute(TimeDelta),
    /// Up to this fraction of the delay either side of it.
    Relative(f64),
}

impl Backoff {
    /// Always `delay`.
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(delay, Growth::Constant)
    }

    /// `step` multiplied by the attempt number, starting from one.
    pub const fn linear(step: TimeDelta) -> Self {
        Self::new(step, Growth::Linear)
    }

    /// `base` doubled for every attempt already made.
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(base, Growth::Exponential)
    }

    const fn new(base: TimeDelta, growth: Growth) -> Self {
        Self {
            base,
            growth,
            max: None,
            jitter: None,
        }
    }

    /// Caps the delay before jitter is applied.
    pub const fn with_max(self, max: TimeDelta) -> Self {
        Self {
            max: Some(max),
            ..self
        }
    }

    pub const fn with_jitter(self, jitter: Jitter) -> Self {
        Self {
            jitter: Some(jitter),
            ..self
        }
    }

    /// The delay to wait after a failure when `attempts` attempts had already been made.
    pub fn delay(&self, attempts: u16) -> TimeDelta {
        let delay = match self.growth {
            Growth::Constant => self.base,
            Growth::Linear => self
                .base
                .checked_mul(i32::from(attempts) + 1)
                .unwrap_or(TimeDelta::MAX),
            Growth::Exponential => 2_i32
                .checked_pow(u32::from(attempts))
                .and_then(|factor| self.base.checked_mul(factor))
                .unwrap_or(TimeDelta::MAX),
        };
        let delay = self.max.map_or(delay, |max| delay.min(max));
        match self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        }
    }
}

impl Jitter {
    fn apply(&self, delay: TimeDelta) -> TimeDelta {
        let spread = match *self {
            Self::Absolute(spread) => spread.num_milliseconds(),
            Self::Relative(fraction) => (delay.num_milliseconds() as f64 * fraction) as i64,
        }
        .abs();
        if spread == 0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        delay
            .checked_add(&TimeDelta::milliseconds(offset))
            .unwrap_or(delay)
            .max(TimeDelta::zero())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn constant() {
        let backoff = Backoff::constant(TimeDelta::seconds(10));

        assert_eq!(backoff.delay(0), TimeDelta::seconds(10));
        assert_eq!(backoff.delay(7), TimeDelta::seconds(10));
    }

    #[test]
    fn linear() {
        let backoff = Backoff::linear(TimeDelta::seconds(5)).with_max(TimeDelta::seconds(12));

        assert_eq!(backoff.delay(0), TimeDelta::seconds(5));
        assert_eq!(backoff.delay(1), TimeDelta::seconds(10));
        assert_eq!(backoff.delay(2), TimeDelta::seconds(12));
    }

    #[test]
    fn exponential_saturates() {
        let backoff = Backoff::exponential(TimeDelta::seconds(1));

        assert_eq!(backoff.delay(4), TimeDelta::seconds(16));
        assert_eq!(backoff.delay(u16::MAX), TimeDelta::MAX);
    }

    #[test]
    fn jitter_stays_within_spread() {
        let absolute = Backoff::constant(TimeDelta::seconds(10))
            .with_jitter(Jitter::Absolute(TimeDelta::seconds(2)));
        let relative =
            Backoff::constant(TimeDelta::seconds(10)).with_jitter(Jitter::Relative(0.5));

        for _ in 0..100 {
            let delay = absolute.delay(0);
            assert!(delay >= TimeDelta::seconds(8) && delay <= TimeDelta::seconds(12));
            let delay = relative.delay(0);
            assert!(delay >= TimeDelta::seconds(5) && delay <= TimeDelta::seconds(15));
        }
    }
}
