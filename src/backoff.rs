//! Spacing of retry attempts.
//!
//! After a failed attempt the runner asks its [`Strategy`] how long to wait
//! before the job becomes due again. The stock schedule is
//! [`BackoffStrategy::exponential`] with base 4 over minutes: 4, 16, then 64
//! minutes after the first, second, and third failures.

use chrono::TimeDelta;
use rand::Rng as _;

/// Maps the 1-based number of the attempt that just failed to a delay.
pub trait Strategy {
    fn backoff(&self, attempt: u32) -> TimeDelta;
}

/// The same delay after every failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    pub delay: TimeDelta,
}

impl Strategy for Constant {
    fn backoff(&self, _attempt: u32) -> TimeDelta {
        self.delay
    }
}

/// `unit * base^attempt`, optionally capped.
///
/// The multiplier saturates at `i32::MAX` instead of overflowing, so very
/// large attempt numbers produce a long finite delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    pub base: i32,
    pub unit: TimeDelta,
    pub max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let multiplier = self.base.checked_pow(attempt).unwrap_or(i32::MAX);
        let delay = self.unit * multiplier;
        match self.max {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

/// Random spread added to a computed delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// Uniform offset in `[-delta, +delta]`.
    Absolute(TimeDelta),
    /// Uniform offset in `[-fraction, +fraction]` of the delay.
    Relative(f64),
}

impl Jitter {
    fn apply(&self, delay: TimeDelta) -> TimeDelta {
        let spread_ms = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(fraction) => (delay.num_milliseconds() as f64 * fraction) as i64,
        };
        if spread_ms <= 0 {
            return delay;
        }
        delay + TimeDelta::milliseconds(rand::thread_rng().gen_range(-spread_ms..=spread_ms))
    }
}

/// A [`Strategy`] with optional jitter and a floor.
///
/// ```
/// use brigade::backoff::{BackoffStrategy, Strategy};
/// use chrono::TimeDelta;
///
/// let strategy = BackoffStrategy::exponential(4, TimeDelta::minutes(1));
/// assert_eq!(strategy.backoff(1), TimeDelta::minutes(4));
/// assert_eq!(strategy.backoff(2), TimeDelta::minutes(16));
/// assert_eq!(strategy.backoff(3), TimeDelta::minutes(64));
/// ```
///
/// Caps and jitter are layered on with the builder methods:
///
/// ```
/// use brigade::backoff::{BackoffStrategy, Jitter, Strategy};
/// use chrono::TimeDelta;
///
/// let strategy = BackoffStrategy::exponential(4, TimeDelta::minutes(1))
///     .with_max(TimeDelta::minutes(30))
///     .with_jitter(Jitter::Relative(0.1));
/// assert!(strategy.backoff(5) <= TimeDelta::minutes(33));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl<T> BackoffStrategy<T> {
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Delays never drop below this floor, even after negative jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl BackoffStrategy<Constant> {
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Constant { delay })
    }
}

impl BackoffStrategy<Exponential> {
    pub const fn exponential(base: i32, unit: TimeDelta) -> Self {
        Self::new(Exponential {
            base,
            unit,
            max: None,
        })
    }

    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.strategy.max = Some(max);
        self
    }
}

impl<T: Strategy> Strategy for BackoffStrategy<T> {
    fn backoff(&self, attempt: u32) -> TimeDelta {
        let delay = self.strategy.backoff(attempt);
        let delay = match &self.jitter {
            Some(jitter) => jitter.apply(delay),
            None => delay,
        };
        delay.max(self.min)
    }
}
