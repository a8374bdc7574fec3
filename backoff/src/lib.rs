//! Bound the total time spent retrying a fallible operation.
//!
//! A [Backoff] is created once per logical wait and consumed across repeated calls to
//! [Backoff::wait]. The deadline is fixed at construction (from a monotonic clock) and never
//! extended: a wait that would overrun it fails immediately with [Error::Timeout] instead of
//! sleeping, so the sum of all realized sleeps never exceeds the configured timeout.
//!
//! # Example
//!
//! ```rust
//! use sequencer_harness_backoff::{Backoff, Config};
//! use std::time::Duration;
//!
//! # async fn fetch() -> Result<u64, ()> { Ok(1) }
//! # async fn example() {
//! let mut backoff = Backoff::new(Config::exponential(Duration::from_secs(10))).unwrap();
//! let value = loop {
//!     match fetch().await {
//!         Ok(value) => break value,
//!         Err(_) => backoff.wait().await.expect("gave up"),
//!     }
//! };
//! # }
//! ```

use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Upper bound on the delay reached by exponential backoff.
pub const MAX_DELAY: Duration = Duration::from_secs(5);

/// Deadline used when the configured timeout cannot be represented as an [Instant].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Initial delay used by [Config::exponential].
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Errors that can occur when creating or waiting on a [Backoff].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("initial delay must be non-zero")]
    InvalidDelay,
    #[error("timeout ({timeout:?}) must exceed initial delay ({delay:?})")]
    TimeoutTooShort { timeout: Duration, delay: Duration },
    #[error("timeout after {waits} waits")]
    Timeout { waits: usize },
}

/// Configuration for a [Backoff].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Total time budget, measured from construction of the [Backoff].
    pub timeout: Duration,

    /// Delay of the first wait.
    pub initial_delay: Duration,

    /// Whether to double the delay after each wait (up to [MAX_DELAY]).
    pub exponential: bool,
}

impl Config {
    /// Wait `delay` between every attempt.
    pub const fn fixed(timeout: Duration, delay: Duration) -> Self {
        Self {
            timeout,
            initial_delay: delay,
            exponential: false,
        }
    }

    /// Start at [DEFAULT_INITIAL_DELAY] and double after every wait.
    pub const fn exponential(timeout: Duration) -> Self {
        Self {
            timeout,
            initial_delay: DEFAULT_INITIAL_DELAY,
            exponential: true,
        }
    }
}

/// A bounded retry session.
#[derive(Debug)]
pub struct Backoff {
    start: Instant,
    deadline: Instant,
    delay: Duration,
    exponential: bool,
    waits: usize,
}

impl Backoff {
    /// Creates a new [Backoff], starting the clock immediately.
    pub fn new(cfg: Config) -> Result<Self, Error> {
        if cfg.initial_delay.is_zero() {
            return Err(Error::InvalidDelay);
        }
        if cfg.timeout <= cfg.initial_delay {
            return Err(Error::TimeoutTooShort {
                timeout: cfg.timeout,
                delay: cfg.initial_delay,
            });
        }
        let start = Instant::now();
        let deadline = start
            .checked_add(cfg.timeout)
            .unwrap_or_else(|| start + FAR_FUTURE);
        Ok(Self {
            start,
            deadline,
            delay: cfg.initial_delay,
            exponential: cfg.exponential,
            waits: 0,
        })
    }

    /// Sleeps for the current delay.
    ///
    /// Returns [Error::Timeout] without sleeping if the sleep would end after the deadline.
    pub async fn wait(&mut self) -> Result<(), Error> {
        match Instant::now().checked_add(self.delay) {
            Some(end) if end <= self.deadline => {}
            _ => return Err(Error::Timeout { waits: self.waits }),
        }
        sleep(self.delay).await;
        if self.exponential {
            self.delay = self.delay.saturating_mul(2).min(MAX_DELAY);
        }
        self.waits += 1;
        Ok(())
    }

    /// Returns the time left before the deadline (zero once expired).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Returns whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Returns the time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Returns the delay the next call to [Backoff::wait] will sleep for.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Returns the number of completed waits.
    pub fn waits(&self) -> usize {
        self.waits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use test_case::test_case;

    fn secs(secs: u64) -> Duration {
        Duration::from_secs(secs)
    }

    #[test_traced]
    fn test_zero_delay_rejected() {
        let err = Backoff::new(Config::fixed(secs(10), Duration::ZERO)).unwrap_err();
        assert_eq!(err, Error::InvalidDelay);
    }

    #[test_case(secs(1), secs(1); "equal")]
    #[test_case(secs(1), secs(2); "shorter")]
    fn test_timeout_must_exceed_delay(timeout: Duration, delay: Duration) {
        let err = Backoff::new(Config::fixed(timeout, delay)).unwrap_err();
        assert_eq!(err, Error::TimeoutTooShort { timeout, delay });
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_delay_is_constant() {
        let mut backoff = Backoff::new(Config::fixed(secs(10), secs(2))).unwrap();
        for _ in 0..4 {
            assert_eq!(backoff.delay(), secs(2));
            backoff.wait().await.unwrap();
        }
        assert_eq!(backoff.delay(), secs(2));
        assert_eq!(backoff.waits(), 4);
        assert_eq!(backoff.elapsed(), secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_delay_doubles_until_cap() {
        let mut backoff = Backoff::new(Config::exponential(secs(60))).unwrap();
        let mut delays = Vec::new();
        while backoff.wait().await.is_ok() {
            delays.push(backoff.delay());
        }
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert!(delays.iter().all(|delay| *delay <= MAX_DELAY));
        assert_eq!(delays[0], Duration::from_millis(200));
        assert_eq!(*delays.last().unwrap(), MAX_DELAY);
    }

    #[test_case(secs(10), secs(1), false; "fixed")]
    #[test_case(secs(10), secs(3), false; "fixed uneven")]
    #[test_case(secs(30), Duration::from_millis(100), true; "exponential")]
    #[test_case(Duration::from_millis(2500), Duration::from_millis(700), true; "exponential short")]
    #[tokio::test(start_paused = true)]
    async fn test_sleeps_never_exceed_timeout(
        timeout: Duration,
        delay: Duration,
        exponential: bool,
    ) {
        let mut backoff = Backoff::new(Config {
            timeout,
            initial_delay: delay,
            exponential,
        })
        .unwrap();
        let mut slept = Duration::ZERO;
        loop {
            let before = Instant::now();
            let result = backoff.wait().await;
            let realized = before.elapsed();
            if let Err(err) = result {
                // The final wait fails without sleeping
                assert_eq!(realized, Duration::ZERO);
                assert_eq!(err, Error::Timeout { waits: backoff.waits() });
                break;
            }
            slept += realized;
        }
        assert!(slept <= timeout);
        assert_eq!(slept, backoff.elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_saturates() {
        let mut backoff = Backoff::new(Config::fixed(secs(3), secs(1))).unwrap();
        assert_eq!(backoff.remaining(), secs(3));
        backoff.wait().await.unwrap();
        assert_eq!(backoff.remaining(), secs(2));
        tokio::time::advance(secs(5)).await;
        assert_eq!(backoff.remaining(), Duration::ZERO);
        assert!(backoff.expired());
        assert!(backoff.wait().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_failures_then_success() {
        let mut backoff = Backoff::new(Config::fixed(secs(10), secs(1))).unwrap();
        let mut attempts = 0;
        loop {
            attempts += 1;
            if attempts == 6 {
                break;
            }
            backoff.wait().await.unwrap();
        }
        assert_eq!(backoff.waits(), 5);
        assert_eq!(backoff.elapsed(), secs(5));
        assert!(!backoff.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout() {
        let mut backoff = Backoff::new(Config::fixed(Duration::MAX, secs(1))).unwrap();
        assert!(backoff.remaining() >= FAR_FUTURE - secs(1));
        backoff.wait().await.unwrap();
        assert_eq!(backoff.elapsed(), secs(1));
        assert!(!backoff.expired());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_delay_times_out() {
        let max = Duration::MAX - secs(1);
        let mut backoff = Backoff::new(Config::fixed(Duration::MAX, max)).unwrap();
        assert_eq!(backoff.wait().await, Err(Error::Timeout { waits: 0 }));
        assert_eq!(backoff.elapsed(), Duration::ZERO);
    }
}
