//! Bounded retry for blocking operations.
//!
//! Broker startup is observed by polling: the runtime properties file until
//! a port appears, then the handshake until it succeeds. Both loops go
//! through [`retry_blocking`] so their budgets are explicit and testable.
//!
//! # Retry Strategy
//!
//! - Only retries errors for which [`SbwError::is_retryable`](crate::SbwError::is_retryable) holds
//! - Sleeps `initial_delay` before the first retry, then multiplies by `multiplier`
//! - Caps delay at `max_delay`
//! - Never retries more than `max_attempts` times

use rand::Rng;
use std::thread::sleep;
use std::time::Duration;

/// Retry budget for a blocking operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 = single attempt).
    pub max_attempts: u32,

    /// Backoff multiplier applied to the delay after each retry.
    ///
    /// 1.0 gives a fixed interval.
    pub multiplier: f32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Maximum delay between retries.
    pub max_delay: Duration,

    /// Randomize each delay by ±25%.
    pub jitter: bool,
}

impl Default for RetryConfig {
    /// Exponential backoff for transient socket errors.
    ///
    /// - `max_attempts`: 3
    /// - `multiplier`: 2.0
    /// - `initial_delay`: 100ms
    /// - `max_delay`: 5s
    fn default() -> Self {
        // ---
        Self {
            max_attempts: 3,
            multiplier: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    // ---

    /// `attempts` tries in total, `interval` apart, no jitter.
    pub fn fixed(attempts: u32, interval: Duration) -> Self {
        // ---
        Self {
            max_attempts: attempts.saturating_sub(1),
            multiplier: 1.0,
            initial_delay: interval,
            max_delay: interval,
            jitter: false,
        }
    }

    /// Single attempt.
    pub fn none() -> Self {
        Self::fixed(1, Duration::ZERO)
    }

    /// Total attempts including the first one.
    pub fn total_attempts(&self) -> u32 {
        self.max_attempts.saturating_add(1)
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent. The last error is returned on exhaustion.
pub fn retry_blocking<F, T>(config: &RetryConfig, mut operation: F) -> crate::Result<T>
where
    F: FnMut(u32) -> crate::Result<T>,
{
    // ---
    let mut attempt = 0;
    let mut current_delay = config.initial_delay;

    loop {
        match operation(attempt) {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() => {
                attempt += 1;

                if attempt > config.max_attempts {
                    crate::log_debug!(
                        "retry exhausted after {} attempts, last error: {}",
                        config.total_attempts(),
                        err
                    );
                    return Err(err);
                }

                let delay = if config.jitter {
                    apply_jitter(current_delay)
                } else {
                    current_delay
                };

                crate::log_debug!(
                    "retry attempt {}/{}, waiting {:?} before retry (error: {})",
                    attempt,
                    config.max_attempts,
                    delay,
                    err
                );

                sleep(delay);

                let next_delay =
                    Duration::from_secs_f64(current_delay.as_secs_f64() * config.multiplier as f64);
                current_delay = next_delay.min(config.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Apply ±25% jitter: `delay * random(0.75..=1.25)`.
fn apply_jitter(delay: Duration) -> Duration {
    // ---
    let jitter_multiplier = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_secs_f64(delay.as_secs_f64() * jitter_multiplier)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::SbwError;
    use std::time::Instant;

    #[test]
    fn test_no_retry_on_success() {
        // ---
        let mut calls = 0;
        let result = retry_blocking(&RetryConfig::default(), |_| {
            calls += 1;
            Ok::<_, SbwError>(42)
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_none_executes_once() {
        // ---
        let mut calls = 0;
        let result: crate::Result<()> = retry_blocking(&RetryConfig::none(), |_| {
            calls += 1;
            Err(SbwError::Unavailable("port".into()))
        });
        assert!(matches!(result, Err(SbwError::Unavailable(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_retry_until_success() {
        // ---
        let config = RetryConfig::fixed(5, Duration::from_millis(5));
        let result = retry_blocking(&config, |attempt| {
            if attempt < 2 {
                Err(SbwError::Unavailable("not yet".into()))
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }

    #[test]
    fn test_fixed_budget_is_exact() {
        // ---
        let config = RetryConfig::fixed(25, Duration::from_millis(2));
        let mut calls = 0;
        let result: crate::Result<()> = retry_blocking(&config, |_| {
            calls += 1;
            Err(SbwError::Unavailable("never".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 25);
    }

    #[test]
    fn test_no_retry_on_non_retryable_error() {
        // ---
        let mut calls = 0;
        let result: crate::Result<()> = retry_blocking(&RetryConfig::default(), |_| {
            calls += 1;
            Err(SbwError::communication("rejected"))
        });
        assert!(matches!(result, Err(SbwError::Communication { .. })));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_fixed_interval_timing() {
        // ---
        let config = RetryConfig::fixed(4, Duration::from_millis(30));
        let start = Instant::now();
        let _: crate::Result<()> =
            retry_blocking(&config, |_| Err(SbwError::Unavailable("x".into())));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90), "elapsed too short: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(500), "elapsed too long: {elapsed:?}");
    }

    #[test]
    fn test_max_delay_cap() {
        // ---
        let config = RetryConfig {
            max_attempts: 5,
            multiplier: 10.0,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter: true,
        };
        let start = Instant::now();
        let _: crate::Result<()> =
            retry_blocking(&config, |_| Err(SbwError::Unavailable("x".into())));
        assert!(start.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_range() {
        // ---
        let delay = Duration::from_millis(100);
        for _ in 0..100 {
            let jittered = apply_jitter(delay);
            assert!(jittered >= Duration::from_millis(75), "jitter too low: {jittered:?}");
            assert!(jittered <= Duration::from_millis(125), "jitter too high: {jittered:?}");
        }
    }
}
