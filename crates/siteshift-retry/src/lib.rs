//! Retry strategies and backoff policies for migration operations.
//!
//! This crate provides configurable retry strategies with support for:
//! - Multiple backoff strategies (immediate, exponential, linear, constant)
//! - Jitter for avoiding thundering herd problems
//! - Per-error-type configuration
//! - Predefined policies for the scheduler and subprocess paths
//!
//! # Example
//!
//! ```
//! use siteshift_retry::{RetryPolicy, RetryStrategyConfig, calculate_delay};
//! use std::time::Duration;
//!
//! // Use a predefined policy
//! let config = RetryPolicy::Scheduler.to_config();
//! let delay = calculate_delay(&config, 2);
//! println!("Retry after: {:?}", delay);
//!
//! // Custom configuration
//! let custom = RetryStrategyConfig {
//!     max_attempts: 5,
//!     base_delay: Duration::from_secs(1),
//!     max_delay: Duration::from_secs(30),
//!     ..Default::default()
//! };
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default)
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt
    Linear,
    /// Constant delay: same delay every attempt
    Constant,
}

/// Predefined retry policies for the retry paths siteshift actually has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Balanced behavior for general operations
    #[default]
    Default,
    /// Failed scheduled migrations: capped exponential starting at two
    /// minutes (2, 4, 8 minutes)
    Scheduler,
    /// Transient subprocess/network errors: one retry, then fail
    Subprocess,
    /// Fully custom configuration
    Custom,
}

impl RetryPolicy {
    /// Get the default retry configuration for this policy.
    pub fn to_config(&self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            RetryPolicy::Scheduler => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 3,
                base_delay: Duration::from_secs(120),
                max_delay: Duration::from_secs(3600),
                jitter: 0.0,
            },
            RetryPolicy::Subprocess => RetryStrategyConfig {
                strategy: RetryStrategyType::Constant,
                max_attempts: 2,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(1),
                jitter: 0.0,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of attempts, including the first one.
    #[serde(default)]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(default = "default_base_delay")]
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(default = "default_max_delay")]
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default)]
    pub jitter: f64,
}

fn default_base_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyType::Exponential,
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(120),
            jitter: 0.5,
        }
    }
}

/// Error classification for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Error is transient and should be retried
    #[default]
    Retryable,
    /// Error outcome is unknown (the operation may have succeeded)
    Ambiguous,
    /// Error is permanent and should not be retried
    Permanent,
}

/// Calculate the delay for the next retry attempt based on the strategy configuration.
///
/// `attempt` is 1-indexed: attempt 1 is the delay after the first
/// failure.
///
/// # Example
///
/// ```
/// use siteshift_retry::{RetryStrategyConfig, RetryStrategyType, calculate_delay};
/// use std::time::Duration;
///
/// let config = RetryStrategyConfig {
///     strategy: RetryStrategyType::Exponential,
///     base_delay: Duration::from_secs(120),
///     max_delay: Duration::from_secs(3600),
///     jitter: 0.0,
///     max_attempts: 3,
/// };
///
/// assert_eq!(calculate_delay(&config, 1), Duration::from_secs(120));
/// assert_eq!(calculate_delay(&config, 2), Duration::from_secs(240));
/// assert_eq!(calculate_delay(&config, 3), Duration::from_secs(480));
/// ```
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay value.
/// Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_value: f64 = rand::random();
    let random_factor = 1.0 - jitter + (random_value * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Whether another attempt is allowed after `attempt` failures.
pub fn should_retry(config: &RetryStrategyConfig, attempt: u32, class: ErrorClass) -> bool {
    class != ErrorClass::Permanent && attempt < config.max_attempts
}

/// A retry executor that runs a fallible operation with configured retry behavior.
pub struct RetryExecutor {
    config: RetryStrategyConfig,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration.
    pub fn new(config: RetryStrategyConfig) -> Self {
        Self { config }
    }

    /// Create a retry executor from a predefined policy.
    pub fn from_policy(policy: RetryPolicy) -> Self {
        Self::new(policy.to_config())
    }

    /// Execute a fallible operation with retry behavior.
    ///
    /// The operation receives the current attempt number (starting at 1).
    pub fn run<T, E, F>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 1;

        loop {
            match operation(attempt) {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt >= self.config.max_attempts {
                        return Err(e);
                    }

                    let delay = calculate_delay(&self.config, attempt);
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_policy_delays() {
        let config = RetryPolicy::Scheduler.to_config();
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(120));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(240));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(480));
    }

    #[test]
    fn test_subprocess_policy_single_retry() {
        let config = RetryPolicy::Subprocess.to_config();
        assert_eq!(config.max_attempts, 2);
        assert!(should_retry(&config, 1, ErrorClass::Retryable));
        assert!(!should_retry(&config, 2, ErrorClass::Retryable));
    }

    #[test]
    fn test_permanent_errors_never_retry() {
        let config = RetryPolicy::Default.to_config();
        assert!(!should_retry(&config, 1, ErrorClass::Permanent));
    }

    #[test]
    fn test_calculate_delay_immediate() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 3,
        };

        assert_eq!(calculate_delay(&config, 1), Duration::ZERO);
        assert_eq!(calculate_delay(&config, 5), Duration::ZERO);
    }

    #[test]
    fn test_calculate_delay_linear() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            base_delay: Duration::from_secs(3),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 10,
        };

        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(3));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(6));
        assert_eq!(calculate_delay(&config, 4), Duration::from_secs(12));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(120),
            max_delay: Duration::from_secs(3600),
            jitter: 0.0,
            max_attempts: 16,
        };

        assert_eq!(calculate_delay(&config, 12), Duration::from_secs(3600));
    }

    #[test]
    fn test_executor_retries_until_success() {
        let executor = RetryExecutor::new(RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            max_attempts: 4,
        });

        let result: Result<u32, &str> =
            executor.run(|attempt| if attempt < 3 { Err("transient") } else { Ok(attempt) });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn test_executor_gives_up_after_max_attempts() {
        let executor = RetryExecutor::new(RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            max_attempts: 2,
        });

        let mut calls = 0;
        let result: Result<(), &str> = executor.run(|_| {
            calls += 1;
            Err("always")
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Delay with no jitter never exceeds the configured cap.
            #[test]
            fn delay_bounded_no_jitter(
                base_ms in 1u64..10_000,
                max_ms in 100u64..300_000,
                attempt in 1u32..100,
            ) {
                let config = RetryStrategyConfig {
                    strategy: RetryStrategyType::Exponential,
                    max_attempts: 100,
                    base_delay: Duration::from_millis(base_ms.min(max_ms)),
                    max_delay: Duration::from_millis(max_ms),
                    jitter: 0.0,
                };
                let delay = calculate_delay(&config, attempt);
                prop_assert!(delay <= config.max_delay);
            }

            /// Jittered delay stays within (1 ± jitter) of the capped value.
            #[test]
            fn jittered_delay_within_band(
                base_ms in 10u64..5_000,
                attempt in 1u32..8,
            ) {
                let config = RetryStrategyConfig {
                    strategy: RetryStrategyType::Exponential,
                    max_attempts: 10,
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_secs(600),
                    jitter: 0.5,
                };
                let unjittered = RetryStrategyConfig { jitter: 0.0, ..config.clone() };
                let capped = calculate_delay(&unjittered, attempt);
                let jittered = calculate_delay(&config, attempt);
                let lo = capped.as_millis() as f64 * 0.5 - 1.0;
                let hi = capped.as_millis() as f64 * 1.5 + 1.0;
                let got = jittered.as_millis() as f64;
                prop_assert!(got >= lo && got <= hi);
            }
        }
    }
}
