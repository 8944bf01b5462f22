//! Retry policy, backoff and the injectable timing seams.
//!
//! Backoff is exponential and capped:
//! `backoff(n) = min(maxDelayMs, baseDelayMs * 2^(n-1))`, with jitter
//! `round(rand * jitterRatio * backoff)` added on top. Sleep and randomness
//! are traits so tests can run every retry path without real time passing.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Retry policy for a shard's unit of work
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// Delay before the first retry in milliseconds
    #[serde(default = "default_base_delay", alias = "base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap on the backoff in milliseconds
    #[serde(default = "default_max_delay", alias = "max_delay_ms")]
    pub max_delay_ms: u64,

    /// Fraction of the backoff added as random jitter, in [0, 1]
    #[serde(default = "default_jitter_ratio", alias = "jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    250
}
fn default_max_delay() -> u64 {
    4000
}
fn default_jitter_ratio() -> f64 {
    0.2
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

/// A policy that cannot be executed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryPolicyError {
    #[error("Retry policy needs at least one attempt")]
    NoAttempts,

    #[error("Retry policy maxDelayMs {max} is below baseDelayMs {base}")]
    MaxBelowBase { base: u64, max: u64 },

    #[error("Retry policy jitterRatio {0} is outside [0, 1]")]
    InvalidJitter(f64),
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn no_retry() -> Self {
        Self {
            attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter_ratio: 0.0,
        }
    }

    pub fn validate(&self) -> Result<(), RetryPolicyError> {
        if self.attempts == 0 {
            return Err(RetryPolicyError::NoAttempts);
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(RetryPolicyError::MaxBelowBase {
                base: self.base_delay_ms,
                max: self.max_delay_ms,
            });
        }
        if !self.jitter_ratio.is_finite() || !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(RetryPolicyError::InvalidJitter(self.jitter_ratio));
        }
        Ok(())
    }

    /// Capped exponential backoff for a 1-indexed attempt
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exponent;
        self.base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms)
    }

    /// Backoff plus jitter, with `rand` in [0, 1)
    pub fn delay_ms(&self, attempt: u32, rand: f64) -> u64 {
        let backoff = self.backoff_ms(attempt);
        let jitter = (rand.clamp(0.0, 1.0) * self.jitter_ratio * backoff as f64).round();
        backoff.saturating_add(jitter as u64)
    }

    pub fn delay_for_attempt(&self, attempt: u32, rand: f64) -> Duration {
        Duration::from_millis(self.delay_ms(attempt, rand))
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }
}

/// Where retry backoff waits
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real sleeping on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays without waiting
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    delays: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

/// Source of jitter randomness in [0, 1)
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Thread-local RNG from `rand`
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::thread_rng().gen::<f64>()
    }
}

/// Always the same value
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom(pub f64);

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.0
    }
}

/// Values in order, then zero
#[derive(Debug, Default)]
pub struct SequenceRandom {
    values: Mutex<VecDeque<f64>>,
}

impl SequenceRandom {
    pub fn new(values: impl IntoIterator<Item = f64>) -> Self {
        Self {
            values: Mutex::new(values.into_iter().collect()),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&self) -> f64 {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 80,
            jitter_ratio: 0.25,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = policy();
        assert_eq!(policy.backoff_ms(1), 10);
        assert_eq!(policy.backoff_ms(2), 20);
        assert_eq!(policy.backoff_ms(3), 40);
        assert_eq!(policy.backoff_ms(4), 80);
        assert_eq!(policy.backoff_ms(10), 80);
        assert_eq!(policy.backoff_ms(200), 80);
    }

    #[test]
    fn test_jitter_rounds() {
        let policy = policy();
        assert_eq!(policy.delay_ms(1, 0.0), 10);
        // 0.5 * 0.25 * 20 = 2.5 -> 3
        assert_eq!(policy.delay_ms(2, 0.5), 23);
        assert_eq!(policy.delay_ms(4, 0.99), 100);
        assert_eq!(policy.delay_for_attempt(1, 0.0), Duration::from_millis(10));
    }

    #[test]
    fn test_should_retry() {
        let policy = policy();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::no_retry().should_retry(1));
    }

    #[test]
    fn test_validation() {
        assert!(policy().validate().is_ok());
        assert!(RetryPolicy::default().validate().is_ok());

        let bad = RetryPolicy { attempts: 0, ..policy() };
        assert_eq!(bad.validate(), Err(RetryPolicyError::NoAttempts));

        let bad = RetryPolicy { max_delay_ms: 5, ..policy() };
        assert!(matches!(bad.validate(), Err(RetryPolicyError::MaxBelowBase { .. })));

        let bad = RetryPolicy { jitter_ratio: 1.5, ..policy() };
        assert!(bad.validate().is_err());
        let bad = RetryPolicy { jitter_ratio: f64::NAN, ..policy() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_policy_serde_defaults_and_aliases() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"attempts": 2}"#).unwrap();
        assert_eq!(policy.base_delay_ms, 250);
        assert_eq!(policy.max_delay_ms, 4000);

        let policy: RetryPolicy =
            serde_yaml::from_str("attempts: 5\nbase_delay_ms: 1\nmax_delay_ms: 2\njitter_ratio: 0\n")
                .unwrap();
        assert_eq!(policy.attempts, 5);
        assert_eq!(policy.max_delay_ms, 2);

        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["baseDelayMs"], 1);
        assert_eq!(json["jitterRatio"], 0.0);
    }

    #[tokio::test]
    async fn test_recording_sleeper() {
        let sleeper = RecordingSleeper::new();
        sleeper.sleep(Duration::from_millis(5)).await;
        sleeper.sleep(Duration::from_millis(7)).await;
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(5), Duration::from_millis(7)]
        );
    }

    #[test]
    fn test_random_sources() {
        let seq = SequenceRandom::new([0.1, 0.9]);
        assert_eq!(seq.next_f64(), 0.1);
        assert_eq!(seq.next_f64(), 0.9);
        assert_eq!(seq.next_f64(), 0.0);
        assert_eq!(FixedRandom(0.3).next_f64(), 0.3);
        let r = ThreadRandom.next_f64();
        assert!((0.0..1.0).contains(&r));
    }
}
