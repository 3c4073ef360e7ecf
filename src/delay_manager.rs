use std::thread;
use std::time::Duration;

use log::{info, warn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};

/// Inclusive range of seconds to wait between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl DelayRange {
    pub const fn new(min: u64, max: u64) -> Self {
        DelayRange { min, max }
    }

    pub const fn none() -> Self {
        DelayRange { min: 0, max: 0 }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.min > self.max {
            return Err(HarvestError::Configuration(format!(
                "{}: min {} exceeds max {}",
                name, self.min, self.max
            )));
        }
        Ok(())
    }

    pub fn sample(&self) -> Duration {
        if self.max == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::thread_rng();
        Duration::from_secs(rng.gen_range(self.min..=self.max))
    }
}

pub fn random_page_delay(range: DelayRange) {
    random_delay(range, "Page Delay");
}

pub fn random_employer_delay(range: DelayRange) {
    random_delay(range, "Employer Delay");
}

fn random_delay(range: DelayRange, label: &str) {
    let delay = range.sample();
    if delay.is_zero() {
        return;
    }
    info!("Waiting for {} seconds ({})...", delay.as_secs(), label);
    thread::sleep(delay);
}

/// Capped exponential backoff: `base * 2^attempt`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 5,
            backoff_base_ms: 2_000,
            backoff_max_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub const fn immediate(max_retries: u32) -> Self {
        RetryPolicy {
            max_retries,
            backoff_base_ms: 0,
            backoff_max_ms: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(HarvestError::Configuration(format!(
                "retry: backoff_base_ms {} exceeds backoff_max_ms {}",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        Ok(())
    }

    /// Delay before retry number `attempt` (zero-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
        let ms = self
            .backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms);
        Duration::from_millis(ms)
    }

    /// Sleeps before retry `attempt`; `what` only feeds the log line.
    pub fn backoff(&self, attempt: u32, what: &str) {
        let delay = self.delay_for(attempt);
        warn!(
            "Retrying {} ({}/{}) in {} ms",
            what,
            attempt + 1,
            self.max_retries,
            delay.as_millis()
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(63), Duration::from_millis(1_000));
    }

    #[test]
    fn zero_range_never_sleeps() {
        assert_eq!(DelayRange::none().sample(), Duration::ZERO);
    }

    #[test]
    fn sampled_delay_stays_in_range() {
        let range = DelayRange::new(2, 4);
        for _ in 0..50 {
            let secs = range.sample().as_secs();
            assert!((2..=4).contains(&secs));
        }
    }
}
