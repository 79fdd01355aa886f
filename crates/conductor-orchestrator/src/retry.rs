use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff with jitter between step retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for any single delay, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter (0.0 – 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_base_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_ms(),
            max_delay_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffPolicy {
    /// Retry immediately.
    pub fn none() -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay without jitter before retry number `attempt` (0-based), capped.
    pub fn base_delay(&self, attempt: u32) -> u64 {
        let exp = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let delay = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        delay as u64
    }

    /// Delay before retry number `attempt`, including jitter, still capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = (base as f64 * self.jitter.clamp(0.0, 1.0)) as u64;
        let jitter = if spread > 0 {
            rand::thread_rng().gen_range(0..=spread)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter).min(self.max_delay_ms))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let policy = BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            multiplier: 2.0,
            jitter: 0.0,
        };
        assert_eq!(policy.base_delay(0), 100);
        assert_eq!(policy.base_delay(1), 200);
        assert_eq!(policy.base_delay(3), 800);
        assert_eq!(policy.base_delay(4), 1_000);
        assert_eq!(policy.base_delay(200), 1_000);
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = BackoffPolicy {
            base_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: 0.5,
        };
        for _ in 0..50 {
            let d = policy.delay(1).as_millis() as u64;
            assert!((200..=300).contains(&d), "delay {d} out of range");
        }
    }

    #[test]
    fn test_none_is_immediate() {
        let policy = BackoffPolicy::none();
        for attempt in 0..5 {
            assert_eq!(policy.delay(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn test_partial_config_defaults() {
        let policy: BackoffPolicy = toml::from_str("base_delay_ms = 50").unwrap();
        assert_eq!(policy.base_delay_ms, 50);
        assert_eq!(policy.max_delay_ms, 10_000);
        assert_eq!(policy.multiplier, 2.0);
    }
}
