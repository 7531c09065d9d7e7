//! 断线重连的退避策略。
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, and then
//! jittered. The base is derived from the attempt number alone so jitter never
//! feeds back into later delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::telemetry::events::duration_to_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// Exact backoff delay.
    None,
    /// Uniform in `[0, delay]`.
    Full,
    /// `delay / 2` plus uniform in `[0, delay / 2]`.
    #[default]
    Equal,
    /// Uniform in `[first, delay * 3]`, capped at `max`.
    Decorrelated,
}

impl JitterPolicy {
    fn apply(&self, delay: Duration, first: Duration, max: Duration) -> Duration {
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => random_between(Duration::ZERO, delay),
            JitterPolicy::Equal => {
                let half = delay / 2;
                half + random_between(Duration::ZERO, delay - half)
            }
            JitterPolicy::Decorrelated => {
                let floor = first.min(max);
                let ceiling = delay.saturating_mul(3).min(max).max(floor);
                random_between(floor, ceiling)
            }
        }
    }
}

fn random_between(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let low_ms = duration_to_ms(low);
    let high_ms = duration_to_ms(high);
    Duration::from_millis(rand::thread_rng().gen_range(low_ms..=high_ms))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }
}

impl BackoffPolicy {
    /// Delay before reconnect attempt `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };

        self.jitter.apply(base, self.first, self.max)
    }
}

/// Backoff plus the ceiling after which the bus gives up.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub backoff: BackoffPolicy,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_attempts
            .map(|limit| failures >= limit)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: JitterPolicy) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter,
        }
    }

    #[test]
    fn grows_exponentially_without_jitter() {
        let policy = policy(JitterPolicy::None);
        assert_eq!(policy.next(0), Duration::from_millis(100));
        assert_eq!(policy.next(1), Duration::from_millis(200));
        assert_eq!(policy.next(3), Duration::from_millis(800));
    }

    #[test]
    fn caps_at_max() {
        let policy = policy(JitterPolicy::None);
        assert_eq!(policy.next(10), Duration::from_secs(5));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn equal_jitter_stays_within_half_and_full_delay() {
        let policy = policy(JitterPolicy::Equal);
        for attempt in 0..12 {
            let base = policy.next_base_for_test(attempt);
            let delay = policy.next(attempt);
            assert!(delay >= base / 2, "attempt {attempt}: {delay:?} < half of {base:?}");
            assert!(delay <= base, "attempt {attempt}: {delay:?} > {base:?}");
        }
    }

    #[test]
    fn full_and_decorrelated_jitter_never_exceed_max() {
        for jitter in [JitterPolicy::Full, JitterPolicy::Decorrelated] {
            let policy = policy(jitter);
            for attempt in 0..20 {
                assert!(policy.next(attempt) <= Duration::from_secs(5));
            }
        }
    }

    #[test]
    fn decorrelated_jitter_respects_floor() {
        let policy = policy(JitterPolicy::Decorrelated);
        for _ in 0..50 {
            assert!(policy.next(4) >= Duration::from_millis(100));
        }
    }

    #[test]
    fn reconnect_ceiling() {
        let bounded = ReconnectPolicy {
            backoff: BackoffPolicy::default(),
            max_attempts: Some(3),
        };
        assert!(!bounded.is_exhausted(2));
        assert!(bounded.is_exhausted(3));

        let unbounded = ReconnectPolicy {
            backoff: BackoffPolicy::default(),
            max_attempts: None,
        };
        assert!(!unbounded.is_exhausted(u32::MAX));
    }

    impl BackoffPolicy {
        fn next_base_for_test(&self, attempt: u32) -> Duration {
            BackoffPolicy {
                jitter: JitterPolicy::None,
                ..*self
            }
            .next(attempt)
        }
    }
}
