//! Per-topic backoff state for rate-limited log requests.
//!
//! Pure state machine: no clock access, no sleeping. The poller decides when
//! to wait; this only tracks how long.

use std::time::Duration;

use serde::{Deserialize, Serialize};

// ─── Policy ──────────────────────────────────────────────────────────

/// Backoff bounds. The delay never drops below `base_delay` and never rises
/// above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Floor of the delay (default 1s).
    pub base_delay: Duration,
    /// Ceiling of the delay (default 60s).
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

// ─── Backoff ─────────────────────────────────────────────────────────

/// Current delay for one topic.
///
/// Rate limit: double, capped at `max_delay`. Success: halve, floored at
/// `base_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.base_delay,
            policy,
        }
    }

    /// Record a rate-limit rejection. Returns the delay to wait before the
    /// next request on this topic.
    pub fn on_rate_limited(&mut self) -> Duration {
        self.current = self
            .current
            .saturating_mul(2)
            .min(self.policy.max_delay)
            .max(self.policy.base_delay);
        self.current
    }

    /// Record a successful request.
    pub fn on_success(&mut self) -> Duration {
        self.current = (self.current / 2).max(self.policy.base_delay);
        self.current
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn policy(base_ms: u64, max_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
        }
    }

    #[test]
    fn starts_at_base() {
        let b = Backoff::new(policy(500, 8_000));
        assert_eq!(b.current(), Duration::from_millis(500));
    }

    #[test]
    fn doubles_until_ceiling() {
        let mut b = Backoff::new(policy(1_000, 5_000));
        assert_eq!(b.on_rate_limited(), Duration::from_millis(2_000));
        assert_eq!(b.on_rate_limited(), Duration::from_millis(4_000));
        assert_eq!(b.on_rate_limited(), Duration::from_millis(5_000));
        assert_eq!(b.on_rate_limited(), Duration::from_millis(5_000));
    }

    #[test]
    fn success_halves_but_not_below_base() {
        let mut b = Backoff::new(policy(1_000, 60_000));
        b.on_rate_limited();
        b.on_rate_limited();
        b.on_rate_limited(); // 8s
        assert_eq!(b.on_success(), Duration::from_millis(4_000));
        assert_eq!(b.on_success(), Duration::from_millis(2_000));
        assert_eq!(b.on_success(), Duration::from_millis(1_000));
        assert_eq!(b.on_success(), Duration::from_millis(1_000));
    }

    proptest! {
        #[test]
        fn rate_limits_strictly_increase_until_ceiling(
            base in 1u64..5_000,
            factor in 1u64..64,
            steps in 1usize..20,
        ) {
            let p = policy(base, base * factor);
            let mut b = Backoff::new(p);
            let mut prev = b.current();
            for _ in 0..steps {
                let next = b.on_rate_limited();
                if prev < p.max_delay {
                    prop_assert!(next > prev);
                } else {
                    prop_assert_eq!(next, p.max_delay);
                }
                prop_assert!(next <= p.max_delay);
                prev = next;
            }
            let after = b.on_success();
            prop_assert!(after >= p.base_delay);
            prop_assert!(after <= prev);
        }
    }
}
