// packages/uplink/src/upload/circuit_breaker.rs
//! Consecutive-failure circuit breaker
//!
//! Opens after `threshold` consecutive upload failures and rejects work for
//! `cooldown_ms`. The first check after the cooldown closes it again
//! optimistically (no half-open probing); a success resets the count.

use serde::{Deserialize, Serialize};

/// Breaker state, shared by every upload of a dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown_ms: i64,
    consecutive_failures: u32,
    open: bool,
    opened_at_ms: i64,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown_ms: i64) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown_ms,
            consecutive_failures: 0,
            open: false,
            opened_at_ms: 0,
        }
    }

    /// Whether work may proceed at `now_ms`.
    ///
    /// Returns `(allowed, closed_now)`; `closed_now` is true when this call
    /// closed an open breaker whose cooldown had elapsed.
    pub fn allow(&mut self, now_ms: i64) -> (bool, bool) {
        if !self.open {
            return (true, false);
        }
        if now_ms - self.opened_at_ms > self.cooldown_ms {
            self.open = false;
            self.consecutive_failures = 0;
            return (true, true);
        }
        (false, false)
    }

    /// Register a failure. Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self, now_ms: i64) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.open && self.consecutive_failures >= self.threshold {
            self.open = true;
            self.opened_at_ms = now_ms;
            return true;
        }
        false
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn opened_at_ms(&self) -> i64 {
        self.opened_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = CircuitBreaker::new(5, 60_000);
        for _ in 0..4 {
            assert!(!breaker.record_failure(1_000));
        }
        assert!(breaker.allow(1_000).0);
        assert!(breaker.record_failure(1_000));
        assert!(breaker.is_open());
        assert_eq!(breaker.allow(1_500), (false, false));
    }

    #[test]
    fn test_closes_after_cooldown() {
        let mut breaker = CircuitBreaker::new(5, 60_000);
        for _ in 0..5 {
            breaker.record_failure(0);
        }

        assert_eq!(breaker.allow(60_000), (false, false));
        assert_eq!(breaker.allow(61_000), (true, true));
        assert!(!breaker.is_open());
        assert_eq!(breaker.consecutive_failures(), 0);
        assert_eq!(breaker.allow(61_001), (true, false));
    }

    #[test]
    fn test_success_resets_count() {
        let mut breaker = CircuitBreaker::new(3, 1_000);
        breaker.record_failure(0);
        breaker.record_failure(0);
        breaker.record_success();
        breaker.record_failure(0);
        breaker.record_failure(0);
        assert!(!breaker.is_open());
    }

    #[test]
    fn test_failures_while_open_do_not_restart_cooldown() {
        let mut breaker = CircuitBreaker::new(1, 10_000);
        assert!(breaker.record_failure(0));
        assert!(!breaker.record_failure(5_000));
        assert_eq!(breaker.opened_at_ms(), 0);
        assert!(breaker.allow(10_001).0);
    }
}
