//! Rate Limiter
//!
//! Per-instance sliding-window attempt cap plus a consecutive-failure block,
//! gating every connection attempt. A single mutex guards the whole
//! per-instance map; the clock is injectable so the policy can be tested
//! without real sleeps.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{Clock, SystemClock};
use crate::config::RateLimitConfig;
use crate::error::CoreError;
use crate::instance::InstanceId;

const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct RateState {
    attempts: Vec<Instant>,
    consec_failures: u32,
    blocked_until: Option<Instant>,
}

/// Outcome of an `Allow` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
}

/// A point-in-time snapshot of an instance's rate-limit state.
#[derive(Debug, Clone)]
pub struct RateLimitStatus {
    pub recent_attempts: usize,
    pub max_per_min: u32,
    pub consec_failures: u32,
    pub max_consec: u32,
    pub blocked: bool,
    pub blocked_until: Option<Instant>,
}

/// Sliding-window + consecutive-failure rate limiter. A single mutex guards
/// the entire per-instance-state map.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<InstanceId, RateState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Gate a connection attempt. Prunes the sliding window, rejects if the
    /// instance is currently blocked or over the per-minute cap, otherwise
    /// records the attempt and allows it.
    pub fn allow(&self, instance: InstanceId) -> Result<RateLimitDecision, CoreError> {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = guard.entry(instance).or_default();

        if let Some(blocked_until) = state.blocked_until {
            if now < blocked_until {
                return Err(CoreError::Blocked {
                    retry_after: blocked_until - now,
                });
            }
            // Block has expired naturally; clear it but keep the failure
            // counter (only an explicit RecordSuccess resets it).
            state.blocked_until = None;
        }

        state.attempts.retain(|&t| now.duration_since(t) < WINDOW);

        if state.attempts.len() as u32 >= self.config.max_per_min {
            let oldest = *state.attempts.first().expect("non-empty at cap");
            let retry_after = WINDOW.saturating_sub(now.duration_since(oldest));
            return Err(CoreError::RateLimited { retry_after });
        }

        state.attempts.push(now);
        Ok(RateLimitDecision::Allowed)
    }

    /// Reset the consecutive-failure counter and clear any active block.
    pub fn record_success(&self, instance: InstanceId) {
        let mut guard = self.state.lock();
        let state = guard.entry(instance).or_default();
        state.consec_failures = 0;
        state.blocked_until = None;
    }

    /// Record a failed attempt; trips the block once the consecutive
    /// failure threshold is reached.
    pub fn record_failure(&self, instance: InstanceId) {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = guard.entry(instance).or_default();
        state.consec_failures += 1;
        if state.consec_failures >= self.config.max_consec_failures {
            state.blocked_until = Some(now + self.config.block_duration);
        }
    }

    pub fn status(&self, instance: InstanceId) -> RateLimitStatus {
        let now = self.clock.now();
        let mut guard = self.state.lock();
        let state = guard.entry(instance).or_default();
        state.attempts.retain(|&t| now.duration_since(t) < WINDOW);

        let blocked = state.blocked_until.map(|b| now < b).unwrap_or(false);
        RateLimitStatus {
            recent_attempts: state.attempts.len(),
            max_per_min: self.config.max_per_min,
            consec_failures: state.consec_failures,
            max_consec: self.config.max_consec_failures,
            blocked,
            blocked_until: state.blocked_until,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::TestClock;

    fn limiter() -> (RateLimiter, Arc<TestClock>) {
        let clock = Arc::new(TestClock::new());
        let limiter = RateLimiter::with_clock(RateLimitConfig::default(), clock.clone());
        (limiter, clock)
    }

    #[test]
    fn allows_up_to_max_per_min() {
        let (limiter, _clock) = limiter();
        let instance = InstanceId(1);

        for _ in 0..10 {
            assert!(limiter.allow(instance).is_ok());
        }
        let err = limiter.allow(instance).unwrap_err();
        assert!(matches!(err, CoreError::RateLimited { .. }));
    }

    #[test]
    fn window_slides_with_clock() {
        let (limiter, clock) = limiter();
        let instance = InstanceId(2);

        for _ in 0..10 {
            limiter.allow(instance).unwrap();
        }
        assert!(limiter.allow(instance).is_err());

        clock.advance(Duration::from_secs(61));
        assert!(limiter.allow(instance).is_ok());
    }

    #[test]
    fn blocks_after_consecutive_failures() {
        let (limiter, _clock) = limiter();
        let instance = InstanceId(3);

        for _ in 0..5 {
            limiter.record_failure(instance);
        }

        let err = limiter.allow(instance).unwrap_err();
        assert!(matches!(err, CoreError::Blocked { .. }));

        let status = limiter.status(instance);
        assert!(status.blocked);
        assert!(status.blocked_until.is_some());
    }

    #[test]
    fn success_clears_block_and_counter() {
        let (limiter, _clock) = limiter();
        let instance = InstanceId(4);

        for _ in 0..5 {
            limiter.record_failure(instance);
        }
        limiter.record_success(instance);

        let status = limiter.status(instance);
        assert!(!status.blocked);
        assert_eq!(status.consec_failures, 0);
        assert!(limiter.allow(instance).is_ok());
    }

    #[test]
    fn block_expires_after_duration() {
        let (limiter, clock) = limiter();
        let instance = InstanceId(5);

        for _ in 0..5 {
            limiter.record_failure(instance);
        }
        assert!(limiter.allow(instance).is_err());

        clock.advance(Duration::from_secs(5 * 60 + 1));
        assert!(limiter.allow(instance).is_ok());
    }

    #[test]
    fn instances_are_independent() {
        let (limiter, _clock) = limiter();
        for _ in 0..5 {
            limiter.record_failure(InstanceId(10));
        }
        assert!(limiter.allow(InstanceId(10)).is_err());
        assert!(limiter.allow(InstanceId(11)).is_ok());
    }
}
