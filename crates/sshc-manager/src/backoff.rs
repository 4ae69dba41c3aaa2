//! Exponential backoff with jitter for reconnection attempts.

use std::time::Duration;

use sshc_core::config::BackoffConfig;

/// Exponential backoff with symmetric jitter: each returned delay falls in
/// `[base * (1 - jitter/2), base * (1 + jitter/2)]` where `base` is the
/// current (pre-jitter) delay, capped at `max`.
pub struct ExponentialBackoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempts: u32,
    max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            current: config.initial,
            max: config.max,
            multiplier: config.multiplier,
            jitter: config.jitter,
            attempts: 0,
            max_attempts: config.max_attempts,
        }
    }

    #[cfg(test)]
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64, max_attempts: u32) -> Self {
        Self {
            current: initial,
            max,
            multiplier,
            jitter,
            attempts: 0,
            max_attempts,
        }
    }

    /// Number of attempts already handed out.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Next delay, jittered, and advance the underlying sequence.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.attempts += 1;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let spread = base.as_secs_f64() * self.jitter;
        let offset = (rand::random::<f64>() - 0.5) * spread;
        Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increases_geometrically_without_jitter() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0,
            10,
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn caps_at_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0, 0.0, 10);

        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(30), 1.0, 0.4, 100);

        for _ in 0..200 {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay >= 10.0 * 0.8 - 1e-9, "delay {delay} below lower bound");
            assert!(delay <= 30.0 * 1.2 + 1e-9, "delay {delay} above upper bound");
        }
    }

    #[test]
    fn tracks_attempts_and_exhaustion() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(10), 2.0, 0.0, 3);
        assert!(!backoff.attempts_exhausted());
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert!(backoff.attempts_exhausted());
        assert_eq!(backoff.attempts(), 3);
    }
}
