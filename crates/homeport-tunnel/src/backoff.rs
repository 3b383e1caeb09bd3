//! Exponential backoff policy for transport re-establishment.

use std::time::Duration;

/// Exponential backoff reconnection policy.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial delay before first reconnect attempt.
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failed attempt.
    pub multiplier: f64,
    /// Maximum number of reconnect attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// The policy used for peer-connection establishment: three attempts
    /// with 2 s doubling backoff, capped at 60 s.
    pub fn p2p_establishment() -> Self {
        Self {
            max_attempts: Some(3),
            ..Self::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Whether another attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_delay, Duration::from_secs(2));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(policy.multiplier, 2.0);
        assert!(policy.max_attempts.is_none());
    }

    #[test]
    fn exponential_backoff_delays() {
        let policy = ReconnectPolicy::default();

        // 2s, 4s, 8s, 16s, 32s, 60s (capped), 60s
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(16));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(60));
    }

    #[test]
    fn p2p_policy_allows_three_attempts() {
        let policy = ReconnectPolicy::p2p_establishment();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
        assert!(!policy.should_retry(4));
    }

    #[test]
    fn retry_unlimited() {
        let policy = ReconnectPolicy::default();
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(100));
        assert!(policy.should_retry(u32::MAX));
    }
}
