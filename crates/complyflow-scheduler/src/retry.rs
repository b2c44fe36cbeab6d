//! Retry policy: capped exponential backoff with jitter.

use std::time::Duration;

use complyflow_core::config::RetryConfig;
use rand::Rng;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Whether attempt number `retry` (1-based) is still within budget.
    pub fn allows(&self, retry: u32) -> bool {
        retry <= self.max_retries
    }

    /// Un-jittered delay before retry number `retry` (1-based):
    /// `initial * multiplier^(retry-1)`, capped at `max_backoff`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(63) as i32;
        let millis = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay, never above `max_backoff`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter == 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        base.mul_f64(factor).min(self.max_backoff)
    }

    /// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
    pub async fn pause(delay: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_and_capped() {
        let p = policy(0.0);
        assert_eq!(p.delay_for(1), Duration::from_secs(1));
        assert_eq!(p.delay_for(2), Duration::from_secs(2));
        assert_eq!(p.delay_for(3), Duration::from_secs(4));
        assert_eq!(p.delay_for(5), Duration::from_secs(10));
        assert_eq!(p.delay_for(200), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let p = policy(0.1);
        for _ in 0..100 {
            let d = p.delay_for(2);
            assert!(d >= Duration::from_millis(1800) && d <= Duration::from_millis(2200), "{d:?}");
        }
    }

    #[test]
    fn test_budget() {
        let p = policy(0.0);
        assert!(p.allows(3));
        assert!(!p.allows(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_cancellable() {
        let cancel = CancellationToken::new();
        assert!(RetryPolicy::pause(Duration::from_secs(1), &cancel).await);
        cancel.cancel();
        assert!(!RetryPolicy::pause(Duration::from_secs(60), &cancel).await);
    }
}
