use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Capped exponential backoff with symmetric jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Backoff {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self {
            initial_delay: cfg.initial_delay,
            max_delay: cfg.max_delay,
            multiplier: cfg.multiplier,
            jitter_factor: cfg.jitter_factor,
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exp);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, with jitter of up to
    /// `±jitter_factor / 2` of the base delay.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_range = base.as_secs_f64() * self.jitter_factor;
        if jitter_range <= 0.0 {
            return base;
        }

        let mut rng = rand::rng();
        let jitter = rng.random_range(-jitter_range / 2.0..=jitter_range / 2.0);
        Duration::try_from_secs_f64((base.as_secs_f64() + jitter).max(0.0)).unwrap_or(base)
    }
}
