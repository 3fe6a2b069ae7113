use std::time::Duration;

use crate::config::BackoffConfig;

/// Exponential reconnect delay: `initial * factor^n`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay before the next attempt. Never decreases until [`reset`](Self::reset).
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.config.factor.max(1).saturating_pow(self.attempt);
        let delay = self
            .config
            .initial
            .checked_mul(factor)
            .unwrap_or(self.config.max)
            .min(self.config.max);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
