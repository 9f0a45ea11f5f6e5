//! Capped exponential backoff for the reconnect loop.
//!
//! The delay before retry `n` (0-indexed) is `initial × factor^n`, clamped to
//! `max`. With `factor = 1.0` this is a fixed-delay loop.

use std::time::Duration;

use watchrabbit_core::config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub factor: f64,
    /// Give up after this many consecutive failed attempts. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    /// A fixed 5s delay with no attempt cap.
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(5),
            factor: 1.0,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &BrokerConfig) -> Self {
        Self {
            initial: Duration::from_millis(cfg.reconnect_initial_ms),
            max: Duration::from_millis(cfg.reconnect_max_ms),
            factor: cfg.reconnect_factor,
            max_attempts: cfg.reconnect_max_attempts,
        }
    }

    /// Delay to wait after failed attempt `attempt` (0-indexed), or `None`
    /// once the attempt cap is reached.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if let Some(cap) = self.max_attempts {
            if attempt.saturating_add(1) >= cap {
                return None;
            }
        }
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.initial.as_secs_f64() * self.factor.powi(exp);
        let max_secs = self.max.as_secs_f64();
        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            Some(self.max)
        } else {
            Some(Duration::from_secs_f64(secs))
        }
    }
}
