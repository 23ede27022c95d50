// Reconnect Backoff
//
// Exponential delay schedule for consecutive failed connection attempts.

use rand::Rng;
use std::time::Duration;

/// Reconnection schedule: `base * 2^attempt`, capped, with proportional jitter
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive retries allowed before giving up and going offline
    pub max_attempts: u32,
    /// Fraction of the delay (0.0..1.0) randomly added or removed
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: 0.1,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before retry number `attempt` (0-based), jittered and capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = nominal.as_secs_f64() * self.jitter.min(1.0);
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((nominal.as_secs_f64() + offset).max(0.0)).min(self.max_delay)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
