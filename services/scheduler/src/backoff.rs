//! Exponential backoff with cap and jitter.
//!
//! Used for restart timers on crashed jobs and for stream adapter
//! reconnects.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay for attempt zero.
    pub base: Duration,

    /// Maximum delay.
    pub cap: Duration,

    /// Jitter factor (0.0 to 1.0); the delay is spread by ±factor.
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self { base, cap, jitter }
    }

    /// Delay for the given attempt: `min(base * 2^attempt, cap)` ± jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis() as f64 * 2f64.powi(attempt.min(31) as i32);
        let capped = exp.min(self.cap.as_millis() as f64);
        let jitter = if self.jitter > 0.0 {
            capped * self.jitter * rand::thread_rng().gen_range(-1.0..=1.0)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
