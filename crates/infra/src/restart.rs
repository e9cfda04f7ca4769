//! Restart policy for failed tag streams.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff between `min` and `max`.
///
/// A failed projection or topic stream is restarted from its last committed
/// offset after `delay_for_attempt(n)`, where `n` counts consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RestartBackoff {
    pub min: Duration,
    pub max: Duration,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(3),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RestartBackoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            ..Default::default()
        }
    }

    /// A fixed delay with no growth, handy in tests.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            min: delay,
            max: delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before restart number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let min_ms = self.min.as_millis() as f64;
        let max_ms = self.max.as_millis() as f64;
        let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
        let delay_ms = (min_ms * exp).min(max_ms);

        // Deterministic spread so co-failing streams don't restart in lockstep.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * pseudo_random
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).min(max_ms.max(min_ms)) as u64)
    }
}
