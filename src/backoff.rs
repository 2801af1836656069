//! Capped exponential backoff for bus outages

use std::time::Duration;

use tokio::time::sleep;

/// Exponential backoff that never gives up and never sleeps longer than
/// the cap. Bus outages are waited out, not surfaced; the broker's durable
/// streams hold the input in the meantime.
#[derive(Debug)]
pub struct ExponentialBackoff {
    initial_delay_ms: u64,
    max_delay_ms: u64,
    current_attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            initial_delay_ms,
            max_delay_ms,
            current_attempt: 0,
        }
    }

    /// Default policy from the failure-semantics contract: start at 250ms,
    /// cap at 10s.
    pub fn bus_default() -> Self {
        Self::new(250, 10_000)
    }

    pub async fn sleep(&mut self) {
        let delay = self
            .initial_delay_ms
            .saturating_mul(2_u64.saturating_pow(self.current_attempt))
            .min(self.max_delay_ms);

        log::warn!("⏳ Bus retry attempt {} in {}ms", self.current_attempt + 1, delay);

        sleep(Duration::from_millis(delay)).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Next delay without sleeping (for tests).
    pub fn next_delay_ms(&self) -> u64 {
        self.initial_delay_ms
            .saturating_mul(2_u64.saturating_pow(self.current_attempt))
            .min(self.max_delay_ms)
    }
}
