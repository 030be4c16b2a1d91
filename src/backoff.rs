use std::time::Duration;

use crate::consts::{RECONNECT_BASE_DELAY_MS, RECONNECT_MAX_DELAY_MS};

/// Exponential reconnect delay: 1s, 2s, 4s, 8s, 16s, then 30s flat.
/// The attempt counter resets on every successful open.
#[derive(Debug, Clone, Default)]
pub struct ReconnectPolicy {
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Failed attempts since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn current_delay(&self) -> Duration {
        Duration::from_millis(delay_ms_for_attempt(self.attempt))
    }

    /// Delay to wait before the next connection attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

pub fn delay_ms_for_attempt(attempt: u32) -> u64 {
    1u64.checked_shl(attempt)
        .and_then(|factor| RECONNECT_BASE_DELAY_MS.checked_mul(factor))
        .map_or(RECONNECT_MAX_DELAY_MS, |delay| delay.min(RECONNECT_MAX_DELAY_MS))
}
