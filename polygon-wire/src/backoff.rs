use std::time::Duration;

use rand::Rng;

const DEFAULT_BASE_MS: u64 = 1_000;
const DEFAULT_MAX_MS: u64 = 30_000;

/// Exponential backoff with full jitter for upstream reconnects. Each call
/// to `next_delay` doubles the base delay (capped at `max_ms`) and returns a
/// uniformly random duration in `[0, delay]`, then `reset` is expected to be
/// called once the connection is established and stays up for a meaningful
/// interval so a flapping link doesn't get stuck at the ceiling forever.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(max_ms: u64) -> Self {
        ReconnectBackoff {
            base_ms: DEFAULT_BASE_MS,
            max_ms: max_ms.max(DEFAULT_BASE_MS),
            attempt: 0,
        }
    }

    /// Advance the attempt counter and return the delay to wait before the
    /// next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.attempt.min(32);
        self.attempt += 1;
        let ceiling = self
            .base_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_ms);
        let jittered = rand::thread_rng().gen_range(0..=ceiling);
        Duration::from_millis(jittered.max(1))
    }

    /// Call after a connection has been stable, to forget prior failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        ReconnectBackoff::new(DEFAULT_MAX_MS)
    }
}
