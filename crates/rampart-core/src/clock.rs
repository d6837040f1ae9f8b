//! Release clock — epoch milliseconds that advance with tokio's clock.
//!
//! Timestamps on samples, audit entries, and releases are epoch millis.
//! They are derived from a monotonic `tokio::time::Instant` so that tests
//! running under a paused runtime see time move when the runtime
//! auto-advances, and wall-clock jumps never reorder samples.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
    origin_epoch_ms: u64,
}

impl Clock {
    /// Anchor a clock at the current wall-clock time.
    pub fn new() -> Self {
        Self::anchored_at(epoch_ms())
    }

    /// Anchor a clock at a fixed epoch (deterministic tests).
    pub fn anchored_at(origin_epoch_ms: u64) -> Self {
        Self {
            origin: Instant::now(),
            origin_epoch_ms,
        }
    }

    /// Current time in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.origin_epoch_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
