//! Rolling buffer of samples for one release segment.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::warn;

use crate::sample::HealthSample;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Accepted,
    /// The sample was not newer than the latest one. It was dropped and the
    /// buffer cleared.
    OutOfOrder,
}

#[derive(Debug, Clone)]
pub struct SampleWindow {
    samples: VecDeque<HealthSample>,
    retention_ms: u64,
    /// Newest timestamp ever received. Survives resets.
    last_seen_ms: Option<u64>,
}

impl SampleWindow {
    pub fn new(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention_ms: retention.as_millis() as u64,
            last_seen_ms: None,
        }
    }

    pub fn push(&mut self, sample: HealthSample) -> PushOutcome {
        self.last_seen_ms = Some(self.last_seen_ms.map_or(sample.timestamp, |ts| ts.max(sample.timestamp)));
        let latest = self.samples.back().map(|s| s.timestamp);
        if let Some(latest) = latest.filter(|&ts| sample.timestamp <= ts) {
            warn!(
                release = %sample.release_id,
                timestamp = sample.timestamp,
                latest,
                "out-of-order health sample dropped, resetting window"
            );
            self.samples.clear();
            return PushOutcome::OutOfOrder;
        }

        let cutoff = sample.timestamp.saturating_sub(self.retention_ms);
        self.samples.push_back(sample);
        while self.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            self.samples.pop_front();
        }
        PushOutcome::Accepted
    }

    pub fn latest(&self) -> Option<&HealthSample> {
        self.samples.back()
    }

    /// Timestamp of the newest sample received, including samples dropped
    /// as out of order and samples cleared from the buffer.
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen_ms
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Newest first.
    pub fn iter_rev(&self) -> impl Iterator<Item = &HealthSample> {
        self.samples.iter().rev()
    }
}
