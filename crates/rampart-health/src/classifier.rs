//! Breach classification over a sample window.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sample::{Signal, Thresholds};
use crate::window::SampleWindow;

const JUDGED: [Signal; 3] = [Signal::ErrorRate, Signal::Latency, Signal::HealthCheck];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The latest sample breaches, but not for long enough.
    Degraded,
    Breached,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Breached => "breached",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub status: HealthStatus,
    /// Signals that are sustained (BREACHED) or currently breaching (DEGRADED).
    pub signals: Vec<Signal>,
    pub reason: String,
}

impl Classification {
    fn healthy(reason: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            signals: Vec::new(),
            reason: reason.into(),
        }
    }

    pub fn is_breached(&self) -> bool {
        self.status == HealthStatus::Breached
    }
}

/// Classify the window at `now_ms`.
///
/// `since_ms` is when monitoring started; silence is measured from the
/// later of that and the newest sample received, even one dropped as out
/// of order.
pub fn classify(
    window: &SampleWindow,
    thresholds: &Thresholds,
    now_ms: u64,
    since_ms: u64,
) -> Classification {
    let last_seen = window.last_seen().map_or(since_ms, |ts| ts.max(since_ms));
    let silent_for = now_ms.saturating_sub(last_seen);
    if silent_for > thresholds.silence_grace.as_millis() as u64 {
        return Classification {
            status: HealthStatus::Breached,
            signals: vec![Signal::Silence],
            reason: format!("monitoring silence for {}s", silent_for / 1000),
        };
    }

    let Some(latest) = window.latest() else {
        return Classification::healthy("awaiting samples");
    };

    let breaching: Vec<Signal> = JUDGED
        .into_iter()
        .filter(|&sig| thresholds.breaches(latest, sig))
        .collect();
    if breaching.is_empty() {
        return Classification::healthy("all signals within thresholds");
    }

    let sustained: Vec<Signal> = breaching
        .iter()
        .copied()
        .filter(|&sig| {
            let needed = thresholds.window_for(sig).as_millis() as u64;
            breach_run_ms(window, thresholds, sig) >= needed
        })
        .collect();

    if sustained.is_empty() {
        let reason = format!("{} breaching, not yet sustained", join(&breaching));
        Classification {
            status: HealthStatus::Degraded,
            signals: breaching,
            reason,
        }
    } else {
        let reason = format!("{} sustained above threshold", join(&sustained));
        Classification {
            status: HealthStatus::Breached,
            signals: sustained,
            reason,
        }
    }
}

/// Length of the unbroken run of breaching samples ending at the latest one.
/// A gap wider than `max_sample_gap` ends the run.
fn breach_run_ms(window: &SampleWindow, thresholds: &Thresholds, signal: Signal) -> u64 {
    let max_gap = thresholds.max_sample_gap.as_millis() as u64;
    let mut iter = window.iter_rev();
    let Some(latest) = iter.next() else {
        return 0;
    };
    let mut start = latest.timestamp;
    for sample in iter {
        if start - sample.timestamp > max_gap || !thresholds.breaches(sample, signal) {
            break;
        }
        start = sample.timestamp;
    }
    latest.timestamp - start
}

fn join(signals: &[Signal]) -> String {
    signals
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
