//! rampart-health — Release health sampling and breach classification.
//!
//! A release is BREACHED when a signal stays above its threshold for its
//! whole window (error rate 2m, p95 latency 5m, health-check failures 1m)
//! or when no samples arrive for longer than the silence grace. A single
//! breaching sample that is not yet sustained is DEGRADED.
//!
//! [`HealthMonitor`] runs one polling task per active release and pushes
//! each classification to the release's controller over a channel.

pub mod classifier;
pub mod error;
pub mod monitor;
pub mod sample;
pub mod source;
pub mod window;

pub use classifier::{Classification, HealthStatus, classify};
pub use error::{HealthError, HealthResult};
pub use monitor::{HealthMonitor, HealthReport};
pub use sample::{HealthSample, Signal, Thresholds};
pub use source::{MetricsSource, SegmentMetrics, StaticMetricsSource};
pub use window::{PushOutcome, SampleWindow};
