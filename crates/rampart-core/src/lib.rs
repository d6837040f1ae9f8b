//! rampart-core — configuration, duration strings, and the release clock.
//!
//! Shared by every rampart crate. Holds no release logic of its own.

pub mod clock;
pub mod config;
pub mod duration;
pub mod error;

pub use clock::{Clock, epoch_ms};
pub use config::*;
pub use duration::{format_duration, parse_duration};
pub use error::{ConfigError, ConfigResult};
