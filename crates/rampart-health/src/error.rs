use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("metrics source error: {0}")]
    Source(String),

    #[error("no metrics for release {release} ({segment})")]
    NoData { release: String, segment: String },

    #[error(transparent)]
    Config(#[from] rampart_core::ConfigError),
}

pub type HealthResult<T> = Result<T, HealthError>;
