use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("unknown policy check: {0}")]
    UnknownCheck(String),

    #[error("policy check {0} cannot be waived")]
    NotWaivable(String),

    #[error("policy check {check} is not failing for project {project}")]
    AlreadyPassing { project: String, check: String },

    #[error("waiver expiry {expires_at} is not after {now}")]
    InvalidExpiry { expires_at: u64, now: u64 },
}

pub type PolicyResult<T> = Result<T, PolicyError>;
