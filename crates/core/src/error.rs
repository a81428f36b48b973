use thiserror::Error;
use uuid::Uuid;

pub type DripResult<T> = Result<T, DripError>;

#[derive(Error, Debug)]
pub enum DripError {
    #[error("Sequence {sequence_id} has no steps on its main path")]
    NoSteps { sequence_id: Uuid },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid enrollment transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// The worker's lease on the enrollment expired or the row was reset
    /// while it was being processed.
    #[error("Enrollment {enrollment_id} is no longer claimed by this worker")]
    ClaimLost { enrollment_id: Uuid },

    #[error("Invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("Tracking error: {0}")]
    Tracking(String),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl DripError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DripError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<config::ConfigError> for DripError {
    fn from(err: config::ConfigError) -> Self {
        DripError::Config(err.to_string())
    }
}
