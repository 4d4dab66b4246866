//! Error types for the gridnode model.

use thiserror::Error;

use crate::types::WorkloadType;

/// Result type alias for model-level operations.
pub type TypesResult<T> = Result<T, TypesError>;

/// Errors raised while decoding or validating model objects.
#[derive(Debug, Error)]
pub enum TypesError {
    #[error("invalid deployment: {0}")]
    InvalidDeployment(String),

    #[error("invalid workload id: {0}")]
    InvalidWorkloadId(String),

    #[error("invalid {kind} payload for workload '{name}': {reason}")]
    Payload {
        name: String,
        kind: WorkloadType,
        reason: String,
    },

    #[error("unknown kubernetes size class: {0}")]
    UnknownSize(u8),

    #[error("invalid flist source: {0}")]
    InvalidFlist(String),

    #[error("invalid config: {0}")]
    Config(String),
}
