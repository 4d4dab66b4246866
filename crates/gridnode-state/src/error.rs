//! Error types for the gridnode state crate.

use thiserror::Error;

use gridnode_types::{ContractId, TwinId};

/// Result type alias for state operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur in the deployment store or the reservation cache.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("deployment {twin}/{contract} already exists")]
    DeploymentExists { twin: TwinId, contract: ContractId },

    #[error("deployment {twin}/{contract} does not exist")]
    DeploymentNotExists { twin: TwinId, contract: ContractId },

    #[error("conflict: twin {twin} already has a workload named '{name}' in contract {owner}")]
    DeploymentConflict {
        twin: TwinId,
        name: String,
        owner: ContractId,
    },

    #[error("invalid deployment: {0}")]
    InvalidDeployment(#[from] gridnode_types::TypesError),

    #[error("unsupported document version {found} (supported: {supported})")]
    Version { found: String, supported: String },

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("store lock poisoned")]
    Lock,

    #[error("failed to open cache: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),
}

impl StateError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        StateError::Io {
            path: path.display().to_string(),
            source,
        }
    }

    /// True for the not-found case, which callers often treat as a no-op.
    pub fn is_not_exists(&self) -> bool {
        matches!(self, StateError::DeploymentNotExists { .. })
    }
}
