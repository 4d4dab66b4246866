//! Provisioning error types.

use thiserror::Error;

use gridnode_types::{ResultState, WorkloadType};

/// Errors that can occur while dispatching workloads to their managers.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("unknown workload type: {0}")]
    UnknownWorkloadType(WorkloadType),

    /// The workload is already in the requested state. Not a failure: the
    /// caller keeps the workload's current result.
    #[error("no action needed")]
    NoActionNeeded,

    #[error("workload type {0} does not support updating")]
    UpdateNotSupported(WorkloadType),

    #[error("cannot {action} a workload in state {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: Option<ResultState>,
    },

    #[error("missing dependency: {0}")]
    MissingDependency(&'static str),

    #[error("failed to initialize {kind} manager: {source:#}")]
    Initialize {
        kind: WorkloadType,
        #[source]
        source: anyhow::Error,
    },

    #[error("{0:#}")]
    Manager(anyhow::Error),

    #[error("state store error: {0}")]
    State(#[from] gridnode_state::StateError),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
