//! Manager contract: what a workload type plugs into the provisioner.
//!
//! Every type registers one [`Manager`]. The optional capabilities
//! (initialize once at boot, update in place, pause/resume) are separate
//! traits attached to the [`Registration`], so the provisioner can tell
//! what a type supports without probing it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use gridnode_types::{ResultState, WorkloadWithId};

/// Outcome a manager declares for a provision or update.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Resource is live; the value becomes the result data.
    Ok(serde_json::Value),
    /// A non-error state other than plain success.
    Declared {
        state: DeclaredState,
        message: Option<String>,
    },
    /// The resource already matches; keep the current result.
    NoActionNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredState {
    Ok,
    Unchanged,
    Paused,
}

impl From<DeclaredState> for ResultState {
    fn from(state: DeclaredState) -> Self {
        match state {
            DeclaredState::Ok => ResultState::Ok,
            DeclaredState::Unchanged => ResultState::Unchanged,
            DeclaredState::Paused => ResultState::Paused,
        }
    }
}

impl Response {
    pub fn data<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        Ok(Response::Ok(serde_json::to_value(value)?))
    }

    pub fn unchanged(message: impl Into<String>) -> Self {
        Response::Declared {
            state: DeclaredState::Unchanged,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Manager: Send + Sync {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response>;
    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Initializer: Send + Sync {
    async fn initialize(&self) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Updater: Send + Sync {
    async fn update(&self, wl: &WorkloadWithId) -> anyhow::Result<Response>;
}

#[async_trait]
pub trait Pauser: Send + Sync {
    async fn pause(&self, wl: &WorkloadWithId) -> anyhow::Result<()>;
    async fn resume(&self, wl: &WorkloadWithId) -> anyhow::Result<()>;
}

/// A manager and the capabilities it opted into.
#[derive(Clone)]
pub struct Registration {
    pub(crate) manager: Arc<dyn Manager>,
    pub(crate) initializer: Option<Arc<dyn Initializer>>,
    pub(crate) updater: Option<Arc<dyn Updater>>,
    pub(crate) pauser: Option<Arc<dyn Pauser>>,
}

impl Registration {
    pub fn new(manager: Arc<dyn Manager>) -> Self {
        Self {
            manager,
            initializer: None,
            updater: None,
            pauser: None,
        }
    }

    pub fn initializer(mut self, initializer: Arc<dyn Initializer>) -> Self {
        self.initializer = Some(initializer);
        self
    }

    pub fn updater(mut self, updater: Arc<dyn Updater>) -> Self {
        self.updater = Some(updater);
        self
    }

    pub fn pauser(mut self, pauser: Arc<dyn Pauser>) -> Self {
        self.pauser = Some(pauser);
        self
    }
}
