//! gridnode-provision — turns admitted deployments into running workloads.
//!
//! Deployments arrive from pluggable [`sources`] over two channels, one
//! for work to provision (create, update, pause, resume) and one for
//! deployments to tear down. The [`Engine`] applies each job against the
//! [`DeploymentStore`](gridnode_state::DeploymentStore) and a
//! [`Provision`] implementation, reporting every result back to the
//! registry.
//!
//! # Architecture
//!
//! ```text
//! AdmissionSource ─┐                 ┌─ Counted (capacity counters)
//! ExpirySource ────┼─ Sink ─► Engine ┤     └── MapProvisioner
//!                  │                 │           └── primitives::* ─► collab traits
//!                  │                 └─ Feedback ─► Registry
//! ```
//!
//! Admission runs each reservation through the [`pipeline`] state machine
//! before it becomes a deployment.

pub mod backoff;
pub mod collab;
pub mod counters;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod manager;
pub mod pipeline;
pub mod primitives;
pub mod provisioner;
pub mod registry;
pub mod rollback;
pub mod sources;

pub use backoff::Backoff;
pub use collab::Dependencies;
pub use counters::{CapacitySnapshot, Counters};
pub use engine::Engine;
pub use error::{ProvisionError, ProvisionResult};
pub use interceptor::Counted;
pub use manager::{Manager, Registration, Response};
pub use pipeline::Pipeline;
pub use provisioner::{MapProvisioner, Provision};
pub use registry::{Feedback, HttpRegistry, Registry};
pub use sources::{AdmissionSource, ExpirySource, ProvisionJob, Source};
