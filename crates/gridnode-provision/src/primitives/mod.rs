//! One manager per workload type.
//!
//! Managers translate a workload payload into calls on the collaborator
//! traits in [`crate::collab`]. Resources are named after the workload id,
//! so every manager is idempotent: provisioning something that already
//! exists answers [`Response::NoActionNeeded`](crate::manager::Response).

pub mod container;
pub mod kubernetes;
pub mod network;
pub mod zdb;
pub mod zmachine;
pub mod zmount;

use std::sync::Arc;

use gridnode_types::{TwinId, WorkloadId, WorkloadType};

use crate::collab::Dependencies;
use crate::error::ProvisionResult;
use crate::manager::Registration;
use crate::provisioner::MapProvisioner;

pub use container::ContainerPrimitive;
pub use kubernetes::KubernetesPrimitive;
pub use network::NetworkPrimitive;
pub use zdb::ZdbPrimitive;
pub use zmachine::ZMachinePrimitive;
pub use zmount::ZmountPrimitive;

/// Runtime namespace for user containers.
pub const USER_NAMESPACE: &str = "user";

/// Network id a twin's network workload is known by on this node.
///
/// Networks are shared across the twin's deployments, so the id depends
/// on the twin and the name only.
pub fn network_id(twin: TwinId, name: &str) -> String {
    format!("{twin}-{name}")
}

/// Volume backing a zmount referenced by name from a sibling workload.
pub fn volume_name(owner: &WorkloadId, volume: &str) -> String {
    WorkloadId::new(owner.twin, owner.contract, volume).to_string()
}

/// Build the provisioner with every primitive this node supports.
pub fn provisioner(deps: &Dependencies) -> ProvisionResult<MapProvisioner> {
    let network = Arc::new(NetworkPrimitive::new(deps)?);
    let zmount = Arc::new(ZmountPrimitive::new(deps)?);
    let zdb = Arc::new(ZdbPrimitive::new(deps)?);
    let container = Arc::new(ContainerPrimitive::new(deps)?);
    let zmachine = Arc::new(ZMachinePrimitive::new(deps)?);
    let kubernetes = Arc::new(KubernetesPrimitive::new(deps)?);

    Ok(MapProvisioner::default()
        .register(
            WorkloadType::Network,
            Registration::new(network.clone()).updater(network),
        )
        .register(
            WorkloadType::Zmount,
            Registration::new(zmount.clone()).updater(zmount),
        )
        .register(
            WorkloadType::Zdb,
            Registration::new(zdb.clone()).initializer(zdb),
        )
        .register(WorkloadType::Container, Registration::new(container))
        .register(
            WorkloadType::Zmachine,
            Registration::new(zmachine.clone()).pauser(zmachine),
        )
        .register(
            WorkloadType::Kubernetes,
            Registration::new(kubernetes.clone()).pauser(kubernetes),
        ))
}
