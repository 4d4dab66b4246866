//! Reservation wire object consumed from the admission registry.
//!
//! A reservation precedes a deployment: it is signed, paid, and once it
//! reaches [`NextAction::Deploy`] its per-type workload lists are converted
//! into a [`Deployment`] for this node.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};
use crate::types::{ContractId, Deployment, TwinId, Workload, WorkloadType};
use crate::workloads::{ContainerData, KubernetesData, NetworkData, ZMachineData, ZdbData, ZmountData};

/// Stage a reservation is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAction {
    Create,
    Sign,
    Pay,
    Deploy,
    Delete,
    Deleted,
    Invalid,
}

impl NextAction {
    /// Stages that never advance on their own.
    pub fn is_fixed_point(&self) -> bool {
        matches!(
            self,
            NextAction::Deploy | NextAction::Delete | NextAction::Deleted | NextAction::Invalid
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SigningRequest {
    /// Twins allowed to sign.
    #[serde(default)]
    pub signers: Vec<TwinId>,
    /// Minimum number of distinct authorized signatures.
    #[serde(default)]
    pub quorum_min: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningSignature {
    pub tid: TwinId,
    pub signature: String,
    #[serde(default)]
    pub epoch: u64,
}

/// A workload entry as listed in a reservation, tagged with its target node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reserved<T> {
    pub workload_id: String,
    pub node_id: String,
    #[serde(flatten)]
    pub data: T,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataReservation {
    #[serde(default)]
    pub networks: Vec<Reserved<NetworkData>>,
    #[serde(default)]
    pub volumes: Vec<Reserved<ZmountData>>,
    #[serde(default)]
    pub zdbs: Vec<Reserved<ZdbData>>,
    #[serde(default)]
    pub containers: Vec<Reserved<ContainerData>>,
    #[serde(default)]
    pub vms: Vec<Reserved<ZMachineData>>,
    #[serde(default)]
    pub kubernetes: Vec<Reserved<KubernetesData>>,
    /// Epoch after which the reservation can no longer be provisioned.
    pub expiration_provisioning: u64,
    /// Epoch after which the reservation is expired and must be removed.
    pub expiration_reservation: u64,
}

/// Admission object as published by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ContractId,
    pub customer_tid: TwinId,
    #[serde(default)]
    pub customer_signature: String,
    pub data_reservation: DataReservation,
    #[serde(default)]
    pub signing_request_provision: SigningRequest,
    #[serde(default)]
    pub signatures_provision: Vec<SigningSignature>,
    pub next_action: NextAction,
    /// Epoch the reservation was created.
    #[serde(default)]
    pub epoch: u64,
}

impl Reservation {
    /// Whether the reservation lifetime is over at `now`.
    pub fn expired(&self, now: u64) -> bool {
        now >= self.data_reservation.expiration_reservation
    }

    /// Whether the provisioning deadline passed at `now`.
    pub fn provisioning_expired(&self, now: u64) -> bool {
        now >= self.data_reservation.expiration_provisioning
    }

    /// Convert the workloads targeting `node_id` into a deployment.
    pub fn deployment_for(&self, node_id: &str) -> TypesResult<Deployment> {
        let data = &self.data_reservation;
        let mut workloads = Vec::new();
        collect(&mut workloads, node_id, WorkloadType::Network, &data.networks)?;
        collect(&mut workloads, node_id, WorkloadType::Zmount, &data.volumes)?;
        collect(&mut workloads, node_id, WorkloadType::Zdb, &data.zdbs)?;
        collect(&mut workloads, node_id, WorkloadType::Container, &data.containers)?;
        collect(&mut workloads, node_id, WorkloadType::Zmachine, &data.vms)?;
        collect(&mut workloads, node_id, WorkloadType::Kubernetes, &data.kubernetes)?;

        let deployment = Deployment {
            twin_id: self.customer_tid,
            contract_id: self.id,
            metadata: String::new(),
            description: format!("reservation {}", self.id),
            workloads,
        };
        deployment.validate()?;
        Ok(deployment)
    }
}

fn collect<T>(
    out: &mut Vec<Workload>,
    node_id: &str,
    kind: WorkloadType,
    entries: &[Reserved<T>],
) -> TypesResult<()>
where
    T: Serialize + DeserializeOwned,
{
    for entry in entries.iter().filter(|e| e.node_id == node_id) {
        let data = serde_json::to_value(&entry.data).map_err(|e| TypesError::Payload {
            name: entry.workload_id.clone(),
            kind,
            reason: e.to_string(),
        })?;
        out.push(Workload::new(entry.workload_id.clone(), kind, data));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn wire() -> serde_json::Value {
        json!({
            "id": 12,
            "customer_tid": 3,
            "next_action": "create",
            "signing_request_provision": {"signers": [1, 2], "quorum_min": 1},
            "signatures_provision": [{"tid": 1, "signature": "aa"}],
            "data_reservation": {
                "expiration_provisioning": 100,
                "expiration_reservation": 200,
                "volumes": [
                    {"workload_id": "disk", "node_id": "node-a", "size": 1024},
                    {"workload_id": "other", "node_id": "node-b", "size": 2048}
                ],
                "networks": [{
                    "workload_id": "net",
                    "node_id": "node-a",
                    "ip_range": "10.1.0.0/16",
                    "subnet": "10.1.1.0/24",
                    "wireguard_private_key_encrypted": "xx",
                    "wireguard_listen_port": 3000
                }]
            }
        })
    }

    #[test]
    fn parses_wire_object() {
        let r: Reservation = serde_json::from_value(wire()).unwrap();
        assert_eq!(r.next_action, NextAction::Create);
        assert_eq!(r.signing_request_provision.signers, vec![1, 2]);
        assert_eq!(r.data_reservation.volumes.len(), 2);
        assert_eq!(r.data_reservation.volumes[0].data.size, 1024);
    }

    #[test]
    fn deployment_only_takes_local_workloads() {
        let r: Reservation = serde_json::from_value(wire()).unwrap();
        let d = r.deployment_for("node-a").unwrap();
        assert_eq!(d.twin_id, 3);
        assert_eq!(d.contract_id, 12);
        let names: Vec<_> = d.workloads.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["net", "disk"]);
        assert_eq!(d.get("disk").unwrap().kind, WorkloadType::Zmount);
    }

    #[test]
    fn expiry_checks() {
        let r: Reservation = serde_json::from_value(wire()).unwrap();
        assert!(!r.provisioning_expired(99));
        assert!(r.provisioning_expired(100));
        assert!(!r.expired(199));
        assert!(r.expired(200));
    }
}
