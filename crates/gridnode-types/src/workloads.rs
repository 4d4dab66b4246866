//! Typed payloads for every workload type and their capacity footprint.

use std::collections::HashMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};
use crate::types::{Workload, WorkloadType};
use crate::units::{DiskType, Units, GIB};

// ── Network ───────────────────────────────────────────────────────

/// Private overlay network spanning one or more nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkData {
    /// Whole network range, e.g. `10.1.0.0/16`.
    pub ip_range: String,
    /// Subnet of this node inside `ip_range`, e.g. `10.1.3.0/24`.
    pub subnet: String,
    /// Wireguard private key, encrypted for this node.
    pub wireguard_private_key_encrypted: String,
    pub wireguard_listen_port: u16,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub subnet: String,
    pub wireguard_public_key: String,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

// ── Storage ───────────────────────────────────────────────────────

/// Raw storage volume mounted into a machine or container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZmountData {
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZdbMode {
    #[default]
    User,
    Seq,
}

/// Key-value namespace hosted in a shared zdb container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZdbData {
    /// Size in bytes.
    pub size: u64,
    #[serde(default)]
    pub mode: ZdbMode,
    /// Namespace password, encrypted for this node.
    #[serde(default)]
    pub password_encrypted: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "hdd")]
    pub disk_type: DiskType,
}

fn hdd() -> DiskType {
    DiskType::Hdd
}

// ── Compute ───────────────────────────────────────────────────────

/// Volume mounted into a container or machine, referenced by workload name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MountSpec {
    pub volume: String,
    pub mountpoint: String,
}

/// Attachment of a container or machine to a private network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Name of the network workload (possibly in another deployment).
    pub network: String,
    pub ip: IpAddr,
}

/// Container started from an flist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerData {
    pub flist: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Values encrypted for this node, decrypted at start.
    #[serde(default)]
    pub secret_env: HashMap<String, String>,
    #[serde(default)]
    pub interactive: bool,
    pub cpu: u64,
    /// Memory in bytes.
    pub memory: u64,
    #[serde(default)]
    pub disk_type: DiskType,
    /// Root filesystem size in bytes.
    #[serde(default)]
    pub disk_size: u64,
    #[serde(default)]
    pub network: Option<NetworkAttachment>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeCapacity {
    pub cpu: u64,
    /// Memory in bytes.
    pub memory: u64,
}

/// Virtual machine with explicit compute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZMachineData {
    pub flist: String,
    pub compute: ComputeCapacity,
    /// Root filesystem size in bytes (SSD).
    pub size: u64,
    #[serde(default)]
    pub interfaces: Vec<NetworkAttachment>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Boot an installer image first and wait for it to power off.
    #[serde(default)]
    pub install: bool,
}

/// Kubernetes node VM sized by a fixed class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KubernetesData {
    pub size: u8,
    pub network: NetworkAttachment,
    pub cluster_secret_encrypted: String,
    /// Empty for a master node.
    #[serde(default)]
    pub master_ips: Vec<IpAddr>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
}

/// vCPU, memory (GiB) and SSD (GiB) of a kubernetes size class.
pub fn kubernetes_size(size: u8) -> TypesResult<(u64, u64, u64)> {
    let class = match size {
        1 => (1, 2, 50),
        2 => (2, 4, 100),
        3 => (2, 8, 25),
        4 => (2, 8, 50),
        5 => (2, 8, 200),
        6 => (4, 16, 50),
        7 => (4, 16, 100),
        8 => (4, 16, 400),
        9 => (8, 32, 100),
        10 => (8, 32, 200),
        11 => (8, 32, 800),
        12 => (1, 64, 200),
        13 => (1, 64, 400),
        14 => (1, 64, 800),
        15 => (1, 2, 25),
        16 => (2, 4, 50),
        17 => (4, 8, 50),
        18 => (1, 1, 25),
        other => return Err(TypesError::UnknownSize(other)),
    };
    Ok(class)
}

impl KubernetesData {
    /// Expand the size class into explicit compute and root disk size.
    pub fn compute(&self) -> TypesResult<(ComputeCapacity, u64)> {
        let (cpu, memory_gib, disk_gib) = kubernetes_size(self.size)?;
        Ok((
            ComputeCapacity {
                cpu,
                memory: memory_gib * GIB,
            },
            disk_gib * GIB,
        ))
    }
}

impl Workload {
    /// Capacity this workload consumes once provisioned.
    pub fn capacity(&self) -> TypesResult<Units> {
        let units = match self.kind {
            WorkloadType::Network => Units::ZERO,
            WorkloadType::Zmount => {
                let data: ZmountData = self.payload()?;
                DiskType::Ssd.units(data.size)
            }
            WorkloadType::Zdb => {
                let data: ZdbData = self.payload()?;
                data.disk_type.units(data.size)
            }
            WorkloadType::Container => {
                let data: ContainerData = self.payload()?;
                Units {
                    cru: data.cpu,
                    mru: data.memory,
                    ..Units::ZERO
                } + data.disk_type.units(data.disk_size)
            }
            WorkloadType::Zmachine => {
                let data: ZMachineData = self.payload()?;
                Units {
                    cru: data.compute.cpu,
                    mru: data.compute.memory,
                    sru: data.size,
                    hru: 0,
                }
            }
            WorkloadType::Kubernetes => {
                let data: KubernetesData = self.payload()?;
                let (compute, disk) = data.compute()?;
                Units {
                    cru: compute.cpu,
                    mru: compute.memory,
                    sru: disk,
                    hru: 0,
                }
            }
        };
        Ok(units)
    }
}
