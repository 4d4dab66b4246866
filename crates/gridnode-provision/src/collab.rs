//! Collaborator boundary: the sibling services that own real resources.
//!
//! Managers never talk to a container runtime, hypervisor or disk directly.
//! They are built from a [`Dependencies`] bundle of trait objects, and a
//! manager whose required handle is missing fails at construction time.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use gridnode_types::workloads::{NetworkData, ZdbMode};
use gridnode_types::{DiskType, FlistSource};

use crate::error::{ProvisionError, ProvisionResult};

// ── Wire types ────────────────────────────────────────────────────

/// Host path bound into a container or shared with a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub root_fs: PathBuf,
    pub entrypoint: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<BindMount>,
    /// Network namespace to run in, when attached to a private network.
    #[serde(default)]
    pub network_namespace: Option<String>,
    pub cpu: u64,
    pub memory: u64,
    #[serde(default)]
    pub interactive: bool,
}

/// What the runtime reports about a live container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub root_fs: PathBuf,
    #[serde(default)]
    pub mounts: Vec<BindMount>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmInterface {
    pub network_namespace: String,
    pub tap: String,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub cpu: u64,
    pub memory: u64,
    /// Mounted image the machine boots from.
    pub image: PathBuf,
    /// Root disk followed by any extra disks.
    pub disks: Vec<PathBuf>,
    #[serde(default)]
    pub shares: Vec<BindMount>,
    #[serde(default)]
    pub interfaces: Vec<VmInterface>,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Result of joining a workload to a private network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub network_namespace: String,
    /// Host side device handed to VMs.
    pub tap: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub path: PathBuf,
    /// Quota in bytes, 0 for none.
    pub size: u64,
    pub disk_type: DiskType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceSpec {
    pub name: String,
    pub size: u64,
    pub mode: ZdbMode,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub public: bool,
}

// ── Traits ────────────────────────────────────────────────────────

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime namespaces that hold containers.
    async fn namespaces(&self) -> anyhow::Result<Vec<String>>;
    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>>;
    async fn inspect(&self, namespace: &str, id: &str) -> anyhow::Result<ContainerInfo>;
    async fn exists(&self, namespace: &str, id: &str) -> anyhow::Result<bool>;
    /// Start a container. Its id is `spec.name`.
    async fn run(&self, namespace: &str, spec: &ContainerSpec) -> anyhow::Result<String>;
    async fn delete(&self, namespace: &str, id: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait VmRuntime: Send + Sync {
    async fn run(&self, spec: &VmSpec) -> anyhow::Result<()>;
    async fn exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
    async fn pause(&self, name: &str) -> anyhow::Result<()>;
    async fn resume(&self, name: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait NetworkManager: Send + Sync {
    /// Create or reconfigure a network and return its namespace.
    async fn create(&self, id: &str, network: &NetworkData) -> anyhow::Result<String>;
    async fn exists(&self, id: &str) -> anyhow::Result<bool>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
    async fn join(&self, id: &str, member: &str, ip: IpAddr) -> anyhow::Result<Membership>;
    async fn leave(&self, id: &str, member: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait StorageManager: Send + Sync {
    async fn create_volume(&self, name: &str, size: u64, disk: DiskType) -> anyhow::Result<Volume>;
    async fn volume(&self, name: &str) -> anyhow::Result<Option<Volume>>;
    async fn volumes(&self) -> anyhow::Result<Vec<Volume>>;
    async fn resize_volume(&self, name: &str, size: u64) -> anyhow::Result<Volume>;
    async fn delete_volume(&self, name: &str) -> anyhow::Result<()>;
    /// Allocate a raw VM disk and return its path.
    async fn create_disk(&self, name: &str, size: u64) -> anyhow::Result<PathBuf>;
    async fn delete_disk(&self, name: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ImageMounter: Send + Sync {
    /// Mount `image` under the mount name and return the mountpoint.
    async fn mount(&self, name: &str, image: &FlistSource, readonly: bool) -> anyhow::Result<PathBuf>;
    async fn unmount(&self, name: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait ZdbClient: Send + Sync {
    /// Namespaces served by the zdb listening on `socket`.
    async fn namespaces(&self, socket: &str) -> anyhow::Result<Vec<String>>;
    async fn create_namespace(&self, socket: &str, spec: &NamespaceSpec) -> anyhow::Result<()>;
    async fn delete_namespace(&self, socket: &str, name: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Identity: Send + Sync {
    fn node_id(&self) -> &str;
    /// Decrypt a value the user encrypted for this node.
    async fn decrypt(&self, encrypted: &str) -> anyhow::Result<String>;
}

// ── Dependencies ──────────────────────────────────────────────────

/// Collaborator handles available to the managers.
#[derive(Clone, Default)]
pub struct Dependencies {
    pub containers: Option<Arc<dyn ContainerRuntime>>,
    pub vms: Option<Arc<dyn VmRuntime>>,
    pub networks: Option<Arc<dyn NetworkManager>>,
    pub storage: Option<Arc<dyn StorageManager>>,
    pub images: Option<Arc<dyn ImageMounter>>,
    pub zdb: Option<Arc<dyn ZdbClient>>,
    pub identity: Option<Arc<dyn Identity>>,
}

fn require<T: ?Sized>(handle: &Option<Arc<T>>, name: &'static str) -> ProvisionResult<Arc<T>> {
    handle.clone().ok_or(ProvisionError::MissingDependency(name))
}

impl Dependencies {
    pub fn with_containers(mut self, handle: Arc<dyn ContainerRuntime>) -> Self {
        self.containers = Some(handle);
        self
    }

    pub fn with_vms(mut self, handle: Arc<dyn VmRuntime>) -> Self {
        self.vms = Some(handle);
        self
    }

    pub fn with_networks(mut self, handle: Arc<dyn NetworkManager>) -> Self {
        self.networks = Some(handle);
        self
    }

    pub fn with_storage(mut self, handle: Arc<dyn StorageManager>) -> Self {
        self.storage = Some(handle);
        self
    }

    pub fn with_images(mut self, handle: Arc<dyn ImageMounter>) -> Self {
        self.images = Some(handle);
        self
    }

    pub fn with_zdb(mut self, handle: Arc<dyn ZdbClient>) -> Self {
        self.zdb = Some(handle);
        self
    }

    pub fn with_identity(mut self, handle: Arc<dyn Identity>) -> Self {
        self.identity = Some(handle);
        self
    }

    pub fn containers(&self) -> ProvisionResult<Arc<dyn ContainerRuntime>> {
        require(&self.containers, "container runtime")
    }

    pub fn vms(&self) -> ProvisionResult<Arc<dyn VmRuntime>> {
        require(&self.vms, "vm runtime")
    }

    pub fn networks(&self) -> ProvisionResult<Arc<dyn NetworkManager>> {
        require(&self.networks, "network manager")
    }

    pub fn storage(&self) -> ProvisionResult<Arc<dyn StorageManager>> {
        require(&self.storage, "storage manager")
    }

    pub fn images(&self) -> ProvisionResult<Arc<dyn ImageMounter>> {
        require(&self.images, "image mounter")
    }

    pub fn zdb(&self) -> ProvisionResult<Arc<dyn ZdbClient>> {
        require(&self.zdb, "zdb client")
    }

    pub fn identity(&self) -> ProvisionResult<Arc<dyn Identity>> {
        require(&self.identity, "identity")
    }
}
