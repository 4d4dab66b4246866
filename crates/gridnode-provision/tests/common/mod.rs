//! In-memory node: one fake implementing every collaborator trait.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use gridnode_provision::collab::{
    BindMount, ContainerInfo, ContainerRuntime, ContainerSpec, Dependencies, Identity,
    ImageMounter, Membership, NamespaceSpec, NetworkManager, StorageManager, VmRuntime, VmSpec,
    Volume, ZdbClient,
};
use gridnode_provision::primitives::zdb::ZDB_NAMESPACE;
use gridnode_types::workloads::NetworkData;
use gridnode_types::{DiskType, FlistSource};

#[derive(Default)]
pub struct NodeState {
    pub containers: BTreeMap<(String, String), ContainerSpec>,
    pub vms: BTreeMap<String, VmSpec>,
    pub paused: BTreeSet<String>,
    pub networks: BTreeMap<String, BTreeSet<String>>,
    pub volumes: BTreeMap<String, Volume>,
    pub disks: BTreeSet<String>,
    pub mounts: BTreeSet<String>,
    pub namespaces: BTreeMap<String, Vec<String>>,
    pub calls: Vec<String>,
}

pub struct FakeNode {
    root: PathBuf,
    pub state: Mutex<NodeState>,
    failing: Mutex<HashSet<&'static str>>,
}

impl FakeNode {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            root: root.to_path_buf(),
            state: Mutex::new(NodeState::default()),
            failing: Mutex::new(HashSet::new()),
        })
    }

    pub fn deps(self: &Arc<Self>) -> Dependencies {
        Dependencies::default()
            .with_containers(self.clone())
            .with_vms(self.clone())
            .with_networks(self.clone())
            .with_storage(self.clone())
            .with_images(self.clone())
            .with_zdb(self.clone())
            .with_identity(self.clone())
    }

    /// Make every later call to `op` fail.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn heal(&self, op: &'static str) {
        self.failing.lock().unwrap().remove(op);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn enter(&self, op: &'static str, subject: &str) -> anyhow::Result<std::sync::MutexGuard<'_, NodeState>> {
        if self.failing.lock().unwrap().contains(op) {
            anyhow::bail!("{op} failed for {subject}");
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("{op} {subject}"));
        Ok(state)
    }
}

#[async_trait]
impl ContainerRuntime for FakeNode {
    async fn namespaces(&self) -> anyhow::Result<Vec<String>> {
        let state = self.enter("container.namespaces", "")?;
        let set: BTreeSet<String> = state.containers.keys().map(|(ns, _)| ns.clone()).collect();
        Ok(set.into_iter().collect())
    }

    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        let state = self.enter("container.list", namespace)?;
        Ok(state
            .containers
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, id)| id.clone())
            .collect())
    }

    async fn inspect(&self, namespace: &str, id: &str) -> anyhow::Result<ContainerInfo> {
        let state = self.enter("container.inspect", id)?;
        let spec = state
            .containers
            .get(&(namespace.to_string(), id.to_string()))
            .ok_or_else(|| anyhow::anyhow!("no container {id}"))?;
        Ok(ContainerInfo {
            id: id.to_string(),
            root_fs: spec.root_fs.clone(),
            mounts: spec.mounts.clone(),
        })
    }

    async fn exists(&self, namespace: &str, id: &str) -> anyhow::Result<bool> {
        let state = self.state.lock().unwrap();
        Ok(state.containers.contains_key(&(namespace.to_string(), id.to_string())))
    }

    async fn run(&self, namespace: &str, spec: &ContainerSpec) -> anyhow::Result<String> {
        let mut state = self.enter("container.run", &spec.name)?;
        // A zdb container creates its socket on the data volume.
        if namespace == ZDB_NAMESPACE {
            if let Some(data) = spec.mounts.iter().find(|m: &&BindMount| m.target == "/data") {
                std::fs::write(data.source.join("zdb.sock"), b"")?;
            }
        }
        state
            .containers
            .insert((namespace.to_string(), spec.name.clone()), spec.clone());
        Ok(spec.name.clone())
    }

    async fn delete(&self, namespace: &str, id: &str) -> anyhow::Result<()> {
        let mut state = self.enter("container.delete", id)?;
        state.containers.remove(&(namespace.to_string(), id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl VmRuntime for FakeNode {
    async fn run(&self, spec: &VmSpec) -> anyhow::Result<()> {
        let mut state = self.enter("vm.run", &spec.name)?;
        // Installers power off right away.
        if !spec.name.ends_with("-install") {
            state.vms.insert(spec.name.clone(), spec.clone());
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().vms.contains_key(name))
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("vm.delete", name)?;
        state.vms.remove(name);
        state.paused.remove(name);
        Ok(())
    }

    async fn pause(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("vm.pause", name)?;
        state.paused.insert(name.to_string());
        Ok(())
    }

    async fn resume(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("vm.resume", name)?;
        state.paused.remove(name);
        Ok(())
    }
}

#[async_trait]
impl NetworkManager for FakeNode {
    async fn create(&self, id: &str, _network: &NetworkData) -> anyhow::Result<String> {
        let mut state = self.enter("network.create", id)?;
        state.networks.entry(id.to_string()).or_default();
        Ok(format!("n-{id}"))
    }

    async fn exists(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.state.lock().unwrap().networks.contains_key(id))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        let mut state = self.enter("network.delete", id)?;
        state.networks.remove(id);
        Ok(())
    }

    async fn join(&self, id: &str, member: &str, _ip: IpAddr) -> anyhow::Result<Membership> {
        let mut state = self.enter("network.join", member)?;
        let members = state
            .networks
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("no network {id}"))?;
        members.insert(member.to_string());
        Ok(Membership {
            network_namespace: format!("n-{id}"),
            tap: format!("tap-{member}"),
        })
    }

    async fn leave(&self, id: &str, member: &str) -> anyhow::Result<()> {
        let mut state = self.enter("network.leave", member)?;
        if let Some(members) = state.networks.get_mut(id) {
            members.remove(member);
        }
        Ok(())
    }
}

#[async_trait]
impl StorageManager for FakeNode {
    async fn create_volume(&self, name: &str, size: u64, disk: DiskType) -> anyhow::Result<Volume> {
        let mut state = self.enter("storage.create_volume", name)?;
        let path = self.root.join("volumes").join(name);
        std::fs::create_dir_all(&path)?;
        let volume = Volume {
            name: name.to_string(),
            path,
            size,
            disk_type: disk,
        };
        state.volumes.insert(name.to_string(), volume.clone());
        Ok(volume)
    }

    async fn volume(&self, name: &str) -> anyhow::Result<Option<Volume>> {
        Ok(self.state.lock().unwrap().volumes.get(name).cloned())
    }

    async fn volumes(&self) -> anyhow::Result<Vec<Volume>> {
        Ok(self.state.lock().unwrap().volumes.values().cloned().collect())
    }

    async fn resize_volume(&self, name: &str, size: u64) -> anyhow::Result<Volume> {
        let mut state = self.enter("storage.resize_volume", name)?;
        let volume = state
            .volumes
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("no volume {name}"))?;
        volume.size = size;
        Ok(volume.clone())
    }

    async fn delete_volume(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("storage.delete_volume", name)?;
        state.volumes.remove(name);
        Ok(())
    }

    async fn create_disk(&self, name: &str, _size: u64) -> anyhow::Result<PathBuf> {
        let mut state = self.enter("storage.create_disk", name)?;
        state.disks.insert(name.to_string());
        Ok(self.root.join("disks").join(name))
    }

    async fn delete_disk(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("storage.delete_disk", name)?;
        state.disks.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ImageMounter for FakeNode {
    async fn mount(&self, name: &str, _image: &FlistSource, _readonly: bool) -> anyhow::Result<PathBuf> {
        let mut state = self.enter("image.mount", name)?;
        state.mounts.insert(name.to_string());
        Ok(self.root.join("mounts").join(name))
    }

    async fn unmount(&self, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("image.unmount", name)?;
        state.mounts.remove(name);
        Ok(())
    }
}

#[async_trait]
impl ZdbClient for FakeNode {
    async fn namespaces(&self, socket: &str) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.namespaces.get(socket).cloned().unwrap_or_default())
    }

    async fn create_namespace(&self, socket: &str, spec: &NamespaceSpec) -> anyhow::Result<()> {
        let mut state = self.enter("zdb.create_namespace", &spec.name)?;
        state
            .namespaces
            .entry(socket.to_string())
            .or_insert_with(|| vec!["default".to_string()])
            .push(spec.name.clone());
        Ok(())
    }

    async fn delete_namespace(&self, socket: &str, name: &str) -> anyhow::Result<()> {
        let mut state = self.enter("zdb.delete_namespace", name)?;
        if let Some(list) = state.namespaces.get_mut(socket) {
            list.retain(|n| n != name);
        }
        Ok(())
    }
}

#[async_trait]
impl Identity for FakeNode {
    fn node_id(&self) -> &str {
        "node-1"
    }

    async fn decrypt(&self, encrypted: &str) -> anyhow::Result<String> {
        Ok(format!("plain({encrypted})"))
    }
}
