//! JSON-over-HTTP clients for the sibling services.
//!
//! Every collaborator call is a `POST {service}/{method}` with a JSON
//! body; the reply is the JSON encoded return value (`null` for unit).

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;

use gridnode_provision::collab::{
    ContainerInfo, ContainerRuntime, ContainerSpec, Dependencies, Identity, ImageMounter,
    Membership, NamespaceSpec, NetworkManager, StorageManager, VmRuntime, VmSpec, Volume,
    ZdbClient,
};
use gridnode_types::config::ServicesSection;
use gridnode_types::workloads::NetworkData;
use gridnode_types::{DiskType, FlistSource};

#[derive(Clone)]
pub struct RpcClient {
    service: &'static str,
    base_url: String,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(service: &'static str, base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            service,
            base_url: base_url.into(),
            client,
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url.trim_end_matches('/'))
    }

    pub async fn call<P, R>(&self, method: &str, params: &P) -> anyhow::Result<R>
    where
        P: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let response = self.client.post(self.url(method)).json(params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("{} {method} failed ({status}): {body}", self.service);
        }
        Ok(response.json().await?)
    }
}

/// Collaborator handles backed by [`RpcClient`]s, one per service.
pub struct RpcCollaborators;

impl RpcCollaborators {
    pub fn dependencies(
        services: &ServicesSection,
        node_id: &str,
        timeout: Duration,
    ) -> anyhow::Result<Dependencies> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let rpc = |service, url: &String| RpcClient::new(service, url.clone(), client.clone());

        Ok(Dependencies::default()
            .with_containers(Arc::new(RpcContainers(rpc("containers", &services.containers))))
            .with_vms(Arc::new(RpcVms(rpc("vms", &services.vms))))
            .with_networks(Arc::new(RpcNetworks(rpc("networks", &services.networks))))
            .with_storage(Arc::new(RpcStorage(rpc("storage", &services.storage))))
            .with_images(Arc::new(RpcImages(rpc("flists", &services.flists))))
            .with_zdb(Arc::new(RpcZdb(rpc("zdb", &services.zdb))))
            .with_identity(Arc::new(RpcIdentity {
                rpc: rpc("identity", &services.identity),
                node_id: node_id.to_string(),
            })))
    }
}

// ── Containers ────────────────────────────────────────────────────

pub struct RpcContainers(RpcClient);

#[async_trait]
impl ContainerRuntime for RpcContainers {
    async fn namespaces(&self) -> anyhow::Result<Vec<String>> {
        self.0.call("namespaces", &json!({})).await
    }

    async fn list(&self, namespace: &str) -> anyhow::Result<Vec<String>> {
        self.0.call("list", &json!({ "namespace": namespace })).await
    }

    async fn inspect(&self, namespace: &str, id: &str) -> anyhow::Result<ContainerInfo> {
        self.0.call("inspect", &json!({ "namespace": namespace, "id": id })).await
    }

    async fn exists(&self, namespace: &str, id: &str) -> anyhow::Result<bool> {
        self.0.call("exists", &json!({ "namespace": namespace, "id": id })).await
    }

    async fn run(&self, namespace: &str, spec: &ContainerSpec) -> anyhow::Result<String> {
        self.0.call("run", &json!({ "namespace": namespace, "spec": spec })).await
    }

    async fn delete(&self, namespace: &str, id: &str) -> anyhow::Result<()> {
        self.0.call("delete", &json!({ "namespace": namespace, "id": id })).await
    }
}

// ── VMs ───────────────────────────────────────────────────────────

pub struct RpcVms(RpcClient);

#[async_trait]
impl VmRuntime for RpcVms {
    async fn run(&self, spec: &VmSpec) -> anyhow::Result<()> {
        self.0.call("run", spec).await
    }

    async fn exists(&self, name: &str) -> anyhow::Result<bool> {
        self.0.call("exists", &json!({ "name": name })).await
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        self.0.call("delete", &json!({ "name": name })).await
    }

    async fn pause(&self, name: &str) -> anyhow::Result<()> {
        self.0.call("pause", &json!({ "name": name })).await
    }

    async fn resume(&self, name: &str) -> anyhow::Result<()> {
        self.0.call("resume", &json!({ "name": name })).await
    }
}

// ── Networks ──────────────────────────────────────────────────────

pub struct RpcNetworks(RpcClient);

#[async_trait]
impl NetworkManager for RpcNetworks {
    async fn create(&self, id: &str, network: &NetworkData) -> anyhow::Result<String> {
        self.0.call("create", &json!({ "id": id, "network": network })).await
    }

    async fn exists(&self, id: &str) -> anyhow::Result<bool> {
        self.0.call("exists", &json!({ "id": id })).await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.0.call("delete", &json!({ "id": id })).await
    }

    async fn join(&self, id: &str, member: &str, ip: IpAddr) -> anyhow::Result<Membership> {
        self.0
            .call("join", &json!({ "id": id, "member": member, "ip": ip }))
            .await
    }

    async fn leave(&self, id: &str, member: &str) -> anyhow::Result<()> {
        self.0.call("leave", &json!({ "id": id, "member": member })).await
    }
}

// ── Storage ───────────────────────────────────────────────────────

pub struct RpcStorage(RpcClient);

#[async_trait]
impl StorageManager for RpcStorage {
    async fn create_volume(&self, name: &str, size: u64, disk: DiskType) -> anyhow::Result<Volume> {
        self.0
            .call("volume/create", &json!({ "name": name, "size": size, "disk_type": disk }))
            .await
    }

    async fn volume(&self, name: &str) -> anyhow::Result<Option<Volume>> {
        self.0.call("volume/get", &json!({ "name": name })).await
    }

    async fn volumes(&self) -> anyhow::Result<Vec<Volume>> {
        self.0.call("volume/list", &json!({})).await
    }

    async fn resize_volume(&self, name: &str, size: u64) -> anyhow::Result<Volume> {
        self.0
            .call("volume/resize", &json!({ "name": name, "size": size }))
            .await
    }

    async fn delete_volume(&self, name: &str) -> anyhow::Result<()> {
        self.0.call("volume/delete", &json!({ "name": name })).await
    }

    async fn create_disk(&self, name: &str, size: u64) -> anyhow::Result<PathBuf> {
        self.0
            .call("disk/create", &json!({ "name": name, "size": size }))
            .await
    }

    async fn delete_disk(&self, name: &str) -> anyhow::Result<()> {
        self.0.call("disk/delete", &json!({ "name": name })).await
    }
}

// ── Images ────────────────────────────────────────────────────────

pub struct RpcImages(RpcClient);

#[async_trait]
impl ImageMounter for RpcImages {
    async fn mount(&self, name: &str, image: &FlistSource, readonly: bool) -> anyhow::Result<PathBuf> {
        self.0
            .call(
                "mount",
                &json!({ "name": name, "url": image.location(), "readonly": readonly }),
            )
            .await
    }

    async fn unmount(&self, name: &str) -> anyhow::Result<()> {
        self.0.call("unmount", &json!({ "name": name })).await
    }
}

// ── ZDB ───────────────────────────────────────────────────────────

pub struct RpcZdb(RpcClient);

#[async_trait]
impl ZdbClient for RpcZdb {
    async fn namespaces(&self, socket: &str) -> anyhow::Result<Vec<String>> {
        self.0.call("namespaces", &json!({ "socket": socket })).await
    }

    async fn create_namespace(&self, socket: &str, spec: &NamespaceSpec) -> anyhow::Result<()> {
        self.0
            .call("namespace/create", &json!({ "socket": socket, "spec": spec }))
            .await
    }

    async fn delete_namespace(&self, socket: &str, name: &str) -> anyhow::Result<()> {
        self.0
            .call("namespace/delete", &json!({ "socket": socket, "name": name }))
            .await
    }
}

// ── Identity ──────────────────────────────────────────────────────

pub struct RpcIdentity {
    rpc: RpcClient,
    node_id: String,
}

#[async_trait]
impl Identity for RpcIdentity {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    async fn decrypt(&self, encrypted: &str) -> anyhow::Result<String> {
        let reply: HashMap<String, String> =
            self.rpc.call("decrypt", &json!({ "data": encrypted })).await?;
        reply
            .get("data")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("identity decrypt reply without data"))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use gridnode_types::NodeConfig;

    use super::*;

    #[test]
    fn method_url_ignores_trailing_slash() {
        let rpc = RpcClient::new("storage", "http://127.0.0.1:7003/", reqwest::Client::new());
        assert_eq!(rpc.url("volume/list"), "http://127.0.0.1:7003/volume/list");
    }

    #[test]
    fn every_collaborator_is_wired() {
        let config = NodeConfig::scaffold("node-1", Path::new("/tmp/gridnode"));
        let deps =
            RpcCollaborators::dependencies(&config.services, "node-1", Duration::from_secs(5))
                .unwrap();
        assert!(deps.containers().is_ok());
        assert!(deps.vms().is_ok());
        assert!(deps.networks().is_ok());
        assert!(deps.storage().is_ok());
        assert!(deps.images().is_ok());
        assert!(deps.zdb().is_ok());
        assert_eq!(deps.identity().unwrap().node_id(), "node-1");
    }
}
