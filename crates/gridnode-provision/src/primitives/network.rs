//! Private network manager.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use gridnode_types::workloads::NetworkData;
use gridnode_types::WorkloadWithId;

use crate::collab::{Dependencies, Identity, NetworkManager};
use crate::error::ProvisionResult;
use crate::manager::{Manager, Response, Updater};

use super::network_id;

pub struct NetworkPrimitive {
    networks: Arc<dyn NetworkManager>,
    identity: Arc<dyn Identity>,
}

impl NetworkPrimitive {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            networks: deps.networks()?,
            identity: deps.identity()?,
        })
    }

    /// Create or reconfigure the network with the key decrypted.
    async fn apply(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let mut data: NetworkData = wl.payload()?;
        data.wireguard_private_key_encrypted = self
            .identity
            .decrypt(&data.wireguard_private_key_encrypted)
            .await?;
        let id = network_id(wl.id.twin, &wl.name);
        let namespace = self.networks.create(&id, &data).await?;
        info!(network = %id, %namespace, subnet = %data.subnet, "network applied");
        Ok(Response::Ok(json!({ "network_id": id, "namespace": namespace })))
    }
}

#[async_trait]
impl Manager for NetworkPrimitive {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let id = network_id(wl.id.twin, &wl.name);
        if self.networks.exists(&id).await? {
            return Ok(Response::NoActionNeeded);
        }
        self.apply(wl).await
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        let id = network_id(wl.id.twin, &wl.name);
        self.networks.delete(&id).await?;
        info!(network = %id, "network deleted");
        Ok(())
    }
}

#[async_trait]
impl Updater for NetworkPrimitive {
    async fn update(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        self.apply(wl).await
    }
}
