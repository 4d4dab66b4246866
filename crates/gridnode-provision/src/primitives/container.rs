//! Container manager.
//!
//! Acquisition order: root filesystem (flist mount), network membership,
//! volume binds, then the container itself. A failure at any step releases
//! what was acquired so far, newest first.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use gridnode_types::workloads::ContainerData;
use gridnode_types::{FlistSource, WorkloadWithId};

use crate::collab::{
    BindMount, ContainerRuntime, ContainerSpec, Dependencies, Identity, ImageMounter,
    NetworkManager, StorageManager,
};
use crate::error::ProvisionResult;
use crate::manager::{Manager, Response};
use crate::rollback::Rollback;

use super::{network_id, volume_name, USER_NAMESPACE};

pub struct ContainerPrimitive {
    containers: Arc<dyn ContainerRuntime>,
    networks: Arc<dyn NetworkManager>,
    storage: Arc<dyn StorageManager>,
    images: Arc<dyn ImageMounter>,
    identity: Arc<dyn Identity>,
}

/// Decrypt `secret` values and merge them over `plain`.
pub(crate) async fn merge_env(
    identity: &dyn Identity,
    plain: &HashMap<String, String>,
    secret: &HashMap<String, String>,
) -> anyhow::Result<HashMap<String, String>> {
    let mut env = plain.clone();
    for (key, value) in secret {
        env.insert(key.clone(), identity.decrypt(value).await?);
    }
    Ok(env)
}

impl ContainerPrimitive {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            containers: deps.containers()?,
            networks: deps.networks()?,
            storage: deps.storage()?,
            images: deps.images()?,
            identity: deps.identity()?,
        })
    }

    async fn start(
        &self,
        wl: &WorkloadWithId,
        data: &ContainerData,
        rollback: &mut Rollback,
    ) -> anyhow::Result<Response> {
        let id = wl.id.to_string();
        let image = FlistSource::parse(&data.flist)?;

        let root_fs = self.images.mount(&id, &image, false).await?;
        let images = self.images.clone();
        let mount_name = id.clone();
        rollback.push("root fs", move || async move { images.unmount(&mount_name).await });

        let mut network_namespace = None;
        let mut ip = None;
        if let Some(attachment) = &data.network {
            let network = network_id(wl.id.twin, &attachment.network);
            if !self.networks.exists(&network).await? {
                anyhow::bail!("network {} not found", attachment.network);
            }
            let membership = self.networks.join(&network, &id, attachment.ip).await?;
            let networks = self.networks.clone();
            let member = id.clone();
            rollback.push("network", move || async move { networks.leave(&network, &member).await });
            network_namespace = Some(membership.network_namespace);
            ip = Some(attachment.ip);
        }

        let mut mounts = Vec::with_capacity(data.mounts.len());
        for mount in &data.mounts {
            let name = volume_name(&wl.id, &mount.volume);
            let Some(volume) = self.storage.volume(&name).await? else {
                anyhow::bail!("volume {} not found", mount.volume);
            };
            mounts.push(BindMount {
                source: volume.path,
                target: mount.mountpoint.clone(),
            });
        }

        let env = merge_env(self.identity.as_ref(), &data.env, &data.secret_env).await?;
        let spec = ContainerSpec {
            name: id.clone(),
            root_fs,
            entrypoint: data.entrypoint.clone(),
            env,
            mounts,
            network_namespace,
            cpu: data.cpu,
            memory: data.memory,
            interactive: data.interactive,
        };
        let container = self.containers.run(USER_NAMESPACE, &spec).await?;
        info!(%container, flist = image.file_name(), "container started");
        Ok(Response::Ok(json!({ "id": container, "ip": ip })))
    }
}

#[async_trait]
impl Manager for ContainerPrimitive {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let data: ContainerData = wl.payload()?;
        let id = wl.id.to_string();
        if self.containers.exists(USER_NAMESPACE, &id).await? {
            return Ok(Response::NoActionNeeded);
        }

        let mut rollback = Rollback::new(id);
        match self.start(wl, &data, &mut rollback).await {
            Ok(response) => {
                rollback.commit();
                Ok(response)
            }
            Err(e) => {
                rollback.run().await;
                Err(e)
            }
        }
    }

    /// Best effort: every step runs, the first failure is returned.
    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        let data: ContainerData = wl.payload()?;
        let id = wl.id.to_string();
        let mut first_error = None;

        if self.containers.exists(USER_NAMESPACE, &id).await? {
            if let Err(e) = self.containers.delete(USER_NAMESPACE, &id).await {
                warn!(container = %id, error = %e, "failed to delete container");
                first_error.get_or_insert(e);
            }
        }
        if let Some(attachment) = &data.network {
            let network = network_id(wl.id.twin, &attachment.network);
            if let Err(e) = self.networks.leave(&network, &id).await {
                warn!(container = %id, %network, error = %e, "failed to leave network");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.images.unmount(&id).await {
            warn!(container = %id, error = %e, "failed to unmount root fs");
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(container = %id, "container removed");
                Ok(())
            }
        }
    }
}
