//! Storage volume manager.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use gridnode_types::workloads::ZmountData;
use gridnode_types::{DiskType, WorkloadWithId};

use crate::collab::{Dependencies, StorageManager, Volume};
use crate::error::ProvisionResult;
use crate::manager::{Manager, Response, Updater};

pub struct ZmountPrimitive {
    storage: Arc<dyn StorageManager>,
}

fn describe(volume: &Volume) -> serde_json::Value {
    json!({ "volume_id": volume.name, "path": volume.path, "size": volume.size })
}

impl ZmountPrimitive {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            storage: deps.storage()?,
        })
    }
}

#[async_trait]
impl Manager for ZmountPrimitive {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let data: ZmountData = wl.payload()?;
        let name = wl.id.to_string();
        if self.storage.volume(&name).await?.is_some() {
            return Ok(Response::NoActionNeeded);
        }
        let volume = self.storage.create_volume(&name, data.size, DiskType::Ssd).await?;
        info!(volume = %name, size = data.size, "volume created");
        Ok(Response::Ok(describe(&volume)))
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        let name = wl.id.to_string();
        self.storage.delete_volume(&name).await?;
        info!(volume = %name, "volume deleted");
        Ok(())
    }
}

/// Volumes can only grow.
#[async_trait]
impl Updater for ZmountPrimitive {
    async fn update(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let data: ZmountData = wl.payload()?;
        let name = wl.id.to_string();
        let Some(current) = self.storage.volume(&name).await? else {
            anyhow::bail!("volume {name} does not exist");
        };
        if data.size == current.size {
            return Ok(Response::NoActionNeeded);
        }
        if data.size < current.size {
            return Ok(Response::unchanged(format!(
                "cannot shrink volume from {} to {} bytes",
                current.size, data.size
            )));
        }
        let volume = self.storage.resize_volume(&name, data.size).await?;
        info!(volume = %name, from = current.size, to = data.size, "volume resized");
        Ok(Response::Ok(describe(&volume)))
    }
}
