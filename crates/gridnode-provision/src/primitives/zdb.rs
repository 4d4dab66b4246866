//! ZDB namespace manager.
//!
//! Namespaces live in shared zdb containers, one per disk type, running in
//! the `zdb` runtime namespace on top of a dedicated volume. A container
//! is started on first use; the janitor tears it down once only the
//! `default` namespace is left.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use gridnode_types::workloads::ZdbData;
use gridnode_types::{DiskType, FlistSource, WorkloadWithId, MIB};

use crate::backoff::{retry_until, Backoff};
use crate::collab::{
    BindMount, ContainerRuntime, ContainerSpec, Dependencies, Identity, ImageMounter,
    NamespaceSpec, StorageManager, ZdbClient,
};
use crate::error::ProvisionResult;
use crate::manager::{Initializer, Manager, Response};
use crate::rollback::Rollback;

/// Runtime namespace holding zdb containers.
pub const ZDB_NAMESPACE: &str = "zdb";

/// Namespace every zdb serves on its own.
pub const DEFAULT_NAMESPACE: &str = "default";

pub const DEFAULT_ZDB_FLIST: &str = "https://hub.grid.tf/official-apps/0-db.flist";

const SOCKET_FILE: &str = "zdb.sock";
const SOCKET_WAIT: Backoff =
    Backoff::new(Duration::from_millis(200), Duration::from_secs(2), Duration::from_secs(60));

/// Socket of a zdb whose data volume is mounted at `volume_path`.
pub fn socket_path(volume_path: &Path) -> PathBuf {
    volume_path.join(SOCKET_FILE)
}

fn pool_name(disk: DiskType) -> &'static str {
    match disk {
        DiskType::Ssd => "zdb-ssd",
        DiskType::Hdd => "zdb-hdd",
    }
}

pub struct ZdbPrimitive {
    containers: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn StorageManager>,
    images: Arc<dyn ImageMounter>,
    zdb: Arc<dyn ZdbClient>,
    identity: Arc<dyn Identity>,
    image: String,
    socket_wait: Backoff,
}

impl ZdbPrimitive {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            containers: deps.containers()?,
            storage: deps.storage()?,
            images: deps.images()?,
            zdb: deps.zdb()?,
            identity: deps.identity()?,
            image: DEFAULT_ZDB_FLIST.to_string(),
            socket_wait: SOCKET_WAIT,
        })
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_socket_wait(mut self, backoff: Backoff) -> Self {
        self.socket_wait = backoff;
        self
    }

    /// Socket of the pool for `disk`, starting its container if needed.
    async fn ensure_pool(&self, disk: DiskType) -> anyhow::Result<String> {
        let name = pool_name(disk);
        let mut rollback = Rollback::new(name);
        match self.start_pool(name, disk, &mut rollback).await {
            Ok(socket) => {
                rollback.commit();
                Ok(socket.to_string_lossy().into_owned())
            }
            Err(e) => {
                rollback.run().await;
                Err(e)
            }
        }
    }

    async fn start_pool(
        &self,
        name: &'static str,
        disk: DiskType,
        rollback: &mut Rollback,
    ) -> anyhow::Result<PathBuf> {
        let volume = match self.storage.volume(name).await? {
            Some(volume) => volume,
            None => {
                let volume = self.storage.create_volume(name, 0, disk).await?;
                let storage = self.storage.clone();
                rollback.push("volume", move || async move { storage.delete_volume(name).await });
                volume
            }
        };
        let socket = socket_path(&volume.path);
        if self.containers.exists(ZDB_NAMESPACE, name).await? {
            return Ok(socket);
        }

        let image = FlistSource::parse(&self.image)?;
        let root_fs = self.images.mount(name, &image, false).await?;
        let images = self.images.clone();
        rollback.push("image", move || async move { images.unmount(name).await });

        let spec = ContainerSpec {
            name: name.to_string(),
            root_fs,
            entrypoint: format!(
                "/bin/zdb --data /data/data --index /data/index --socket /data/{SOCKET_FILE} --mode user"
            ),
            env: Default::default(),
            mounts: vec![BindMount {
                source: volume.path.clone(),
                target: "/data".to_string(),
            }],
            network_namespace: None,
            cpu: 1,
            memory: 256 * MIB,
            interactive: false,
        };
        let id = self.containers.run(ZDB_NAMESPACE, &spec).await?;
        let containers = self.containers.clone();
        rollback.push("container", move || async move {
            containers.delete(ZDB_NAMESPACE, &id).await
        });

        let socket_file = socket.clone();
        retry_until(self.socket_wait, "zdb socket", || {
            let socket_file = socket_file.clone();
            async move { tokio::fs::try_exists(&socket_file).await.map_err(anyhow::Error::from) }
        })
        .await?;
        info!(pool = name, socket = %socket.display(), "zdb pool started");
        Ok(socket)
    }
}

#[async_trait]
impl Manager for ZdbPrimitive {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let data: ZdbData = wl.payload()?;
        let namespace = wl.id.to_string();
        let socket = self.ensure_pool(data.disk_type).await?;

        if self.zdb.namespaces(&socket).await?.contains(&namespace) {
            return Ok(Response::NoActionNeeded);
        }
        let password = if data.password_encrypted.is_empty() {
            String::new()
        } else {
            self.identity.decrypt(&data.password_encrypted).await?
        };
        let spec = NamespaceSpec {
            name: namespace.clone(),
            size: data.size,
            mode: data.mode,
            password,
            public: data.public,
        };
        self.zdb.create_namespace(&socket, &spec).await?;
        info!(%namespace, pool = pool_name(data.disk_type), "zdb namespace created");
        Ok(Response::Ok(json!({
            "namespace": namespace,
            "container": pool_name(data.disk_type),
            "socket": socket,
        })))
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        let data: ZdbData = wl.payload()?;
        let namespace = wl.id.to_string();
        let name = pool_name(data.disk_type);
        let Some(volume) = self.storage.volume(name).await? else {
            debug!(%namespace, pool = name, "pool gone, nothing to delete");
            return Ok(());
        };
        let socket = socket_path(&volume.path).to_string_lossy().into_owned();
        if !self.zdb.namespaces(&socket).await?.contains(&namespace) {
            return Ok(());
        }
        self.zdb.delete_namespace(&socket, &namespace).await?;
        info!(%namespace, pool = name, "zdb namespace deleted");
        Ok(())
    }
}

/// Pre-mount the zdb image so the first namespace does not pay for it.
#[async_trait]
impl Initializer for ZdbPrimitive {
    async fn initialize(&self) -> anyhow::Result<()> {
        let image = FlistSource::parse(&self.image)?;
        let path = self.images.mount("zdb-image", &image, true).await?;
        debug!(path = %path.display(), "zdb image ready");
        Ok(())
    }
}
