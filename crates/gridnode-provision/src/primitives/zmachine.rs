//! Virtual machine manager.
//!
//! [`Machines`] holds the launch sequence shared by plain machines and
//! kubernetes nodes: boot image, root disk, network taps, volume shares,
//! optional installer run, then the machine. Everything acquired is
//! released in reverse order if a later step fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use gridnode_types::workloads::{MountSpec, NetworkAttachment, ZMachineData};
use gridnode_types::{FlistSource, WorkloadWithId};

use crate::backoff::{retry_until, Backoff};
use crate::collab::{
    BindMount, Dependencies, ImageMounter, NetworkManager, StorageManager, VmInterface, VmRuntime,
    VmSpec,
};
use crate::error::ProvisionResult;
use crate::manager::{Manager, Pauser, Response};
use crate::rollback::Rollback;

use super::{network_id, volume_name};

const INSTALL_WAIT: Backoff =
    Backoff::new(Duration::from_secs(1), Duration::from_secs(30), Duration::from_secs(30 * 60));

/// Everything needed to launch one machine.
#[derive(Debug, Clone)]
pub(crate) struct MachinePlan {
    pub image: FlistSource,
    pub cpu: u64,
    pub memory: u64,
    pub rootfs_size: u64,
    pub interfaces: Vec<NetworkAttachment>,
    pub mounts: Vec<MountSpec>,
    pub entrypoint: String,
    pub env: HashMap<String, String>,
    pub install: bool,
}

fn rootfs_disk(id: &str) -> String {
    format!("{id}-rootfs")
}

fn installer(id: &str) -> String {
    format!("{id}-install")
}

pub(crate) struct Machines {
    vms: Arc<dyn VmRuntime>,
    networks: Arc<dyn NetworkManager>,
    storage: Arc<dyn StorageManager>,
    images: Arc<dyn ImageMounter>,
    install_wait: Backoff,
}

impl Machines {
    pub(crate) fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            vms: deps.vms()?,
            networks: deps.networks()?,
            storage: deps.storage()?,
            images: deps.images()?,
            install_wait: INSTALL_WAIT,
        })
    }

    pub(crate) fn set_install_wait(&mut self, backoff: Backoff) {
        self.install_wait = backoff;
    }

    pub(crate) async fn provision(
        &self,
        wl: &WorkloadWithId,
        plan: MachinePlan,
    ) -> anyhow::Result<Response> {
        let id = wl.id.to_string();
        if self.vms.exists(&id).await? {
            return Ok(Response::NoActionNeeded);
        }
        let mut rollback = Rollback::new(id);
        match self.launch(wl, &plan, &mut rollback).await {
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

    async fn launch(
        &self,
        wl: &WorkloadWithId,
        plan: &MachinePlan,
        rollback: &mut Rollback,
    ) -> anyhow::Result<Response> {
        let id = wl.id.to_string();

        let image = self.images.mount(&id, &plan.image, true).await?;
        let images = self.images.clone();
        let mount_name = id.clone();
        rollback.push("image", move || async move { images.unmount(&mount_name).await });

        let disk_name = rootfs_disk(&id);
        let rootfs = self.storage.create_disk(&disk_name, plan.rootfs_size).await?;
        let storage = self.storage.clone();
        rollback.push("rootfs", move || async move { storage.delete_disk(&disk_name).await });

        let mut interfaces = Vec::with_capacity(plan.interfaces.len());
        for attachment in &plan.interfaces {
            let network = network_id(wl.id.twin, &attachment.network);
            if !self.networks.exists(&network).await? {
                anyhow::bail!("network {} not found", attachment.network);
            }
            let membership = self.networks.join(&network, &id, attachment.ip).await?;
            let networks = self.networks.clone();
            let member = id.clone();
            rollback.push("interface", move || async move { networks.leave(&network, &member).await });
            interfaces.push(VmInterface {
                network_namespace: membership.network_namespace,
                tap: membership.tap,
                ip: attachment.ip,
            });
        }

        let mut shares = Vec::with_capacity(plan.mounts.len());
        for mount in &plan.mounts {
            let name = volume_name(&wl.id, &mount.volume);
            let Some(volume) = self.storage.volume(&name).await? else {
                anyhow::bail!("volume {} not found", mount.volume);
            };
            shares.push(BindMount {
                source: volume.path,
                target: mount.mountpoint.clone(),
            });
        }

        let spec = VmSpec {
            name: id.clone(),
            cpu: plan.cpu,
            memory: plan.memory,
            image,
            disks: vec![rootfs],
            shares,
            interfaces,
            entrypoint: plan.entrypoint.clone(),
            env: plan.env.clone(),
        };

        if plan.install {
            self.install(&spec, rollback).await?;
        }

        self.vms.run(&spec).await?;
        let ips: Vec<_> = spec.interfaces.iter().map(|i| i.ip).collect();
        info!(machine = %id, cpu = plan.cpu, memory = plan.memory, "machine started");
        Ok(Response::Ok(json!({ "ips": ips })))
    }

    /// Boot the installer and wait for it to power off.
    async fn install(&self, spec: &VmSpec, rollback: &mut Rollback) -> anyhow::Result<()> {
        let mut installer_spec = spec.clone();
        installer_spec.name = installer(&spec.name);
        installer_spec.env.insert("GRIDNODE_INSTALL".into(), "1".into());
        self.vms.run(&installer_spec).await?;

        let vms = self.vms.clone();
        let name = installer_spec.name.clone();
        rollback.push("installer", move || async move {
            if vms.exists(&name).await? {
                vms.delete(&name).await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        let vms = self.vms.clone();
        retry_until(self.install_wait, "installer to finish", || {
            let vms = vms.clone();
            let name = installer_spec.name.clone();
            async move { vms.exists(&name).await.map(|running| !running) }
        })
        .await?;
        debug!(machine = %spec.name, "installer finished");
        Ok(())
    }

    /// Best effort: every step runs, the first failure is returned.
    pub(crate) async fn deprovision(
        &self,
        wl: &WorkloadWithId,
        interfaces: &[NetworkAttachment],
    ) -> anyhow::Result<()> {
        let id = wl.id.to_string();
        let mut first_error = None;

        match self.vms.exists(&id).await {
            Ok(true) => {
                if let Err(e) = self.vms.delete(&id).await {
                    first_error.get_or_insert(e);
                }
            }
            Ok(false) => {}
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
        for attachment in interfaces {
            let network = network_id(wl.id.twin, &attachment.network);
            if let Err(e) = self.networks.leave(&network, &id).await {
                warn!(machine = %id, %network, error = %e, "failed to leave network");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.storage.delete_disk(&rootfs_disk(&id)).await {
            first_error.get_or_insert(e);
        }
        if let Err(e) = self.images.unmount(&id).await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(machine = %id, "machine removed");
                Ok(())
            }
        }
    }

    pub(crate) async fn pause(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        self.vms.pause(&wl.id.to_string()).await
    }

    pub(crate) async fn resume(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        self.vms.resume(&wl.id.to_string()).await
    }
}

// ── ZMachine ──────────────────────────────────────────────────────

pub struct ZMachinePrimitive {
    machines: Machines,
}

impl ZMachinePrimitive {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            machines: Machines::new(deps)?,
        })
    }

    /// Override how long an installer may run.
    pub fn with_install_wait(mut self, backoff: Backoff) -> Self {
        self.machines.set_install_wait(backoff);
        self
    }
}

#[async_trait]
impl Manager for ZMachinePrimitive {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let data: ZMachineData = wl.payload()?;
        let plan = MachinePlan {
            image: FlistSource::parse(&data.flist)?,
            cpu: data.compute.cpu,
            memory: data.compute.memory,
            rootfs_size: data.size,
            interfaces: data.interfaces,
            mounts: data.mounts,
            entrypoint: data.entrypoint,
            env: data.env,
            install: data.install,
        };
        self.machines.provision(wl, plan).await
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        let data: ZMachineData = wl.payload()?;
        self.machines.deprovision(wl, &data.interfaces).await
    }
}

#[async_trait]
impl Pauser for ZMachinePrimitive {
    async fn pause(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        self.machines.pause(wl).await
    }

    async fn resume(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        self.machines.resume(wl).await
    }
}
