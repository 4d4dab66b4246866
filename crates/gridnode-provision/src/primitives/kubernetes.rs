//! Kubernetes node manager: a k3s machine sized by class.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use gridnode_types::workloads::KubernetesData;
use gridnode_types::{FlistSource, WorkloadWithId};

use crate::backoff::Backoff;
use crate::collab::{Dependencies, Identity};
use crate::error::ProvisionResult;
use crate::manager::{Manager, Pauser, Response};

use super::zmachine::{MachinePlan, Machines};

pub const K3S_FLIST: &str = "https://hub.grid.tf/official-apps/k3os.flist";

const K3S_PORT: u16 = 6443;

pub struct KubernetesPrimitive {
    machines: Machines,
    identity: Arc<dyn Identity>,
    image: String,
}

impl KubernetesPrimitive {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            machines: Machines::new(deps)?,
            identity: deps.identity()?,
            image: K3S_FLIST.to_string(),
        })
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_install_wait(mut self, backoff: Backoff) -> Self {
        self.machines.set_install_wait(backoff);
        self
    }

    async fn plan(&self, wl: &WorkloadWithId, data: KubernetesData) -> anyhow::Result<MachinePlan> {
        let (compute, disk) = data.compute()?;
        let token = self.identity.decrypt(&data.cluster_secret_encrypted).await?;

        let mut env = HashMap::new();
        env.insert("K3S_TOKEN".to_string(), token);
        env.insert("K3S_NODE_NAME".to_string(), wl.id.to_string());
        // Workers join the first master; a master has none.
        if let Some(master) = data.master_ips.first() {
            let url = match master {
                std::net::IpAddr::V4(ip) => format!("https://{ip}:{K3S_PORT}"),
                std::net::IpAddr::V6(ip) => format!("https://[{ip}]:{K3S_PORT}"),
            };
            env.insert("K3S_URL".to_string(), url);
        }
        if !data.ssh_keys.is_empty() {
            env.insert("SSH_KEY".to_string(), data.ssh_keys.join("\n"));
        }

        Ok(MachinePlan {
            image: FlistSource::parse(&self.image)?,
            cpu: compute.cpu,
            memory: compute.memory,
            rootfs_size: disk,
            interfaces: vec![data.network],
            mounts: Vec::new(),
            entrypoint: String::new(),
            env,
            install: false,
        })
    }
}

#[async_trait]
impl Manager for KubernetesPrimitive {
    async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
        let data: KubernetesData = wl.payload()?;
        let plan = self.plan(wl, data).await?;
        self.machines.provision(wl, plan).await
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        let data: KubernetesData = wl.payload()?;
        self.machines.deprovision(wl, &[data.network]).await
    }
}

#[async_trait]
impl Pauser for KubernetesPrimitive {
    async fn pause(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        self.machines.pause(wl).await
    }

    async fn resume(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
        self.machines.resume(wl).await
    }
}
