//! Reconciliation sweep over storage subvolumes and zdb containers.
//!
//! ```text
//! keep set  = root fs + bind sources of every live container
//! subvolume ∉ keep set
//!   ├── workload id ──► cache ──miss──► registry
//!   │                    └── expired, flagged or unknown ──► delete
//!   └── otherwise: 64-char name / pool prefix / legacy name ──► delete
//! zdb container
//!   ├── each non-default namespace resolved the same way
//!   └── only `default` left ──► delete container + volume
//! ```
//!
//! Every deletion stands alone: a failure is recorded in the
//! [`SweepReport`] and the sweep moves on. Running a sweep twice deletes
//! nothing the second time.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use gridnode_provision::collab::{
    ContainerRuntime, Dependencies, ImageMounter, StorageManager, Volume, ZdbClient,
};
use gridnode_provision::primitives::zdb::{socket_path, DEFAULT_NAMESPACE, ZDB_NAMESPACE};
use gridnode_provision::{ProvisionResult, Registry};
use gridnode_state::ReservationCache;
use gridnode_types::config::JanitorSection;
use gridnode_types::reservation::NextAction;
use gridnode_types::{epoch_secs, DeploymentKey, WorkloadId};

use crate::report::SweepReport;

pub const DEFAULT_POOL_PREFIX: &str = "storage-pool-";

/// Subvolume names that are always safe to delete when unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPolicy {
    pub storage_pool_prefix: String,
    pub legacy_names: Vec<String>,
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self {
            storage_pool_prefix: DEFAULT_POOL_PREFIX.to_string(),
            legacy_names: vec!["fdb".to_string()],
        }
    }
}

impl SweepPolicy {
    pub fn from_config(section: Option<&JanitorSection>) -> Self {
        let mut policy = Self::default();
        if let Some(section) = section {
            if let Some(prefix) = &section.storage_pool_prefix {
                policy.storage_pool_prefix = prefix.clone();
            }
            if let Some(names) = &section.legacy_names {
                policy.legacy_names = names.clone();
            }
        }
        policy
    }

    fn is_disposable(&self, name: &str) -> bool {
        name.len() == 64
            || name.starts_with(&self.storage_pool_prefix)
            || self.legacy_names.iter().any(|legacy| legacy == name)
    }
}

/// Whether the reservation behind a resource still wants it.
#[derive(Debug)]
enum Verdict {
    Live,
    Gone(&'static str),
    /// Not named after a workload.
    Unmanaged,
    Unresolved(anyhow::Error),
}

pub struct Janitor {
    containers: Arc<dyn ContainerRuntime>,
    storage: Arc<dyn StorageManager>,
    images: Arc<dyn ImageMounter>,
    zdb: Arc<dyn ZdbClient>,
    cache: Option<ReservationCache>,
    registry: Option<Arc<dyn Registry>>,
    policy: SweepPolicy,
}

impl Janitor {
    pub fn new(deps: &Dependencies) -> ProvisionResult<Self> {
        Ok(Self {
            containers: deps.containers()?,
            storage: deps.storage()?,
            images: deps.images()?,
            zdb: deps.zdb()?,
            cache: None,
            registry: None,
            policy: SweepPolicy::default(),
        })
    }

    pub fn with_cache(mut self, cache: ReservationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_policy(mut self, policy: SweepPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "janitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.sweep().await;
            info!(
                deleted = report.deleted.len(),
                kept = report.kept.len(),
                errors = report.errors.len(),
                "janitor sweep finished"
            );
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("janitor stopped");
    }

    pub async fn sweep(&self) -> SweepReport {
        let mut report = self.sweep_volumes().await;
        report.merge(self.sweep_zdb().await);
        report
    }

    // ── Subvolumes ─────────────────────────────────────────────────

    /// Paths of every live container's root fs and bind sources.
    async fn keep_set(&self) -> anyhow::Result<HashSet<PathBuf>> {
        let mut keep = HashSet::new();
        for namespace in self.containers.namespaces().await? {
            for id in self.containers.list(&namespace).await? {
                let info = self.containers.inspect(&namespace, &id).await?;
                keep.insert(info.root_fs);
                keep.extend(info.mounts.into_iter().map(|m| m.source));
            }
        }
        Ok(keep)
    }

    async fn sweep_volumes(&self) -> SweepReport {
        let mut report = SweepReport::default();
        // Without a complete keep set nothing is provably unused.
        let keep = match self.keep_set().await {
            Ok(keep) => keep,
            Err(e) => {
                warn!(error = %e, "cannot list containers, skipping subvolume sweep");
                report.error(format!("keep set: {e:#}"));
                return report;
            }
        };
        let volumes = match self.storage.volumes().await {
            Ok(volumes) => volumes,
            Err(e) => {
                report.error(format!("list subvolumes: {e:#}"));
                return report;
            }
        };

        for volume in volumes {
            if in_use(&keep, &volume) {
                report.kept.push(volume.name);
                continue;
            }
            // Workload-named volumes always go through their reservation,
            // whatever their length.
            let reason = match self.resolve(&volume.name).await {
                Verdict::Gone(reason) => reason,
                Verdict::Unmanaged if self.policy.is_disposable(&volume.name) => "unused",
                Verdict::Live | Verdict::Unmanaged => {
                    report.kept.push(volume.name);
                    continue;
                }
                Verdict::Unresolved(e) => {
                    report.error(format!("resolve {}: {e:#}", volume.name));
                    report.kept.push(volume.name);
                    continue;
                }
            };
            match self.storage.delete_volume(&volume.name).await {
                Ok(()) => {
                    info!(subvolume = %volume.name, reason, "subvolume deleted");
                    report.deleted.push(volume.name);
                }
                Err(e) => {
                    warn!(subvolume = %volume.name, error = %e, "failed to delete subvolume");
                    report.error(format!("delete {}: {e:#}", volume.name));
                }
            }
        }
        report
    }

    // ── ZDB ────────────────────────────────────────────────────────

    async fn sweep_zdb(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let pools = match self.containers.list(ZDB_NAMESPACE).await {
            Ok(pools) => pools,
            Err(e) => {
                report.error(format!("list zdb containers: {e:#}"));
                return report;
            }
        };
        for pool in pools {
            report.merge(self.sweep_pool(&pool).await);
        }
        report
    }

    async fn sweep_pool(&self, pool: &str) -> SweepReport {
        let mut report = SweepReport::default();
        let info = match self.containers.inspect(ZDB_NAMESPACE, pool).await {
            Ok(info) => info,
            Err(e) => {
                report.error(format!("inspect zdb {pool}: {e:#}"));
                return report;
            }
        };
        let Some(data) = info.mounts.iter().find(|m| m.target == "/data") else {
            debug!(%pool, "zdb container without data volume, leaving it");
            report.kept.push(format!("zdb:{pool}"));
            return report;
        };
        let socket = socket_path(&data.source).to_string_lossy().into_owned();
        let namespaces = match self.zdb.namespaces(&socket).await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                report.error(format!("list namespaces of {pool}: {e:#}"));
                return report;
            }
        };

        let mut remaining = 0usize;
        for namespace in namespaces.iter().filter(|n| n.as_str() != DEFAULT_NAMESPACE) {
            let entry = format!("{pool}/{namespace}");
            match self.resolve(namespace).await {
                Verdict::Gone(reason) => {
                    match self.zdb.delete_namespace(&socket, namespace).await {
                        Ok(()) => {
                            info!(%pool, %namespace, reason, "zdb namespace deleted");
                            report.deleted.push(entry);
                        }
                        Err(e) => {
                            remaining += 1;
                            report.error(format!("delete {entry}: {e:#}"));
                        }
                    }
                }
                Verdict::Live | Verdict::Unmanaged => {
                    remaining += 1;
                    report.kept.push(entry);
                }
                Verdict::Unresolved(e) => {
                    remaining += 1;
                    report.error(format!("resolve {entry}: {e:#}"));
                    report.kept.push(entry);
                }
            }
        }

        if remaining == 0 {
            report.merge(self.teardown_pool(pool).await);
        } else {
            report.kept.push(format!("zdb:{pool}"));
        }
        report
    }

    /// Remove an empty zdb container. Its volume shares the container name.
    async fn teardown_pool(&self, pool: &str) -> SweepReport {
        let mut report = SweepReport::default();
        if let Err(e) = self.containers.delete(ZDB_NAMESPACE, pool).await {
            report.error(format!("delete zdb {pool}: {e:#}"));
            return report;
        }
        if let Err(e) = self.images.unmount(pool).await {
            warn!(%pool, error = %e, "failed to unmount zdb root fs");
            report.error(format!("unmount {pool}: {e:#}"));
        }
        if let Err(e) = self.storage.delete_volume(pool).await {
            report.error(format!("delete {pool}: {e:#}"));
        } else {
            report.deleted.push(pool.to_string());
        }
        info!(%pool, "empty zdb container removed");
        report.deleted.push(format!("zdb:{pool}"));
        report
    }

    // ── Resolution ─────────────────────────────────────────────────

    /// Local cache first, registry on a miss.
    async fn resolve(&self, name: &str) -> Verdict {
        let Ok(id) = WorkloadId::parse(name) else {
            return Verdict::Unmanaged;
        };
        let now = epoch_secs();
        let key = DeploymentKey {
            twin: id.twin,
            contract: id.contract,
        };

        if let Some(cache) = &self.cache {
            match cache.get(key) {
                Ok(Some(record)) if record.to_delete => return Verdict::Gone("flagged"),
                Ok(Some(record)) if record.is_gone(now) => return Verdict::Gone("expired"),
                Ok(Some(_)) => return Verdict::Live,
                Ok(None) => {}
                Err(e) => warn!(%key, error = %e, "cache lookup failed, asking registry"),
            }
        }

        let Some(registry) = &self.registry else {
            return Verdict::Live;
        };
        match registry.get(id.contract).await {
            Ok(None) => Verdict::Gone("unknown"),
            Ok(Some(r)) if matches!(r.next_action, NextAction::Delete | NextAction::Deleted) => {
                Verdict::Gone("flagged")
            }
            Ok(Some(r)) if r.expired(now) => Verdict::Gone("expired"),
            Ok(Some(_)) => Verdict::Live,
            Err(e) => Verdict::Unresolved(e),
        }
    }
}

fn in_use(keep: &HashSet<PathBuf>, volume: &Volume) -> bool {
    keep.iter().any(|path| path.starts_with(&volume.path))
}
