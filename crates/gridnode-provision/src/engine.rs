//! Engine — the single consumer of provisioning work.
//!
//! One task selects over the provision channel, the deprovision channel and
//! shutdown, and handles one job at a time:
//!
//! - `Deploy` installs a new deployment or updates a stored one.
//! - A deprovision key decommissions the deployment in reverse type order.
//! - `Pause` / `Resume` flip every eligible workload of a deployment.
//!
//! Every workload result is written back to the store right after its
//! operation and reported in the background. Failures are logged and the
//! loop moves on to the next job.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use gridnode_state::{CachedReservation, DeploymentStore, ReservationCache};
use gridnode_types::{
    Deployment, DeploymentKey, ResultState, Workload, WorkloadId, WorkloadResult, WorkloadWithId,
};

use crate::error::{ProvisionError, ProvisionResult};
use crate::provisioner::Provision;
use crate::registry::Feedback;
use crate::sources::{ProvisionJob, Receivers};

pub struct Engine {
    store: DeploymentStore,
    provisioner: Arc<dyn Provision>,
    cache: Option<ReservationCache>,
    feedback: Feedback,
}

impl Engine {
    pub fn new(store: DeploymentStore, provisioner: Arc<dyn Provision>) -> Self {
        Self {
            store,
            provisioner,
            cache: None,
            feedback: Feedback::disabled(),
        }
    }

    pub fn with_cache(mut self, cache: ReservationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_feedback(mut self, feedback: Feedback) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn store(&self) -> &DeploymentStore {
        &self.store
    }

    /// Initialize managers, then bring back every workload the store says
    /// is live. Managers answer `NoActionNeeded` for resources that survived.
    pub async fn boot(&self) -> ProvisionResult<()> {
        self.provisioner.initialize().await?;
        let deployments = self.store.deployments()?;
        info!(deployments = deployments.len(), "restoring deployments");
        for mut deployment in deployments {
            for name in deployment.provision_order() {
                let Some(wl) = deployment.get(&name).filter(|wl| wl.is_ok()) else {
                    continue;
                };
                let wl = deployment.with_id(wl);
                match self.provisioner.provision(&wl).await {
                    Ok(result) => self.record(&mut deployment, wl.id, result),
                    Err(ProvisionError::NoActionNeeded) => {}
                    Err(e) => self.record(&mut deployment, wl.id, WorkloadResult::error(e.to_string())),
                }
            }
        }
        Ok(())
    }

    /// Consume jobs until shutdown or until both channels are closed.
    pub async fn run(self, mut receivers: Receivers, mut shutdown: watch::Receiver<bool>) {
        let mut provision_open = true;
        let mut deprovision_open = true;
        info!("engine started");
        while provision_open || deprovision_open {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("engine shutting down");
                    return;
                }
                job = receivers.provision.recv(), if provision_open => match job {
                    Some(job) => self.handle(job).await,
                    None => provision_open = false,
                },
                key = receivers.deprovision.recv(), if deprovision_open => match key {
                    Some(key) => self.decommission(key).await,
                    None => deprovision_open = false,
                },
            }
        }
        info!("engine channels closed");
    }

    pub async fn handle(&self, job: ProvisionJob) {
        match job {
            ProvisionJob::Deploy {
                deployment,
                expires_at,
            } => {
                let key = deployment.key();
                if let Err(e) = deployment.validate() {
                    warn!(%key, error = %e, "rejecting invalid deployment");
                    self.report_all(&deployment, &e.to_string());
                    return;
                }
                let stored = match self.store.exists(key.twin, key.contract) {
                    Ok(true) => self.update(deployment).await,
                    Ok(false) => self.install(deployment).await,
                    Err(e) => {
                        error!(%key, error = %e, "failed to look up deployment");
                        false
                    }
                };
                if let (true, Some(expires_at)) = (stored, expires_at) {
                    self.remember(key, expires_at);
                }
            }
            ProvisionJob::Pause(key) => self.transition(key, true).await,
            ProvisionJob::Resume(key) => self.transition(key, false).await,
        }
    }

    // ── Install / update ───────────────────────────────────────────

    async fn install(&self, mut deployment: Deployment) -> bool {
        let key = deployment.key();
        for wl in &mut deployment.workloads {
            wl.result = None;
        }
        if let Err(e) = self.store.add(&deployment) {
            error!(%key, error = %e, "failed to store deployment");
            self.report_all(&deployment, &e.to_string());
            return false;
        }

        info!(%key, workloads = deployment.workloads.len(), "installing deployment");
        for name in deployment.provision_order() {
            self.provision_one(&mut deployment, &name).await;
        }
        true
    }

    async fn update(&self, incoming: Deployment) -> bool {
        let key = incoming.key();
        let current = match self.store.get(key.twin, key.contract) {
            Ok(current) => current,
            Err(e) => {
                error!(%key, error = %e, "failed to load deployment for update");
                return false;
            }
        };

        let mut merged = incoming;
        for wl in &mut merged.workloads {
            wl.result = current.get(&wl.name).and_then(|old| old.result.clone());
        }

        let removed: Vec<Workload> = current
            .deprovision_order()
            .into_iter()
            .filter(|name| merged.get(name).is_none())
            .filter_map(|name| current.get(&name).cloned())
            .collect();

        // Claims and I/O are checked here, before anything is torn down.
        let mut staged = merged.clone();
        staged.workloads.extend(removed.iter().cloned());
        if let Err(e) = self.store.set(&staged) {
            error!(%key, error = %e, "failed to store updated deployment");
            self.report_all(&merged, &e.to_string());
            return false;
        }

        for old in &removed {
            let old = current.with_id(old);
            let result = self.remove(&old).await;
            self.feedback.report(old.id, result);
        }
        if !removed.is_empty() {
            if let Err(e) = self.store.set(&merged) {
                error!(%key, error = %e, "failed to drop removed workloads");
                return false;
            }
        }

        info!(%key, "updating deployment");
        for name in merged.provision_order() {
            match current.get(&name) {
                None => self.provision_one(&mut merged, &name).await,
                Some(old) if is_same(old, merged.get(&name)) => {
                    debug!(%key, workload = %name, "workload unchanged");
                }
                Some(old) => self.update_one(&mut merged, old).await,
            }
        }
        true
    }

    async fn provision_one(&self, deployment: &mut Deployment, name: &str) {
        let Some(wl) = deployment.get(name) else {
            return;
        };
        let wl = deployment.with_id(wl);
        let result = match self.provisioner.provision(&wl).await {
            Ok(result) => result,
            Err(ProvisionError::NoActionNeeded) if wl.result.is_some() => return,
            // Resource already there on first sight: adopt it.
            Err(ProvisionError::NoActionNeeded) => WorkloadResult::ok(serde_json::Value::Null),
            Err(e) => WorkloadResult::error(e.to_string()),
        };
        if result.state == ResultState::Error {
            warn!(id = %wl.id, error = ?result.error, "workload failed");
        }
        self.record(deployment, wl.id, result);
    }

    /// Update a changed workload. Anything but `Ok` leaves the stored
    /// workload as it was and only reports the outcome.
    async fn update_one(&self, deployment: &mut Deployment, old: &Workload) {
        let Some(wl) = deployment.get(&old.name) else {
            return;
        };
        let wl = deployment.with_id(wl);
        let result = if wl.kind != old.kind {
            WorkloadResult::with_state(
                ResultState::Unchanged,
                serde_json::Value::Null,
                Some(format!("cannot change workload type from {} to {}", old.kind, wl.kind)),
            )
        } else {
            match self.provisioner.update(&wl, old).await {
                Ok(result) => result,
                Err(ProvisionError::NoActionNeeded) => return,
                Err(e) => WorkloadResult::with_state(
                    ResultState::Unchanged,
                    serde_json::Value::Null,
                    Some(e.to_string()),
                ),
            }
        };

        if result.state == ResultState::Ok {
            self.record(deployment, wl.id, result);
            return;
        }
        warn!(id = %wl.id, state = ?result.state, error = ?result.error, "update not applied");
        if let Some(slot) = deployment.get_mut(&old.name) {
            *slot = old.clone();
        }
        if let Err(e) = self.store.set(deployment) {
            error!(id = %wl.id, error = %e, "failed to restore workload");
        }
        self.feedback.report(wl.id, result);
    }

    // ── Decommission ───────────────────────────────────────────────

    pub async fn decommission(&self, key: DeploymentKey) {
        let mut deployment = match self.store.get(key.twin, key.contract) {
            Ok(deployment) => deployment,
            Err(e) if e.is_not_exists() => {
                debug!(%key, "nothing to decommission");
                self.forget(key);
                return;
            }
            Err(e) => {
                error!(%key, error = %e, "failed to load deployment for decommission");
                return;
            }
        };

        info!(%key, "decommissioning deployment");
        for name in deployment.deprovision_order() {
            let Some(wl) = deployment.get(&name) else {
                continue;
            };
            if wl.state() == Some(ResultState::Deleted) {
                continue;
            }
            let wl = deployment.with_id(wl);
            let result = self.remove(&wl).await;
            self.record(&mut deployment, wl.id, result);
        }

        if let Err(e) = self.store.delete(key.twin, key.contract) {
            error!(%key, error = %e, "failed to delete deployment");
            return;
        }
        self.forget(key);
    }

    /// Deprovision and describe the outcome as a result.
    async fn remove(&self, wl: &WorkloadWithId) -> WorkloadResult {
        match self.provisioner.deprovision(wl).await {
            Ok(()) => {
                debug!(id = %wl.id, "workload deprovisioned");
                WorkloadResult::deleted()
            }
            Err(e) => {
                warn!(id = %wl.id, error = %e, "failed to deprovision workload");
                WorkloadResult::error(format!("failed to deprovision: {e}"))
            }
        }
    }

    // ── Pause / resume ─────────────────────────────────────────────

    async fn transition(&self, key: DeploymentKey, pause: bool) {
        let action = if pause { "pause" } else { "resume" };
        let mut deployment = match self.store.get(key.twin, key.contract) {
            Ok(deployment) => deployment,
            Err(e) => {
                warn!(%key, action, error = %e, "cannot load deployment");
                return;
            }
        };

        for name in deployment.provision_order() {
            let Some(wl) = deployment.get(&name) else {
                continue;
            };
            // A paused sharable workload would give up its name.
            if wl.kind.is_sharable() {
                continue;
            }
            let wl = deployment.with_id(wl);
            let outcome = if pause {
                self.provisioner.pause(&wl).await
            } else {
                self.provisioner.resume(&wl).await
            };
            match outcome {
                Ok(result) => self.record(&mut deployment, wl.id, result),
                Err(ProvisionError::InvalidTransition { state, .. }) => {
                    debug!(id = %wl.id, action, ?state, "skipping workload");
                }
                Err(e) => warn!(id = %wl.id, action, error = %e, "transition failed"),
            }
        }
    }

    // ── Bookkeeping ────────────────────────────────────────────────

    /// Attach `result`, persist the deployment and report.
    fn record(&self, deployment: &mut Deployment, id: WorkloadId, result: WorkloadResult) {
        if let Some(wl) = deployment.get_mut(&id.name) {
            wl.result = Some(result.clone());
        }
        if let Err(e) = self.store.set(deployment) {
            error!(%id, error = %e, "failed to persist workload result");
        }
        self.feedback.report(id, result);
    }

    fn report_all(&self, deployment: &Deployment, message: &str) {
        for wl in &deployment.workloads {
            let id = deployment.with_id(wl).id;
            self.feedback.report(id, WorkloadResult::error(message));
        }
    }

    fn remember(&self, key: DeploymentKey, expires_at: u64) {
        let Some(cache) = &self.cache else {
            return;
        };
        let record = CachedReservation {
            key,
            expires_at,
            to_delete: false,
        };
        if let Err(e) = cache.put(&record) {
            warn!(%key, error = %e, "failed to cache reservation");
        }
    }

    fn forget(&self, key: DeploymentKey) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove(key) {
                warn!(%key, error = %e, "failed to drop cached reservation");
            }
        }
    }
}

fn is_same(old: &Workload, new: Option<&Workload>) -> bool {
    new.is_some_and(|new| old.kind == new.kind && old.data == new.data)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use gridnode_types::WorkloadType;

    use super::*;
    use crate::manager::{Manager, Registration, Response, Updater};
    use crate::provisioner::MapProvisioner;
    use crate::sources;

    /// Manager recording calls in a shared log.
    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
        existing: Vec<String>,
    }

    #[async_trait]
    impl Manager for Recorder {
        async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
            self.log.lock().unwrap().push(format!("+{}", wl.name));
            if self.existing.contains(&wl.name) {
                return Ok(Response::NoActionNeeded);
            }
            if wl.data.get("fail").is_some() {
                anyhow::bail!("refused");
            }
            Ok(Response::Ok(json!({"name": wl.name})))
        }

        async fn deprovision(&self, wl: &WorkloadWithId) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(format!("-{}", wl.name));
            Ok(())
        }
    }

    #[async_trait]
    impl Updater for Recorder {
        async fn update(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
            self.log.lock().unwrap().push(format!("~{}", wl.name));
            Ok(Response::Ok(json!({"name": wl.name, "updated": true})))
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        engine: Engine,
        cache: ReservationCache,
        log: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(existing: &[&str]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = DeploymentStore::open(dir.path()).unwrap();
        let cache = ReservationCache::open_in_memory().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let recorder = Arc::new(Recorder {
            log: log.clone(),
            existing: existing.iter().map(|s| s.to_string()).collect(),
        });
        let mut provisioner = MapProvisioner::default();
        for kind in WorkloadType::ALL {
            let registration = if kind == WorkloadType::Zmount {
                Registration::new(recorder.clone()).updater(recorder.clone())
            } else {
                Registration::new(recorder.clone())
            };
            provisioner = provisioner.register(kind, registration);
        }
        let engine = Engine::new(store, Arc::new(provisioner)).with_cache(cache.clone());
        Fixture {
            _dir: dir,
            engine,
            cache,
            log,
        }
    }

    fn deployment(contract: u64, workloads: Vec<Workload>) -> Deployment {
        Deployment {
            twin_id: 1,
            contract_id: contract,
            metadata: String::new(),
            description: String::new(),
            workloads,
        }
    }

    fn deploy(deployment: Deployment) -> ProvisionJob {
        ProvisionJob::Deploy {
            deployment,
            expires_at: Some(u64::MAX),
        }
    }

    fn take_log(f: &Fixture) -> Vec<String> {
        std::mem::take(&mut *f.log.lock().unwrap())
    }

    #[tokio::test]
    async fn install_runs_in_type_order_and_persists_results() {
        let f = fixture(&[]);
        let d = deployment(
            1,
            vec![
                Workload::new("vm", WorkloadType::Zmachine, json!({})),
                Workload::new("net", WorkloadType::Network, json!({})),
                Workload::new("bad", WorkloadType::Container, json!({"fail": true})),
                Workload::new("vol", WorkloadType::Zmount, json!({})),
            ],
        );
        f.engine.handle(deploy(d)).await;

        assert_eq!(take_log(&f), vec!["+net", "+vol", "+bad", "+vm"]);
        let stored = f.engine.store().get(1, 1).unwrap();
        assert_eq!(stored.get("vm").unwrap().state(), Some(ResultState::Ok));
        let bad = stored.get("bad").unwrap().result.clone().unwrap();
        assert_eq!(bad.state, ResultState::Error);
        assert_eq!(bad.error.as_deref(), Some("refused"));
        assert!(f.cache.get(stored.key()).unwrap().is_some());
    }

    #[tokio::test]
    async fn conflicting_network_is_rejected_then_released() {
        let f = fixture(&[]);
        let net = || Workload::new("net", WorkloadType::Network, json!({}));
        f.engine.handle(deploy(deployment(1, vec![net()]))).await;
        f.engine.handle(deploy(deployment(2, vec![net()]))).await;
        assert!(!f.engine.store().exists(1, 2).unwrap());

        f.engine.decommission(DeploymentKey { twin: 1, contract: 1 }).await;
        assert!(!f.engine.store().exists(1, 1).unwrap());
        assert!(f.cache.get(DeploymentKey { twin: 1, contract: 1 }).unwrap().is_none());

        f.engine.handle(deploy(deployment(2, vec![net()]))).await;
        let stored = f.engine.store().get(1, 2).unwrap();
        assert_eq!(stored.get("net").unwrap().state(), Some(ResultState::Ok));
    }

    #[tokio::test]
    async fn update_diffs_workloads() {
        let f = fixture(&[]);
        f.engine
            .handle(deploy(deployment(
                1,
                vec![
                    Workload::new("vol", WorkloadType::Zmount, json!({"size": 1})),
                    Workload::new("c", WorkloadType::Container, json!({"cpu": 1})),
                    Workload::new("gone", WorkloadType::Zdb, json!({})),
                ],
            )))
            .await;
        take_log(&f);

        f.engine
            .handle(deploy(deployment(
                1,
                vec![
                    Workload::new("vol", WorkloadType::Zmount, json!({"size": 2})),
                    Workload::new("c", WorkloadType::Container, json!({"cpu": 2})),
                    Workload::new("new", WorkloadType::Network, json!({})),
                ],
            )))
            .await;

        assert_eq!(take_log(&f), vec!["-gone", "+new", "~vol"]);
        assert_eq!(f.engine.store().shared_owner(1, "new").unwrap(), Some(1));
        let stored = f.engine.store().get(1, 1).unwrap();
        assert!(stored.get("gone").is_none());
        assert_eq!(stored.get("vol").unwrap().data, json!({"size": 2}));
        // Containers cannot be updated: the stored workload is untouched.
        assert_eq!(stored.get("c").unwrap().data, json!({"cpu": 1}));
        assert_eq!(stored.get("c").unwrap().state(), Some(ResultState::Ok));
    }

    #[tokio::test]
    async fn rejected_update_tears_nothing_down() {
        let f = fixture(&[]);
        let net = || Workload::new("net", WorkloadType::Network, json!({}));
        f.engine.handle(deploy(deployment(1, vec![net()]))).await;
        f.engine
            .handle(deploy(deployment(
                2,
                vec![Workload::new("vol", WorkloadType::Zmount, json!({}))],
            )))
            .await;
        take_log(&f);

        // Contract 2 swaps its volume for a network contract 1 already owns.
        f.engine.handle(deploy(deployment(2, vec![net()]))).await;

        assert!(take_log(&f).is_empty());
        let stored = f.engine.store().get(1, 2).unwrap();
        assert_eq!(stored.get("vol").unwrap().state(), Some(ResultState::Ok));
        assert!(stored.get("net").is_none());
        assert_eq!(f.engine.store().shared_owner(1, "net").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn paused_deployment_keeps_its_network() {
        let f = fixture(&[]);
        let net = || Workload::new("net", WorkloadType::Network, json!({}));
        let vm = Workload::new("vm", WorkloadType::Zmachine, json!({}));
        f.engine.handle(deploy(deployment(1, vec![net(), vm]))).await;
        let key = DeploymentKey { twin: 1, contract: 1 };

        f.engine.handle(ProvisionJob::Pause(key)).await;
        let stored = f.engine.store().get(1, 1).unwrap();
        assert_eq!(stored.get("net").unwrap().state(), Some(ResultState::Ok));
        assert_eq!(stored.get("vm").unwrap().state(), Some(ResultState::Paused));

        f.engine.handle(deploy(deployment(2, vec![net()]))).await;
        assert!(!f.engine.store().exists(1, 2).unwrap());

        f.engine.handle(ProvisionJob::Resume(key)).await;
        let stored = f.engine.store().get(1, 1).unwrap();
        assert_eq!(stored.get("vm").unwrap().state(), Some(ResultState::Ok));
        assert_eq!(f.engine.store().shared_owner(1, "net").unwrap(), Some(1));
    }

    #[tokio::test]
    async fn decommission_reverses_order() {
        let f = fixture(&[]);
        f.engine
            .handle(deploy(deployment(
                3,
                vec![
                    Workload::new("net", WorkloadType::Network, json!({})),
                    Workload::new("vm", WorkloadType::Zmachine, json!({})),
                    Workload::new("vol", WorkloadType::Zmount, json!({})),
                ],
            )))
            .await;
        take_log(&f);

        f.engine.decommission(DeploymentKey { twin: 1, contract: 3 }).await;
        assert_eq!(take_log(&f), vec!["-vm", "-vol", "-net"]);
        assert!(f.engine.store().twins().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pause_and_resume_flip_ok_workloads() {
        let f = fixture(&[]);
        f.engine
            .handle(deploy(deployment(
                4,
                vec![
                    Workload::new("vm", WorkloadType::Zmachine, json!({})),
                    Workload::new("bad", WorkloadType::Container, json!({"fail": true})),
                ],
            )))
            .await;

        let key = DeploymentKey { twin: 1, contract: 4 };
        f.engine.handle(ProvisionJob::Pause(key)).await;
        let stored = f.engine.store().get(1, 4).unwrap();
        assert_eq!(stored.get("vm").unwrap().state(), Some(ResultState::Paused));
        assert_eq!(stored.get("bad").unwrap().state(), Some(ResultState::Error));

        f.engine.handle(ProvisionJob::Resume(key)).await;
        let stored = f.engine.store().get(1, 4).unwrap();
        assert_eq!(stored.get("vm").unwrap().state(), Some(ResultState::Ok));
    }

    #[tokio::test]
    async fn boot_keeps_results_of_surviving_resources() {
        let f = fixture(&["vol"]);
        let mut vol = Workload::new("vol", WorkloadType::Zmount, json!({}));
        vol.result = Some(WorkloadResult::ok(json!({"path": "/mnt/vol"})));
        let mut vm = Workload::new("vm", WorkloadType::Zmachine, json!({}));
        vm.result = Some(WorkloadResult::ok(json!({})));
        let mut failed = Workload::new("c", WorkloadType::Container, json!({}));
        failed.result = Some(WorkloadResult::error("old failure"));
        f.engine.store().add(&deployment(5, vec![vol, vm, failed])).unwrap();

        f.engine.boot().await.unwrap();
        assert_eq!(take_log(&f), vec!["+vol", "+vm"]);
        let stored = f.engine.store().get(1, 5).unwrap();
        assert_eq!(stored.get("vol").unwrap().result.as_ref().unwrap().data, json!({"path": "/mnt/vol"}));
        assert_eq!(stored.get("c").unwrap().state(), Some(ResultState::Error));
    }

    #[tokio::test]
    async fn run_stops_when_channels_close() {
        let f = fixture(&[]);
        let (sink, receivers) = sources::channels();
        let (_tx, shutdown) = watch::channel(false);
        let engine = f.engine;
        let store = engine.store().clone();
        let handle = tokio::spawn(engine.run(receivers, shutdown.clone()));

        let mut shutdown_rx = shutdown;
        let d = deployment(6, vec![Workload::new("vol", WorkloadType::Zmount, json!({}))]);
        assert!(sink.provision(deploy(d), &mut shutdown_rx).await);
        for _ in 0..100 {
            if store.exists(1, 6).unwrap() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(store.exists(1, 6).unwrap());
        assert!(
            sink.deprovision(DeploymentKey { twin: 1, contract: 6 }, &mut shutdown_rx)
                .await
        );
        drop(sink);
        handle.await.unwrap();
        assert!(!store.exists(1, 6).unwrap());
    }
}
