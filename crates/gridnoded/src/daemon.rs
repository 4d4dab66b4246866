//! Node daemon wiring.
//!
//! Startup order:
//! 1. Open the deployment store and the reservation cache
//! 2. Build the managers from the RPC collaborators
//! 3. Boot the engine (initializers, re-provision stored workloads)
//! 4. Recount capacity from the store
//! 5. Spawn sources, engine, janitor and capacity reporter
//! 6. On Ctrl-C, signal shutdown and wait for every task

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use gridnode_janitor::{Janitor, SweepPolicy};
use gridnode_provision::registry::report_capacity_loop;
use gridnode_provision::{
    primitives, sources, AdmissionSource, Counted, Counters, Engine, ExpirySource, Feedback,
    HttpRegistry, Registry, Source,
};
use gridnode_state::{DeploymentStore, ReservationCache};
use gridnode_types::NodeConfig;

use crate::rpc::RpcCollaborators;

pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let node_id = config.node.id.clone();
    info!(node = %node_id, "gridnode daemon starting");
    std::fs::create_dir_all(&config.node.data_dir)?;

    // ── Persistence ────────────────────────────────────────────────
    let store = DeploymentStore::open(&config.deployments_dir())?;
    info!(path = ?config.deployments_dir(), "deployment store opened");
    let cache = ReservationCache::open(&config.cache_path())?;
    info!(path = ?config.cache_path(), "reservation cache opened");

    // ── Collaborators ──────────────────────────────────────────────
    let timeout = config.request_timeout();
    let registry: Arc<dyn Registry> = Arc::new(HttpRegistry::new(&config.registry.url, timeout)?);
    let deps = RpcCollaborators::dependencies(&config.services, &node_id, timeout)?;

    // ── Engine ─────────────────────────────────────────────────────
    let counters = Arc::new(Counters::new());
    let managers = primitives::provisioner(&deps)?;
    info!(kinds = ?managers.kinds(), "workload managers registered");
    let provisioner = Counted::new(managers, counters.clone());
    let engine = Engine::new(store.clone(), Arc::new(provisioner))
        .with_cache(cache.clone())
        .with_feedback(Feedback::new(registry.clone()));

    engine.boot().await?;
    counters.sync(&store)?;
    let units = counters.current_units();
    info!(cru = units.cru, mru = units.mru, sru = units.sru, hru = units.hru, "capacity counted");

    // ── Background tasks ───────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let admission: Arc<dyn Source> = Arc::new(
        AdmissionSource::new(registry.clone(), node_id.clone(), config.poll_interval())
            .with_cache(cache.clone()),
    );
    let expiry: Arc<dyn Source> = Arc::new(ExpirySource::new(cache.clone(), config.expiry_interval()));
    let (receivers, mut handles) = sources::spawn(vec![admission, expiry], &shutdown_rx);

    handles.push(tokio::spawn(engine.run(receivers, shutdown_rx.clone())));

    let janitor = Janitor::new(&deps)?
        .with_cache(cache)
        .with_registry(registry.clone())
        .with_policy(SweepPolicy::from_config(config.janitor.as_ref()));
    handles.push(tokio::spawn(
        janitor.run(config.janitor_interval(), shutdown_rx.clone()),
    ));

    handles.push(tokio::spawn(report_capacity_loop(
        registry,
        counters,
        node_id,
        config.report_interval(),
        shutdown_rx,
    )));

    // ── Shutdown ───────────────────────────────────────────────────
    shutdown_on(tokio::signal::ctrl_c(), shutdown_tx, handles).await?;
    info!("gridnode daemon stopped");
    Ok(())
}

/// Wait for `signal`, then stop every task. Tasks are stopped even when the
/// signal cannot be awaited; that error is returned afterwards.
async fn shutdown_on(
    signal: impl Future<Output = std::io::Result<()>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
) -> std::io::Result<()> {
    let signal = signal.await;
    match &signal {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!(error = %e, "cannot listen for shutdown signal, stopping"),
    }
    let _ = shutdown_tx.send(true);
    join_all(handles).await;
    signal
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_signal_still_stops_tasks() {
        let (tx, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let _ = rx.changed().await;
        });

        let failed = async { Err(std::io::Error::other("no signal handler")) };
        let result = shutdown_on(failed, tx, vec![task]).await;

        assert!(result.is_err());
    }
}
