//! Sources: producers of engine jobs.
//!
//! ```text
//!  AdmissionSource ──(long-poll registry, pipeline)──┐
//!                                                   ├──▶ Sink ──▶ Engine
//!  ExpirySource ────(scan reservation cache)─────────┘
//! ```
//!
//! Each source runs in its own task with its own copy of the [`Sink`]. The
//! engine channels close once every source has returned and dropped its
//! senders.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use gridnode_state::ReservationCache;
use gridnode_types::reservation::NextAction;
use gridnode_types::{epoch_secs, ContractId, Deployment, DeploymentKey, Reservation};

use crate::backoff::Backoff;
use crate::pipeline;
use crate::registry::Registry;

/// Work for the engine's provision channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionJob {
    /// Install, or update when already stored. `expires_at` is recorded in
    /// the reservation cache.
    Deploy {
        deployment: Deployment,
        expires_at: Option<u64>,
    },
    Pause(DeploymentKey),
    Resume(DeploymentKey),
}

/// Sending half of the engine channels.
#[derive(Clone)]
pub struct Sink {
    provision: mpsc::Sender<ProvisionJob>,
    deprovision: mpsc::Sender<DeploymentKey>,
}

/// Receiving half of the engine channels.
pub struct Receivers {
    pub provision: mpsc::Receiver<ProvisionJob>,
    pub deprovision: mpsc::Receiver<DeploymentKey>,
}

/// Engine channels. Capacity 1: a source waits until the engine has taken
/// the previous job.
pub fn channels() -> (Sink, Receivers) {
    let (provision_tx, provision_rx) = mpsc::channel(1);
    let (deprovision_tx, deprovision_rx) = mpsc::channel(1);
    (
        Sink {
            provision: provision_tx,
            deprovision: deprovision_tx,
        },
        Receivers {
            provision: provision_rx,
            deprovision: deprovision_rx,
        },
    )
}

impl Sink {
    /// Queue a provision job. Returns false when the engine is gone or
    /// shutdown was requested while waiting.
    pub async fn provision(&self, job: ProvisionJob, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            sent = self.provision.send(job) => sent.is_ok(),
            _ = shutdown.changed() => false,
        }
    }

    pub async fn deprovision(&self, key: DeploymentKey, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            sent = self.deprovision.send(key) => sent.is_ok(),
            _ = shutdown.changed() => false,
        }
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &'static str;

    /// Produce jobs until shutdown or until the engine goes away.
    async fn run(&self, sink: Sink, shutdown: watch::Receiver<bool>);
}

/// Spawn every source with its own sink. The returned receivers close once
/// all sources have stopped.
pub fn spawn(
    sources: Vec<Arc<dyn Source>>,
    shutdown: &watch::Receiver<bool>,
) -> (Receivers, Vec<JoinHandle<()>>) {
    let (sink, receivers) = channels();
    let handles = sources
        .into_iter()
        .map(|source| {
            let sink = sink.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                info!(source = source.name(), "source started");
                source.run(sink, shutdown).await;
                info!(source = source.name(), "source stopped");
            })
        })
        .collect();
    (receivers, handles)
}

/// Sleep for `duration` unless shutdown arrives first. Returns false on
/// shutdown.
async fn pause_for(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = shutdown.changed() => false,
    }
}

// ── Admission ─────────────────────────────────────────────────────

/// Long-polls the registry for reservations targeting this node.
pub struct AdmissionSource {
    registry: Arc<dyn Registry>,
    node_id: String,
    poll_interval: Duration,
    backoff: Backoff,
    cache: Option<ReservationCache>,
}

impl AdmissionSource {
    pub fn new(registry: Arc<dyn Registry>, node_id: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            registry,
            node_id: node_id.into(),
            poll_interval,
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60), Duration::MAX),
            cache: None,
        }
    }

    /// Flag deleted reservations in `cache` so the expiry source retries a
    /// failed decommission and the janitor sees them as gone.
    pub fn with_cache(mut self, cache: ReservationCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Route one reservation. Returns false when the sink is closed.
    async fn dispatch(
        &self,
        reservation: Reservation,
        sink: &Sink,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let (reservation, _) = pipeline::next(reservation, epoch_secs());
        let id = reservation.id;
        match reservation.next_action {
            NextAction::Deploy => match reservation.deployment_for(&self.node_id) {
                Ok(deployment) if deployment.workloads.is_empty() => {
                    debug!(id, "reservation has nothing for this node");
                    true
                }
                Ok(deployment) => {
                    info!(id, twin = reservation.customer_tid, "reservation admitted");
                    let job = ProvisionJob::Deploy {
                        deployment,
                        expires_at: Some(reservation.data_reservation.expiration_reservation),
                    };
                    sink.provision(job, shutdown).await
                }
                Err(e) => {
                    warn!(id, error = %e, "rejecting malformed reservation");
                    true
                }
            },
            NextAction::Delete | NextAction::Deleted => {
                let key = DeploymentKey {
                    twin: reservation.customer_tid,
                    contract: id,
                };
                info!(id, "reservation deleted");
                if let Some(cache) = &self.cache {
                    if let Err(e) = cache.mark_for_deletion(key) {
                        warn!(%key, error = %e, "failed to flag cached reservation");
                    }
                }
                sink.deprovision(key, shutdown).await
            }
            NextAction::Invalid => {
                debug!(id, "reservation invalid, ignoring");
                true
            }
            pending => {
                debug!(id, action = ?pending, "reservation not ready");
                true
            }
        }
    }
}

#[async_trait]
impl Source for AdmissionSource {
    fn name(&self) -> &'static str {
        "admission"
    }

    async fn run(&self, sink: Sink, mut shutdown: watch::Receiver<bool>) {
        let mut from: ContractId = 0;
        let mut delay = self.backoff.initial;
        let mut routed = Routed::default();

        loop {
            let batch = tokio::select! {
                batch = self.registry.poll(&self.node_id, from) => batch,
                _ = shutdown.changed() => return,
            };
            let batch = match batch {
                Ok(batch) => {
                    delay = self.backoff.initial;
                    batch
                }
                Err(e) => {
                    warn!(node = %self.node_id, error = %e, retry_in = ?delay, "registry poll failed");
                    if !pause_for(delay, &mut shutdown).await {
                        return;
                    }
                    delay = self.backoff.next_interval(delay);
                    continue;
                }
            };

            // Hold the cursor at the oldest reservation still in flight so
            // it is seen again once signed or paid.
            let mut lowest_pending = None;
            let mut highest = None;
            for reservation in batch {
                let id = reservation.id;
                highest = highest.max(Some(id));
                let (advanced, _) = pipeline::next(reservation.clone(), epoch_secs());
                if !advanced.next_action.is_fixed_point() {
                    lowest_pending = Some(lowest_pending.map_or(id, |low: ContractId| low.min(id)));
                }
                if !routed.first_time(id, advanced.next_action) {
                    continue;
                }
                if !self.dispatch(reservation, &sink, &mut shutdown).await {
                    return;
                }
            }
            if let Some(next) = lowest_pending.or(highest.map(|h| h + 1)) {
                from = from.max(next);
            }
            routed.forget_below(from);

            if !pause_for(self.poll_interval, &mut shutdown).await {
                return;
            }
        }
    }
}

/// Reservations already routed at a given stage. Ids below the poll cursor
/// are never returned again, so they are dropped as the cursor moves.
#[derive(Debug, Default)]
struct Routed {
    seen: HashSet<(ContractId, NextAction)>,
}

impl Routed {
    fn first_time(&mut self, id: ContractId, action: NextAction) -> bool {
        self.seen.insert((id, action))
    }

    fn forget_below(&mut self, from: ContractId) {
        self.seen.retain(|(id, _)| *id >= from);
    }
}

// ── Expiry ────────────────────────────────────────────────────────

/// Periodically decommissions cached reservations that expired or were
/// flagged for deletion.
pub struct ExpirySource {
    cache: ReservationCache,
    interval: Duration,
}

impl ExpirySource {
    pub fn new(cache: ReservationCache, interval: Duration) -> Self {
        Self { cache, interval }
    }
}

#[async_trait]
impl Source for ExpirySource {
    fn name(&self) -> &'static str {
        "expiry"
    }

    async fn run(&self, sink: Sink, mut shutdown: watch::Receiver<bool>) {
        loop {
            match self.cache.gone(epoch_secs()) {
                Ok(gone) => {
                    for record in gone {
                        debug!(key = %record.key, "reservation expired");
                        if !sink.deprovision(record.key, &mut shutdown).await {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "failed to scan reservation cache"),
            }
            if !pause_for(self.interval, &mut shutdown).await {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use gridnode_state::CachedReservation;
    use gridnode_types::reservation::{DataReservation, Reserved};
    use gridnode_types::workloads::ZmountData;
    use gridnode_types::{WorkloadId, WorkloadResult};

    use super::*;
    use crate::counters::CapacitySnapshot;

    /// Registry serving one fixed batch, then nothing.
    struct OneShot {
        batch: Mutex<Option<Vec<Reservation>>>,
        polled_from: Mutex<Vec<ContractId>>,
    }

    #[async_trait]
    impl Registry for OneShot {
        async fn poll(&self, _node_id: &str, from: ContractId) -> anyhow::Result<Vec<Reservation>> {
            self.polled_from.lock().unwrap().push(from);
            Ok(self.batch.lock().unwrap().take().unwrap_or_default())
        }

        async fn get(&self, _id: ContractId) -> anyhow::Result<Option<Reservation>> {
            Ok(None)
        }

        async fn report_result(&self, _id: &WorkloadId, _r: &WorkloadResult) -> anyhow::Result<()> {
            Ok(())
        }

        async fn report_capacity(&self, _n: &str, _s: &CapacitySnapshot) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn reservation(id: ContractId, action: NextAction, node: &str) -> Reservation {
        let now = epoch_secs();
        Reservation {
            id,
            customer_tid: 5,
            customer_signature: String::new(),
            data_reservation: DataReservation {
                volumes: vec![Reserved {
                    workload_id: "vol".into(),
                    node_id: node.into(),
                    data: ZmountData { size: 1024 },
                }],
                expiration_provisioning: now + 3600,
                expiration_reservation: now + 7200,
                ..Default::default()
            },
            signing_request_provision: Default::default(),
            signatures_provision: Vec::new(),
            next_action: action,
            epoch: now,
        }
    }

    #[tokio::test]
    async fn admission_routes_deploy_and_delete() {
        let registry = Arc::new(OneShot {
            batch: Mutex::new(Some(vec![
                reservation(10, NextAction::Pay, "node-1"),
                reservation(11, NextAction::Delete, "node-1"),
                reservation(12, NextAction::Deploy, "node-2"),
            ])),
            polled_from: Mutex::new(Vec::new()),
        });
        let source: Arc<dyn Source> = Arc::new(AdmissionSource::new(
            registry.clone(),
            "node-1",
            Duration::from_millis(10),
        ));
        let (tx, rx) = watch::channel(false);
        let (mut receivers, handles) = spawn(vec![source], &rx);

        match receivers.provision.recv().await {
            Some(ProvisionJob::Deploy { deployment, expires_at }) => {
                assert_eq!(deployment.key(), DeploymentKey { twin: 5, contract: 10 });
                assert_eq!(deployment.workloads.len(), 1);
                assert!(expires_at.is_some());
            }
            other => panic!("unexpected job: {other:?}"),
        }
        assert_eq!(
            receivers.deprovision.recv().await,
            Some(DeploymentKey { twin: 5, contract: 11 })
        );

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(receivers.provision.recv().await.is_none());
        let polled = registry.polled_from.lock().unwrap().clone();
        assert_eq!(polled[0], 0);
        assert!(polled[1..].iter().all(|from| *from == 13));
    }

    #[tokio::test]
    async fn deleted_reservation_is_flagged_in_cache() {
        let cache = ReservationCache::open_in_memory().unwrap();
        let key = DeploymentKey { twin: 5, contract: 11 };
        cache
            .put(&CachedReservation { key, expires_at: u64::MAX, to_delete: false })
            .unwrap();
        let registry = Arc::new(OneShot {
            batch: Mutex::new(Some(vec![reservation(11, NextAction::Deleted, "node-1")])),
            polled_from: Mutex::new(Vec::new()),
        });
        let source: Arc<dyn Source> = Arc::new(
            AdmissionSource::new(registry, "node-1", Duration::from_millis(10))
                .with_cache(cache.clone()),
        );
        let (tx, rx) = watch::channel(false);
        let (mut receivers, handles) = spawn(vec![source], &rx);

        assert_eq!(receivers.deprovision.recv().await, Some(key));
        assert!(cache.get(key).unwrap().unwrap().to_delete);
        assert_eq!(cache.gone(0).unwrap().len(), 1);

        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn routed_set_shrinks_with_the_cursor() {
        let mut routed = Routed::default();
        assert!(routed.first_time(3, NextAction::Deploy));
        assert!(!routed.first_time(3, NextAction::Deploy));
        assert!(routed.first_time(3, NextAction::Delete));
        assert!(routed.first_time(9, NextAction::Sign));
        assert!(routed.first_time(12, NextAction::Deploy));

        routed.forget_below(9);

        assert_eq!(routed.seen.len(), 2);
        assert!(!routed.first_time(9, NextAction::Sign));
        assert!(!routed.first_time(12, NextAction::Deploy));
    }

    #[tokio::test]
    async fn expiry_sends_gone_reservations() {
        let cache = ReservationCache::open_in_memory().unwrap();
        let expired = DeploymentKey { twin: 1, contract: 1 };
        cache
            .put(&CachedReservation { key: expired, expires_at: 0, to_delete: false })
            .unwrap();
        cache
            .put(&CachedReservation {
                key: DeploymentKey { twin: 1, contract: 2 },
                expires_at: u64::MAX,
                to_delete: false,
            })
            .unwrap();

        let source: Arc<dyn Source> =
            Arc::new(ExpirySource::new(cache, Duration::from_secs(3600)));
        let (tx, rx) = watch::channel(false);
        let (mut receivers, handles) = spawn(vec![source], &rx);

        assert_eq!(receivers.deprovision.recv().await, Some(expired));
        tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(receivers.deprovision.recv().await.is_none());
    }
}
