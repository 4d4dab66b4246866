//! Counters interceptor around a provisioner.

use std::sync::Arc;

use async_trait::async_trait;

use gridnode_types::{ResultState, Workload, WorkloadResult, WorkloadWithId};

use crate::counters::Counters;
use crate::error::{ProvisionError, ProvisionResult};
use crate::provisioner::Provision;

/// Wraps a [`Provision`] and keeps [`Counters`] in step with it.
///
/// A workload is counted while it holds resources: from the provision that
/// returned `Ok` until its deprovision succeeds. Pausing keeps the
/// resources reserved, so pause and resume do not touch the counters.
pub struct Counted<P> {
    inner: P,
    counters: Arc<Counters>,
}

impl<P: Provision> Counted<P> {
    pub fn new(inner: P, counters: Arc<Counters>) -> Self {
        Self { inner, counters }
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }
}

/// Whether a stored workload is currently accounted for.
fn holds_capacity(wl: &Workload) -> bool {
    wl.state().is_some_and(|s| s.is_stable())
}

#[async_trait]
impl<P: Provision> Provision for Counted<P> {
    async fn initialize(&self) -> ProvisionResult<()> {
        self.inner.initialize().await
    }

    async fn provision(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult> {
        match self.inner.provision(wl).await {
            Ok(result) => {
                if result.state == ResultState::Ok {
                    self.counters.increment(wl);
                }
                Ok(result)
            }
            // A resource found already in place on first sight is adopted
            // by the engine as Ok.
            Err(ProvisionError::NoActionNeeded) => {
                if wl.result.is_none() {
                    self.counters.increment(wl);
                }
                Err(ProvisionError::NoActionNeeded)
            }
            Err(e) => Err(e),
        }
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> ProvisionResult<()> {
        self.inner.deprovision(wl).await?;
        if holds_capacity(wl) {
            self.counters.decrement(wl);
        }
        Ok(())
    }

    async fn update(
        &self,
        wl: &WorkloadWithId,
        previous: &Workload,
    ) -> ProvisionResult<WorkloadResult> {
        let result = self.inner.update(wl, previous).await?;
        if result.state == ResultState::Ok {
            if holds_capacity(previous) {
                self.counters.decrement(previous);
            }
            self.counters.increment(wl);
        }
        Ok(result)
    }

    async fn pause(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult> {
        self.inner.pause(wl).await
    }

    async fn resume(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult> {
        self.inner.resume(wl).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use gridnode_types::{Units, WorkloadType, GIB, MIB};

    use super::*;
    use crate::manager::{Manager, Registration, Response, Updater};
    use crate::provisioner::MapProvisioner;

    struct Echo;

    #[async_trait]
    impl Manager for Echo {
        async fn provision(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
            if wl.name == "broken" {
                anyhow::bail!("cannot start");
            }
            Ok(Response::Ok(json!({"id": wl.id.to_string()})))
        }

        async fn deprovision(&self, _wl: &WorkloadWithId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Updater for Echo {
        async fn update(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
            self.provision(wl).await
        }
    }

    fn counted() -> Counted<MapProvisioner> {
        let echo = Arc::new(Echo);
        let provisioner = MapProvisioner::default()
            .register(WorkloadType::Container, Registration::new(echo.clone()).updater(echo));
        Counted::new(provisioner, Arc::new(Counters::new()))
    }

    fn container(name: &str, memory: u64) -> WorkloadWithId {
        WorkloadWithId::new(
            7,
            3,
            Workload::new(
                name,
                WorkloadType::Container,
                json!({
                    "flist": "https://hub.example.com/u/app.flist",
                    "cpu": 2,
                    "memory": memory,
                    "disk_size": 256 * MIB,
                }),
            ),
        )
    }

    #[tokio::test]
    async fn provision_and_deprovision_round_trip_counters() {
        let provisioner = counted();
        let mut wl = container("c1", GIB);

        let result = provisioner.provision(&wl).await.unwrap();
        assert_eq!(result.state, ResultState::Ok);
        assert_eq!(
            provisioner.counters().current_units(),
            Units { cru: 2, mru: GIB, sru: 256 * MIB, hru: 0 }
        );

        wl.workload.result = Some(result);
        provisioner.deprovision(&wl).await.unwrap();
        assert!(provisioner.counters().current_units().is_zero());
    }

    #[tokio::test]
    async fn failed_provision_is_not_counted() {
        let provisioner = counted();
        let result = provisioner.provision(&container("broken", GIB)).await.unwrap();
        assert_eq!(result.state, ResultState::Error);
        assert!(provisioner.counters().current_units().is_zero());
        assert_eq!(provisioner.counters().current_workloads()[&WorkloadType::Container], 0);
    }

    #[tokio::test]
    async fn update_swaps_footprint() {
        let provisioner = counted();
        let mut old = container("c1", GIB);
        old.workload.result = Some(provisioner.provision(&old).await.unwrap());

        let new = container("c1", 2 * GIB);
        let result = provisioner.update(&new, &old.workload).await.unwrap();
        assert_eq!(result.state, ResultState::Ok);
        assert_eq!(provisioner.counters().current_units().mru, 2 * GIB);
        assert_eq!(provisioner.counters().current_workloads()[&WorkloadType::Container], 1);
    }

    #[tokio::test]
    async fn pause_keeps_counters() {
        let provisioner = counted();
        let mut wl = container("c1", GIB);
        wl.workload.result = Some(provisioner.provision(&wl).await.unwrap());

        let paused = provisioner.pause(&wl).await.unwrap();
        assert_eq!(paused.state, ResultState::Paused);
        assert_eq!(provisioner.counters().current_units().mru, GIB);
    }
}
