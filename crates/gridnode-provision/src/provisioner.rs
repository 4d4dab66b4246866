//! Type dispatch from workloads to their managers.
//!
//! [`MapProvisioner`] owns the `WorkloadType → Registration` table, built
//! once at construction, and turns manager responses into workload results.
//! Manager failures become `Error` results here; only dispatch problems and
//! `NoActionNeeded` come back as `Err`.

use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, info};

use gridnode_types::{ResultState, Workload, WorkloadResult, WorkloadType, WorkloadWithId};

use crate::error::{ProvisionError, ProvisionResult};
use crate::manager::{Registration, Response};

/// Lifecycle operations the engine drives.
#[async_trait]
pub trait Provision: Send + Sync {
    /// Run every registered initializer once. The first failure aborts.
    async fn initialize(&self) -> ProvisionResult<()>;

    async fn provision(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult>;

    async fn deprovision(&self, wl: &WorkloadWithId) -> ProvisionResult<()>;

    /// Apply `wl` over `previous`, the stored version of the same workload.
    async fn update(&self, wl: &WorkloadWithId, previous: &Workload)
        -> ProvisionResult<WorkloadResult>;

    async fn pause(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult>;

    async fn resume(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult>;
}

#[derive(Clone, Default)]
pub struct MapProvisioner {
    managers: HashMap<WorkloadType, Registration>,
}

impl MapProvisioner {
    pub fn new(managers: HashMap<WorkloadType, Registration>) -> Self {
        Self { managers }
    }

    pub fn register(mut self, kind: WorkloadType, registration: Registration) -> Self {
        self.managers.insert(kind, registration);
        self
    }

    pub fn kinds(&self) -> Vec<WorkloadType> {
        let mut kinds: Vec<_> = self.managers.keys().copied().collect();
        kinds.sort();
        kinds
    }

    fn registration(&self, kind: WorkloadType) -> ProvisionResult<&Registration> {
        self.managers
            .get(&kind)
            .ok_or(ProvisionError::UnknownWorkloadType(kind))
    }
}

/// Convert a manager response into the workload's new result.
fn build_result(response: anyhow::Result<Response>) -> ProvisionResult<WorkloadResult> {
    match response {
        Ok(Response::Ok(data)) => Ok(WorkloadResult::ok(data)),
        Ok(Response::Declared { state, message }) => Ok(WorkloadResult::with_state(
            state.into(),
            serde_json::Value::Null,
            message,
        )),
        Ok(Response::NoActionNeeded) => Err(ProvisionError::NoActionNeeded),
        Err(e) => Ok(WorkloadResult::error(format!("{e:#}"))),
    }
}

/// Result for a pause or resume, keeping the data of the previous result.
fn transition(wl: &Workload, outcome: anyhow::Result<()>, target: ResultState) -> WorkloadResult {
    let data = wl
        .result
        .as_ref()
        .map(|r| r.data.clone())
        .unwrap_or_default();
    match outcome {
        Ok(()) => WorkloadResult::with_state(target, data, None),
        Err(e) => WorkloadResult::with_state(ResultState::Error, data, Some(format!("{e:#}"))),
    }
}

#[async_trait]
impl Provision for MapProvisioner {
    async fn initialize(&self) -> ProvisionResult<()> {
        for (kind, registration) in &self.managers {
            if let Some(initializer) = &registration.initializer {
                initializer
                    .initialize()
                    .await
                    .map_err(|source| ProvisionError::Initialize { kind: *kind, source })?;
                info!(%kind, "manager initialized");
            }
        }
        Ok(())
    }

    async fn provision(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult> {
        let registration = self.registration(wl.kind)?;
        debug!(id = %wl.id, kind = %wl.kind, "provisioning workload");
        build_result(registration.manager.provision(wl).await)
    }

    async fn deprovision(&self, wl: &WorkloadWithId) -> ProvisionResult<()> {
        let registration = self.registration(wl.kind)?;
        debug!(id = %wl.id, kind = %wl.kind, "deprovisioning workload");
        registration
            .manager
            .deprovision(wl)
            .await
            .map_err(ProvisionError::Manager)
    }

    async fn update(
        &self,
        wl: &WorkloadWithId,
        previous: &Workload,
    ) -> ProvisionResult<WorkloadResult> {
        let registration = self.registration(wl.kind)?;
        let updater = registration
            .updater
            .as_ref()
            .ok_or(ProvisionError::UpdateNotSupported(wl.kind))?;
        debug!(id = %wl.id, kind = %wl.kind, previous = ?previous.state(), "updating workload");
        build_result(updater.update(wl).await)
    }

    async fn pause(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult> {
        let registration = self.registration(wl.kind)?;
        if wl.state() != Some(ResultState::Ok) {
            return Err(ProvisionError::InvalidTransition {
                action: "pause",
                state: wl.state(),
            });
        }
        let outcome = match &registration.pauser {
            Some(pauser) => pauser.pause(wl).await,
            None => Ok(()),
        };
        Ok(transition(wl, outcome, ResultState::Paused))
    }

    async fn resume(&self, wl: &WorkloadWithId) -> ProvisionResult<WorkloadResult> {
        let registration = self.registration(wl.kind)?;
        if wl.state() != Some(ResultState::Paused) {
            return Err(ProvisionError::InvalidTransition {
                action: "resume",
                state: wl.state(),
            });
        }
        let outcome = match &registration.pauser {
            Some(pauser) => pauser.resume(wl).await,
            None => Ok(()),
        };
        Ok(transition(wl, outcome, ResultState::Ok))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::manager::{DeclaredState, Initializer, Manager, Pauser, Updater};

    /// Manager answering with a canned response, or failing.
    struct Canned {
        response: Option<Response>,
        paused: AtomicUsize,
    }

    impl Canned {
        fn ok(data: serde_json::Value) -> Arc<Self> {
            Arc::new(Self {
                response: Some(Response::Ok(data)),
                paused: AtomicUsize::new(0),
            })
        }

        fn with(response: Option<Response>) -> Arc<Self> {
            Arc::new(Self {
                response,
                paused: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Manager for Canned {
        async fn provision(&self, _wl: &WorkloadWithId) -> anyhow::Result<Response> {
            self.response
                .clone()
                .ok_or_else(|| anyhow::anyhow!("disk on fire"))
        }

        async fn deprovision(&self, _wl: &WorkloadWithId) -> anyhow::Result<()> {
            match self.response {
                Some(_) => Ok(()),
                None => anyhow::bail!("still on fire"),
            }
        }
    }

    #[async_trait]
    impl Updater for Canned {
        async fn update(&self, wl: &WorkloadWithId) -> anyhow::Result<Response> {
            self.provision(wl).await
        }
    }

    #[async_trait]
    impl Pauser for Canned {
        async fn pause(&self, _wl: &WorkloadWithId) -> anyhow::Result<()> {
            self.paused.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn resume(&self, _wl: &WorkloadWithId) -> anyhow::Result<()> {
            self.paused.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingInit;

    #[async_trait]
    impl Initializer for FailingInit {
        async fn initialize(&self) -> anyhow::Result<()> {
            anyhow::bail!("no pool")
        }
    }

    fn workload(kind: WorkloadType) -> WorkloadWithId {
        WorkloadWithId::new(1, 1, Workload::new("w", kind, json!({})))
    }

    fn with_state(kind: WorkloadType, state: ResultState) -> WorkloadWithId {
        let mut wl = workload(kind);
        wl.workload.result = Some(WorkloadResult::with_state(state, json!({"ip": "10.0.0.2"}), None));
        wl
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let provisioner = MapProvisioner::default();
        let err = provisioner.provision(&workload(WorkloadType::Zdb)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::UnknownWorkloadType(WorkloadType::Zdb)));
    }

    #[tokio::test]
    async fn responses_map_to_results() {
        let provisioner = MapProvisioner::default()
            .register(WorkloadType::Zmount, Registration::new(Canned::ok(json!({"path": "/v"}))))
            .register(WorkloadType::Zdb, Registration::new(Canned::with(None)))
            .register(
                WorkloadType::Network,
                Registration::new(Canned::with(Some(Response::Declared {
                    state: DeclaredState::Unchanged,
                    message: Some("same".into()),
                }))),
            )
            .register(
                WorkloadType::Container,
                Registration::new(Canned::with(Some(Response::NoActionNeeded))),
            );

        let ok = provisioner.provision(&workload(WorkloadType::Zmount)).await.unwrap();
        assert_eq!(ok.state, ResultState::Ok);
        assert_eq!(ok.data, json!({"path": "/v"}));

        let failed = provisioner.provision(&workload(WorkloadType::Zdb)).await.unwrap();
        assert_eq!(failed.state, ResultState::Error);
        assert_eq!(failed.error.as_deref(), Some("disk on fire"));

        let declared = provisioner.provision(&workload(WorkloadType::Network)).await.unwrap();
        assert_eq!(declared.state, ResultState::Unchanged);
        assert_eq!(declared.error.as_deref(), Some("same"));

        let skipped = provisioner.provision(&workload(WorkloadType::Container)).await;
        assert!(matches!(skipped, Err(ProvisionError::NoActionNeeded)));
    }

    #[tokio::test]
    async fn deprovision_propagates_manager_error() {
        let provisioner = MapProvisioner::default()
            .register(WorkloadType::Zdb, Registration::new(Canned::with(None)));
        let err = provisioner.deprovision(&workload(WorkloadType::Zdb)).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Manager(_)));
        assert_eq!(err.to_string(), "still on fire");
    }

    #[tokio::test]
    async fn update_requires_capability() {
        let manager = Canned::ok(json!({}));
        let provisioner = MapProvisioner::default()
            .register(WorkloadType::Zmount, Registration::new(manager.clone()).updater(manager))
            .register(WorkloadType::Zdb, Registration::new(Canned::ok(json!({}))));

        let previous = workload(WorkloadType::Zmount).workload;
        let updated = provisioner
            .update(&workload(WorkloadType::Zmount), &previous)
            .await
            .unwrap();
        assert_eq!(updated.state, ResultState::Ok);

        let err = provisioner
            .update(&workload(WorkloadType::Zdb), &previous)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("does not support updating"));
    }

    #[tokio::test]
    async fn pause_and_resume_guard_transitions() {
        let manager = Canned::ok(json!({}));
        let provisioner = MapProvisioner::default().register(
            WorkloadType::Zmachine,
            Registration::new(manager.clone()).pauser(manager.clone()),
        );

        let err = provisioner
            .resume(&with_state(WorkloadType::Zmachine, ResultState::Ok))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidTransition { action: "resume", .. }));

        let paused = provisioner
            .pause(&with_state(WorkloadType::Zmachine, ResultState::Ok))
            .await
            .unwrap();
        assert_eq!(paused.state, ResultState::Paused);
        assert_eq!(paused.data, json!({"ip": "10.0.0.2"}));
        assert_eq!(manager.paused.load(Ordering::SeqCst), 1);

        let resumed = provisioner
            .resume(&with_state(WorkloadType::Zmachine, ResultState::Paused))
            .await
            .unwrap();
        assert_eq!(resumed.state, ResultState::Ok);
        assert_eq!(manager.paused.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pause_without_hook_is_synthesized() {
        let provisioner = MapProvisioner::default()
            .register(WorkloadType::Container, Registration::new(Canned::ok(json!({}))));
        let paused = provisioner
            .pause(&with_state(WorkloadType::Container, ResultState::Ok))
            .await
            .unwrap();
        assert_eq!(paused.state, ResultState::Paused);
        assert_eq!(paused.data, json!({"ip": "10.0.0.2"}));
    }

    #[tokio::test]
    async fn failing_initializer_aborts() {
        let provisioner = MapProvisioner::default().register(
            WorkloadType::Zdb,
            Registration::new(Canned::ok(json!({}))).initializer(Arc::new(FailingInit)),
        );
        let err = provisioner.initialize().await.unwrap_err();
        assert!(matches!(err, ProvisionError::Initialize { kind: WorkloadType::Zdb, .. }));
    }
}
