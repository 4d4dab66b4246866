//! Registry client: where reservations come from and results go.
//!
//! [`Registry`] is the boundary; [`HttpRegistry`] speaks JSON over HTTP to
//! the admission service. [`Feedback`] wraps a registry for the engine so
//! that reporting never blocks or fails a provisioning step.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::watch;
use tracing::{debug, warn};

use gridnode_types::{ContractId, Reservation, WorkloadId, WorkloadResult};

use crate::counters::{CapacitySnapshot, Counters};

#[async_trait]
pub trait Registry: Send + Sync {
    /// Reservations assigned to `node_id` with id >= `from`. May block
    /// (long-poll) until something is available.
    async fn poll(&self, node_id: &str, from: ContractId) -> anyhow::Result<Vec<Reservation>>;

    /// A single reservation, `None` if the registry does not know it.
    async fn get(&self, id: ContractId) -> anyhow::Result<Option<Reservation>>;

    async fn report_result(&self, id: &WorkloadId, result: &WorkloadResult) -> anyhow::Result<()>;

    async fn report_capacity(
        &self,
        node_id: &str,
        snapshot: &CapacitySnapshot,
    ) -> anyhow::Result<()>;
}

// ── HTTP ──────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url.trim_end_matches('/'))
    }
}

/// Turn a non-success response into an error carrying the body.
async fn check(response: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!("registry error ({status}): {body}")
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn poll(&self, node_id: &str, from: ContractId) -> anyhow::Result<Vec<Reservation>> {
        let url = self.url(&format!("/nodes/{node_id}/reservations"));
        let response = self
            .client
            .get(url)
            .query(&[("from", from)])
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn get(&self, id: ContractId) -> anyhow::Result<Option<Reservation>> {
        let response = self
            .client
            .get(self.url(&format!("/reservations/{id}")))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response).await?.json().await?))
    }

    async fn report_result(&self, id: &WorkloadId, result: &WorkloadResult) -> anyhow::Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/workloads/{id}/result")))
            .json(result)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn report_capacity(
        &self,
        node_id: &str,
        snapshot: &CapacitySnapshot,
    ) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/nodes/{node_id}/capacity")))
            .json(snapshot)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

// ── Feedback ──────────────────────────────────────────────────────

/// Fire-and-forget result reporting.
#[derive(Clone, Default)]
pub struct Feedback {
    registry: Option<Arc<dyn Registry>>,
}

impl Feedback {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    /// Feedback that drops every report.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Report in the background; failures are logged only.
    pub fn report(&self, id: WorkloadId, result: WorkloadResult) {
        let Some(registry) = self.registry.clone() else {
            return;
        };
        tokio::spawn(async move {
            match registry.report_result(&id, &result).await {
                Ok(()) => debug!(%id, state = ?result.state, "result reported"),
                Err(e) => warn!(%id, error = %e, "failed to report result"),
            }
        });
    }
}

// ── Capacity reporting ────────────────────────────────────────────

/// Periodically push a counters snapshot until shutdown.
pub async fn report_capacity_loop(
    registry: Arc<dyn Registry>,
    counters: Arc<Counters>,
    node_id: String,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let snapshot = counters.snapshot();
        if let Err(e) = registry.report_capacity(&node_id, &snapshot).await {
            warn!(node = %node_id, error = %e, "failed to report capacity");
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                debug!("capacity reporter shutting down");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recording {
        snapshots: Mutex<Vec<CapacitySnapshot>>,
    }

    #[async_trait]
    impl Registry for Recording {
        async fn poll(&self, _node_id: &str, _from: ContractId) -> anyhow::Result<Vec<Reservation>> {
            Ok(Vec::new())
        }

        async fn get(&self, _id: ContractId) -> anyhow::Result<Option<Reservation>> {
            Ok(None)
        }

        async fn report_result(&self, _id: &WorkloadId, _result: &WorkloadResult) -> anyhow::Result<()> {
            Ok(())
        }

        async fn report_capacity(
            &self,
            _node_id: &str,
            snapshot: &CapacitySnapshot,
        ) -> anyhow::Result<()> {
            self.snapshots.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
    }

    #[test]
    fn url_joins_without_double_slash() {
        let registry = HttpRegistry::new("http://registry:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(registry.url("/reservations/4"), "http://registry:8080/reservations/4");
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_loop_reports_until_shutdown() {
        let registry = Arc::new(Recording::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(report_capacity_loop(
            registry.clone(),
            Arc::new(Counters::new()),
            "node-1".into(),
            Duration::from_secs(60),
            rx,
        ));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(registry.snapshots.lock().unwrap().len(), 3);
    }
}
