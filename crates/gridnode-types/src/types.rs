//! Deployment and workload model shared across gridnode crates.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{TypesError, TypesResult};

/// Tenant identity owning deployments.
pub type TwinId = u32;

/// External agreement identifying a deployment.
pub type ContractId = u64;

// ── Workload type ─────────────────────────────────────────────────

/// Kind of resource a workload describes.
///
/// The declaration order is the provisioning order: networks first so that
/// machines can join them, compute last. Deprovisioning walks it backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadType {
    Network,
    Zmount,
    Zdb,
    Container,
    Zmachine,
    Kubernetes,
}

impl WorkloadType {
    /// All known types in provisioning order.
    pub const ALL: [WorkloadType; 6] = [
        WorkloadType::Network,
        WorkloadType::Zmount,
        WorkloadType::Zdb,
        WorkloadType::Container,
        WorkloadType::Zmachine,
        WorkloadType::Kubernetes,
    ];

    /// Whether other deployments of the same twin may reference an instance
    /// of this type by name.
    pub fn is_sharable(&self) -> bool {
        matches!(self, WorkloadType::Network)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Network => "network",
            WorkloadType::Zmount => "zmount",
            WorkloadType::Zdb => "zdb",
            WorkloadType::Container => "container",
            WorkloadType::Zmachine => "zmachine",
            WorkloadType::Kubernetes => "kubernetes",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Result ────────────────────────────────────────────────────────

/// Outcome state of the last operation on a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Ok,
    Error,
    Deleted,
    Paused,
    Unchanged,
}

impl ResultState {
    /// Ok and Paused are the stable states a workload lives in.
    pub fn is_stable(&self) -> bool {
        matches!(self, ResultState::Ok | ResultState::Paused)
    }
}

/// Result attached to a workload after the provisioner touched it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub state: ResultState,
    /// Type specific output (IPs, ports, generated passwords…).
    #[serde(default)]
    pub data: serde_json::Value,
    /// Human readable error, set when `state` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Unix timestamp (seconds) of the operation.
    pub created: u64,
}

impl WorkloadResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self::with_state(ResultState::Ok, data, None)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::with_state(ResultState::Error, serde_json::Value::Null, Some(message.into()))
    }

    pub fn deleted() -> Self {
        Self::with_state(ResultState::Deleted, serde_json::Value::Null, None)
    }

    pub fn with_state(
        state: ResultState,
        data: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            state,
            data,
            error,
            created: epoch_secs(),
        }
    }
}

// ── Workload ──────────────────────────────────────────────────────

/// One declarative resource request inside a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: WorkloadType,
    /// Opaque per-type payload, decoded by the type's manager.
    pub data: serde_json::Value,
    #[serde(default)]
    pub result: Option<WorkloadResult>,
}

impl Workload {
    pub fn new(name: impl Into<String>, kind: WorkloadType, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            kind,
            data,
            result: None,
        }
    }

    /// Decode the payload into its typed form.
    pub fn payload<T: DeserializeOwned>(&self) -> TypesResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| TypesError::Payload {
            name: self.name.clone(),
            kind: self.kind,
            reason: e.to_string(),
        })
    }

    pub fn state(&self) -> Option<ResultState> {
        self.result.as_ref().map(|r| r.state)
    }

    /// True when the result is unset or `Ok`, which is what makes a sharable
    /// workload hold its name.
    pub fn claims_name(&self) -> bool {
        matches!(self.state(), None | Some(ResultState::Ok))
    }

    pub fn is_ok(&self) -> bool {
        self.state() == Some(ResultState::Ok)
    }
}

/// Globally unique workload identity: `{twin}-{contract}-{name}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadId {
    pub twin: TwinId,
    pub contract: ContractId,
    pub name: String,
}

impl WorkloadId {
    pub fn new(twin: TwinId, contract: ContractId, name: impl Into<String>) -> Self {
        Self {
            twin,
            contract,
            name: name.into(),
        }
    }

    /// Parse the rendered form. Workload names may themselves contain `-`.
    pub fn parse(s: &str) -> TypesResult<Self> {
        let invalid = || TypesError::InvalidWorkloadId(s.to_string());
        let mut parts = s.splitn(3, '-');
        let twin = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let contract = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;
        let name = parts.next().filter(|n| !n.is_empty()).ok_or_else(invalid)?;
        Ok(Self::new(twin, contract, name))
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.twin, self.contract, self.name)
    }
}

/// A workload together with its global id, as handed to managers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadWithId {
    pub id: WorkloadId,
    pub workload: Workload,
}

impl WorkloadWithId {
    pub fn new(twin: TwinId, contract: ContractId, workload: Workload) -> Self {
        Self {
            id: WorkloadId::new(twin, contract, workload.name.clone()),
            workload,
        }
    }
}

impl std::ops::Deref for WorkloadWithId {
    type Target = Workload;

    fn deref(&self) -> &Self::Target {
        &self.workload
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// Key of a deployment in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeploymentKey {
    pub twin: TwinId,
    pub contract: ContractId,
}

impl fmt::Display for DeploymentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.twin, self.contract)
    }
}

/// A set of workloads owned by one twin under one contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub twin_id: TwinId,
    pub contract_id: ContractId,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub description: String,
    pub workloads: Vec<Workload>,
}

impl Deployment {
    pub fn key(&self) -> DeploymentKey {
        DeploymentKey {
            twin: self.twin_id,
            contract: self.contract_id,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Workload> {
        self.workloads.iter().find(|w| w.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Workload> {
        self.workloads.iter_mut().find(|w| w.name == name)
    }

    pub fn with_id(&self, workload: &Workload) -> WorkloadWithId {
        WorkloadWithId::new(self.twin_id, self.contract_id, workload.clone())
    }

    /// Names of sharable workloads that currently claim their name.
    pub fn claimed_names(&self) -> impl Iterator<Item = &str> {
        self.workloads
            .iter()
            .filter(|w| w.kind.is_sharable() && w.claims_name())
            .map(|w| w.name.as_str())
    }

    /// Workload names in provisioning order (by type, then declaration).
    pub fn provision_order(&self) -> Vec<String> {
        let mut ordered: Vec<&Workload> = self.workloads.iter().collect();
        ordered.sort_by_key(|w| w.kind);
        ordered.into_iter().map(|w| w.name.clone()).collect()
    }

    /// Reverse of [`Deployment::provision_order`].
    pub fn deprovision_order(&self) -> Vec<String> {
        let mut names = self.provision_order();
        names.reverse();
        names
    }

    /// Structural checks run before the deployment is accepted.
    pub fn validate(&self) -> TypesResult<()> {
        let mut seen = std::collections::HashSet::new();
        for wl in &self.workloads {
            if wl.name.is_empty() {
                return Err(TypesError::InvalidDeployment("workload with empty name".into()));
            }
            // Names become path components of claim files.
            if wl.name.contains('/') || wl.name == "." || wl.name == ".." {
                return Err(TypesError::InvalidDeployment(format!(
                    "workload name '{}' is not a valid file name",
                    wl.name
                )));
            }
            if !seen.insert(wl.name.as_str()) {
                return Err(TypesError::InvalidDeployment(format!(
                    "duplicate workload name '{}'",
                    wl.name
                )));
            }
        }
        Ok(())
    }
}

/// Current Unix epoch in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
