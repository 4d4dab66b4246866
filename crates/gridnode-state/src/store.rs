//! DeploymentStore — filesystem-backed, versioned deployment persistence.
//!
//! Layout under the store root:
//!
//! ```text
//! {root}/{twin}/{contract}      versioned deployment document
//! {root}/shared/{twin}/{name}   claim on a sharable workload name
//! ```
//!
//! A single `RwLock` guards the shared index and serializes every write, so
//! a document and the claims it implies always change together.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use gridnode_types::{ContractId, Deployment, DeploymentKey, TwinId, Units};

use crate::error::{StateError, StateResult};
use crate::shared::{parse_name, SharedIndex};
use crate::versioned;

/// Thread-safe deployment store.
#[derive(Clone)]
pub struct DeploymentStore {
    root: PathBuf,
    index: Arc<RwLock<SharedIndex>>,
}

impl DeploymentStore {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: &Path) -> StateResult<Self> {
        fs::create_dir_all(root).map_err(|e| StateError::io(root, e))?;
        let index = SharedIndex::load(root)?;
        debug!(root = %root.display(), "deployment store opened");
        Ok(Self {
            root: root.to_path_buf(),
            index: Arc::new(RwLock::new(index)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Persist a new deployment.
    ///
    /// Fails with `DeploymentExists` if (twin, contract) is already stored and
    /// with `DeploymentConflict` if another contract of the twin claims one of
    /// the deployment's sharable names.
    pub fn add(&self, deployment: &Deployment) -> StateResult<()> {
        deployment.validate()?;
        let mut index = self.write()?;
        let key = deployment.key();
        let path = self.document_path(key);
        if path.exists() {
            return Err(StateError::DeploymentExists {
                twin: key.twin,
                contract: key.contract,
            });
        }

        for name in deployment.claimed_names() {
            if let Some(owner) = index.owner(key.twin, name) {
                if owner != key.contract {
                    return Err(conflict(key.twin, name, owner));
                }
            }
        }

        self.write_document(&path, deployment)?;
        for name in deployment.claimed_names() {
            index.link(key.twin, name, key.contract)?;
        }

        debug!(%key, workloads = deployment.workloads.len(), "deployment added");
        Ok(())
    }

    /// Replace an existing deployment and relink its shared claims.
    pub fn set(&self, deployment: &Deployment) -> StateResult<()> {
        deployment.validate()?;
        let mut index = self.write()?;
        let key = deployment.key();
        let path = self.document_path(key);
        if !path.exists() {
            return Err(StateError::DeploymentNotExists {
                twin: key.twin,
                contract: key.contract,
            });
        }

        let (taken, this) = index.partition(key.twin, key.contract);
        let claimed: HashSet<String> = deployment.claimed_names().map(str::to_string).collect();
        if let Some(name) = claimed.iter().find(|n| taken.contains(*n)) {
            let owner = index.owner(key.twin, name).unwrap_or_default();
            return Err(conflict(key.twin, name, owner));
        }

        self.write_document(&path, deployment)?;

        for name in this.difference(&claimed) {
            index.unlink(key.twin, name)?;
        }
        for name in claimed.difference(&this) {
            index.link(key.twin, name, key.contract)?;
        }

        debug!(%key, "deployment updated");
        Ok(())
    }

    /// Remove a deployment and every claim it holds.
    pub fn delete(&self, twin: TwinId, contract: ContractId) -> StateResult<()> {
        let mut index = self.write()?;
        let key = DeploymentKey { twin, contract };
        let path = self.document_path(key);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::DeploymentNotExists { twin, contract });
            }
            Err(e) => return Err(StateError::io(&path, e)),
        }

        for name in index.owned_by(twin, contract) {
            index.unlink(twin, &name)?;
        }

        // Drop the twin directory once its last deployment is gone.
        let twin_dir = self.root.join(twin.to_string());
        if let Ok(mut entries) = fs::read_dir(&twin_dir) {
            if entries.next().is_none() {
                let _ = fs::remove_dir(&twin_dir);
            }
        }

        debug!(%key, "deployment deleted");
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Load a deployment.
    pub fn get(&self, twin: TwinId, contract: ContractId) -> StateResult<Deployment> {
        let _guard = self.read()?;
        self.read_document(DeploymentKey { twin, contract })
    }

    pub fn exists(&self, twin: TwinId, contract: ContractId) -> StateResult<bool> {
        let _guard = self.read()?;
        Ok(self.document_path(DeploymentKey { twin, contract }).exists())
    }

    /// Contract ids stored for a twin, ascending.
    pub fn by_twin(&self, twin: TwinId) -> StateResult<Vec<ContractId>> {
        let _guard = self.read()?;
        self.contracts_of(twin)
    }

    /// Every twin with at least one stored deployment, ascending.
    pub fn twins(&self) -> StateResult<Vec<TwinId>> {
        let _guard = self.read()?;
        self.twins_unlocked()
    }

    /// Owner contract of a sharable name, if claimed.
    pub fn shared_owner(&self, twin: TwinId, name: &str) -> StateResult<Option<ContractId>> {
        Ok(self.read()?.owner(twin, name))
    }

    /// Every stored deployment. Full scan.
    pub fn deployments(&self) -> StateResult<Vec<Deployment>> {
        let _guard = self.read()?;
        let mut out = Vec::new();
        for twin in self.twins_unlocked()? {
            for contract in self.contracts_of(twin)? {
                out.push(self.read_document(DeploymentKey { twin, contract })?);
            }
        }
        Ok(out)
    }

    /// Capacity declared by every `Ok` workload of every deployment.
    ///
    /// Full scan; meant for infrequent polling.
    pub fn capacity(&self) -> StateResult<Units> {
        let mut total = Units::ZERO;
        for deployment in self.deployments()? {
            for wl in deployment.workloads.iter().filter(|w| w.is_ok()) {
                match wl.capacity() {
                    Ok(units) => total += units,
                    Err(e) => warn!(
                        key = %deployment.key(),
                        workload = %wl.name,
                        error = %e,
                        "skipping workload with unreadable capacity"
                    ),
                }
            }
        }
        Ok(total)
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn read(&self) -> StateResult<RwLockReadGuard<'_, SharedIndex>> {
        self.index.read().map_err(|_| StateError::Lock)
    }

    fn write(&self) -> StateResult<RwLockWriteGuard<'_, SharedIndex>> {
        self.index.write().map_err(|_| StateError::Lock)
    }

    fn document_path(&self, key: DeploymentKey) -> PathBuf {
        self.root
            .join(key.twin.to_string())
            .join(key.contract.to_string())
    }

    fn read_document(&self, key: DeploymentKey) -> StateResult<Deployment> {
        let path = self.document_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::DeploymentNotExists {
                    twin: key.twin,
                    contract: key.contract,
                });
            }
            Err(e) => return Err(StateError::io(&path, e)),
        };
        let (_, deployment) = versioned::decode(&bytes)?;
        Ok(deployment)
    }

    /// Write through a temp file so readers never see a torn document.
    fn write_document(&self, path: &Path, deployment: &Deployment) -> StateResult<()> {
        let bytes = versioned::encode(&versioned::current(), deployment)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).map_err(|e| StateError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| StateError::io(path, e))?;
        Ok(())
    }

    fn twins_unlocked(&self) -> StateResult<Vec<TwinId>> {
        let mut twins = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| StateError::io(&self.root, e))? {
            let entry = entry.map_err(|e| StateError::io(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(twin) = parse_name::<TwinId>(&entry.path()) {
                twins.push(twin);
            }
        }
        twins.sort_unstable();
        Ok(twins)
    }

    fn contracts_of(&self, twin: TwinId) -> StateResult<Vec<ContractId>> {
        let dir = self.root.join(twin.to_string());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateError::io(&dir, e)),
        };
        let mut contracts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StateError::io(&dir, e))?;
            if let Some(contract) = parse_name::<ContractId>(&entry.path()) {
                contracts.push(contract);
            }
        }
        contracts.sort_unstable();
        Ok(contracts)
    }
}

fn conflict(twin: TwinId, name: &str, owner: ContractId) -> StateError {
    StateError::DeploymentConflict {
        twin,
        name: name.to_string(),
        owner,
    }
}
