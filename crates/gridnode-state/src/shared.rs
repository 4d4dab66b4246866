//! Shared-workload index: `(twin, name) → contract`.
//!
//! The index lives in memory and is mirrored on disk as one small file per
//! claim at `{root}/shared/{twin}/{name}` holding the owning contract id.
//! The store only touches it while holding its write lock, so memory and
//! disk move together with the deployment document they describe.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use gridnode_types::{ContractId, TwinId};

use crate::error::{StateError, StateResult};

pub(crate) const SHARED_DIR: &str = "shared";

#[derive(Debug, Default)]
pub(crate) struct SharedIndex {
    dir: PathBuf,
    claims: BTreeMap<(TwinId, String), ContractId>,
}

impl SharedIndex {
    /// Load every claim file under `{root}/shared`.
    pub(crate) fn load(root: &Path) -> StateResult<Self> {
        let dir = root.join(SHARED_DIR);
        fs::create_dir_all(&dir).map_err(|e| StateError::io(&dir, e))?;

        let mut claims = BTreeMap::new();
        for twin_entry in fs::read_dir(&dir).map_err(|e| StateError::io(&dir, e))? {
            let twin_entry = twin_entry.map_err(|e| StateError::io(&dir, e))?;
            let Some(twin) = parse_name::<TwinId>(&twin_entry.path()) else {
                continue;
            };
            let twin_dir = twin_entry.path();
            for claim in fs::read_dir(&twin_dir).map_err(|e| StateError::io(&twin_dir, e))? {
                let claim = claim.map_err(|e| StateError::io(&twin_dir, e))?;
                let path = claim.path();
                let content = fs::read_to_string(&path).map_err(|e| StateError::io(&path, e))?;
                match content.trim().parse::<ContractId>() {
                    Ok(contract) => {
                        let name = claim.file_name().to_string_lossy().into_owned();
                        claims.insert((twin, name), contract);
                    }
                    Err(_) => warn!(path = %path.display(), "ignoring malformed shared claim"),
                }
            }
        }

        debug!(claims = claims.len(), "shared index loaded");
        Ok(Self { dir, claims })
    }

    pub(crate) fn owner(&self, twin: TwinId, name: &str) -> Option<ContractId> {
        self.claims.get(&(twin, name.to_string())).copied()
    }

    /// Names claimed by `twin`, split into (other contracts, this contract).
    pub(crate) fn partition(
        &self,
        twin: TwinId,
        contract: ContractId,
    ) -> (HashSet<String>, HashSet<String>) {
        let mut taken = HashSet::new();
        let mut this = HashSet::new();
        for (name, owner) in self.of_twin(twin) {
            if owner == contract {
                this.insert(name.to_string());
            } else {
                taken.insert(name.to_string());
            }
        }
        (taken, this)
    }

    /// Names of every claim held by (twin, contract).
    pub(crate) fn owned_by(&self, twin: TwinId, contract: ContractId) -> Vec<String> {
        self.of_twin(twin)
            .filter(|(_, owner)| *owner == contract)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    fn of_twin(&self, twin: TwinId) -> impl Iterator<Item = (&str, ContractId)> {
        self.claims
            .range((twin, String::new())..)
            .take_while(move |((t, _), _)| *t == twin)
            .map(|((_, name), owner)| (name.as_str(), *owner))
    }

    pub(crate) fn link(&mut self, twin: TwinId, name: &str, contract: ContractId) -> StateResult<()> {
        let twin_dir = self.dir.join(twin.to_string());
        fs::create_dir_all(&twin_dir).map_err(|e| StateError::io(&twin_dir, e))?;
        let path = twin_dir.join(name);
        fs::write(&path, contract.to_string()).map_err(|e| StateError::io(&path, e))?;
        self.claims.insert((twin, name.to_string()), contract);
        debug!(twin, name, contract, "shared name linked");
        Ok(())
    }

    pub(crate) fn unlink(&mut self, twin: TwinId, name: &str) -> StateResult<()> {
        let path = self.dir.join(twin.to_string()).join(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StateError::io(&path, e)),
        }
        self.claims.remove(&(twin, name.to_string()));
        debug!(twin, name, "shared name unlinked");
        Ok(())
    }
}

/// Parse a numeric file name, skipping anything else.
pub(crate) fn parse_name<T: std::str::FromStr>(path: &Path) -> Option<T> {
    path.file_name()?.to_str()?.parse().ok()
}
