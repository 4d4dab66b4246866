//! ReservationCache — redb-backed record of reservations provisioned here.
//!
//! The engine records every deployment it installed from a reservation along
//! with its expiry. The expiry source scans it for decommission candidates
//! and the janitor consults it before asking the registry.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use gridnode_types::DeploymentKey;

use crate::error::{StateError, StateResult};
use crate::tables::RESERVATIONS;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// What the node remembers about a reservation it provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedReservation {
    pub key: DeploymentKey,
    /// Unix timestamp (seconds) after which the deployment must go.
    pub expires_at: u64,
    /// Set when the registry asked for deletion before expiry.
    pub to_delete: bool,
}

impl CachedReservation {
    pub fn table_key(&self) -> String {
        table_key(self.key)
    }

    /// Whether the deployment should be decommissioned at `now`.
    pub fn is_gone(&self, now: u64) -> bool {
        self.to_delete || now >= self.expires_at
    }
}

fn table_key(key: DeploymentKey) -> String {
    format!("{}-{}", key.twin, key.contract)
}

/// Thread-safe reservation cache.
#[derive(Clone)]
pub struct ReservationCache {
    db: Arc<Database>,
}

impl ReservationCache {
    /// Open (or create) a persistent cache at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let cache = Self { db: Arc::new(db) };
        cache.ensure_tables()?;
        debug!(?path, "reservation cache opened");
        Ok(cache)
    }

    /// Create an ephemeral in-memory cache (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let cache = Self { db: Arc::new(db) };
        cache.ensure_tables()?;
        Ok(cache)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or update a reservation record.
    pub fn put(&self, record: &CachedReservation) -> StateResult<()> {
        let key = record.table_key();
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, expires_at = record.expires_at, "reservation cached");
        Ok(())
    }

    pub fn get(&self, key: DeploymentKey) -> StateResult<Option<CachedReservation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        match table.get(table_key(key).as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Flag a cached reservation for deletion. Returns false if unknown.
    pub fn mark_for_deletion(&self, key: DeploymentKey) -> StateResult<bool> {
        match self.get(key)? {
            Some(mut record) => {
                record.to_delete = true;
                self.put(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a record. Returns true if it existed.
    pub fn remove(&self, key: DeploymentKey) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
            existed = table
                .remove(table_key(key).as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    pub fn list(&self) -> StateResult<Vec<CachedReservation>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESERVATIONS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: CachedReservation =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Records that are expired or flagged at `now`.
    pub fn gone(&self, now: u64) -> StateResult<Vec<CachedReservation>> {
        Ok(self.list()?.into_iter().filter(|r| r.is_gone(now)).collect())
    }
}
