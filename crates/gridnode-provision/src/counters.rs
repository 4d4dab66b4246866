//! Capacity counters.
//!
//! Lock-free totals of the resource units and workload counts consumed by
//! provisioned workloads. Only the [`Counted`](crate::interceptor::Counted)
//! interceptor and [`Counters::sync`] change them; managers never do.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use gridnode_state::{DeploymentStore, StateResult};
use gridnode_types::{Units, Workload, WorkloadType};

/// Point-in-time copy of the counters, as reported to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacitySnapshot {
    pub units: Units,
    pub workloads: BTreeMap<WorkloadType, u64>,
}

#[derive(Debug, Default)]
pub struct Counters {
    cru: AtomicU64,
    mru: AtomicU64,
    sru: AtomicU64,
    hru: AtomicU64,
    workloads: [AtomicU64; WorkloadType::ALL.len()],
}

fn slot(kind: WorkloadType) -> usize {
    kind as usize
}

/// Add `value`, saturating at `u64::MAX`.
fn add_saturating(counter: &AtomicU64, value: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_add(value))
    });
}

/// Subtract `value`, clamping at zero.
fn sub_clamped(counter: &AtomicU64, value: u64) {
    let mut current = counter.load(Ordering::Acquire);
    loop {
        let next = current.saturating_sub(value);
        match counter.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for a workload that became live.
    pub fn increment(&self, wl: &Workload) {
        let units = self.units_of(wl);
        add_saturating(&self.cru, units.cru);
        add_saturating(&self.mru, units.mru);
        add_saturating(&self.sru, units.sru);
        add_saturating(&self.hru, units.hru);
        add_saturating(&self.workloads[slot(wl.kind)], 1);
    }

    /// Release a workload's footprint. Never drops below zero.
    pub fn decrement(&self, wl: &Workload) {
        let units = self.units_of(wl);
        sub_clamped(&self.cru, units.cru);
        sub_clamped(&self.mru, units.mru);
        sub_clamped(&self.sru, units.sru);
        sub_clamped(&self.hru, units.hru);
        sub_clamped(&self.workloads[slot(wl.kind)], 1);
    }

    fn units_of(&self, wl: &Workload) -> Units {
        match wl.capacity() {
            Ok(units) => units,
            Err(e) => {
                warn!(name = %wl.name, kind = %wl.kind, error = %e, "cannot size workload");
                Units::ZERO
            }
        }
    }

    pub fn current_units(&self) -> Units {
        Units {
            cru: self.cru.load(Ordering::Acquire),
            mru: self.mru.load(Ordering::Acquire),
            sru: self.sru.load(Ordering::Acquire),
            hru: self.hru.load(Ordering::Acquire),
        }
    }

    pub fn current_workloads(&self) -> BTreeMap<WorkloadType, u64> {
        WorkloadType::ALL
            .iter()
            .map(|kind| (*kind, self.workloads[slot(*kind)].load(Ordering::Acquire)))
            .collect()
    }

    pub fn snapshot(&self) -> CapacitySnapshot {
        CapacitySnapshot {
            units: self.current_units(),
            workloads: self.current_workloads(),
        }
    }

    pub fn reset(&self) {
        for counter in [&self.cru, &self.mru, &self.sru, &self.hru] {
            counter.store(0, Ordering::Release);
        }
        for counter in &self.workloads {
            counter.store(0, Ordering::Release);
        }
    }

    /// Rebuild the counters from every `Ok` workload in the store.
    ///
    /// Networks span deployments of the same twin, so each (twin, name)
    /// counts once.
    pub fn sync(&self, store: &DeploymentStore) -> StateResult<()> {
        self.reset();
        let mut networks = HashSet::new();
        for deployment in store.deployments()? {
            for wl in deployment.workloads.iter().filter(|wl| wl.is_ok()) {
                if wl.kind == WorkloadType::Network
                    && !networks.insert((deployment.twin_id, wl.name.clone()))
                {
                    continue;
                }
                self.increment(wl);
            }
        }
        let units = self.current_units();
        debug!(cru = units.cru, mru = units.mru, sru = units.sru, hru = units.hru, "counters synced");
        Ok(())
    }
}
