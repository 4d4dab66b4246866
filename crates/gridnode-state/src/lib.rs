//! gridnode-state — persistence for the gridnode provisioning engine.
//!
//! Two stores live here:
//!
//! - [`DeploymentStore`]: the authoritative record of deployments, one
//!   versioned JSON document per (twin, contract) on the filesystem, plus the
//!   shared-workload index that keeps sharable names unique per twin.
//! - [`ReservationCache`]: a [redb](https://docs.rs/redb) table of the
//!   reservations this node provisioned, with their expiry, used by the
//!   expiry source and the janitor.
//!
//! Both are `Clone` + `Send` + `Sync` and can be shared across async tasks.

pub mod cache;
pub mod error;
mod shared;
pub mod store;
pub mod tables;
pub mod versioned;

pub use cache::{CachedReservation, ReservationCache};
pub use error::{StateError, StateResult};
pub use store::DeploymentStore;
