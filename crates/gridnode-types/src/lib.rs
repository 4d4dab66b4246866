//! gridnode-types — model shared by every gridnode crate.
//!
//! Deployments group workloads owned by a twin under a contract. Each
//! workload carries an opaque JSON payload decoded per type (see
//! [`workloads`]) and the [`WorkloadResult`] of the last operation.
//! Reservations ([`reservation`]) are the admission objects that turn into
//! deployments once signed and paid.

pub mod config;
pub mod error;
pub mod flist;
pub mod reservation;
pub mod types;
pub mod units;
pub mod workloads;

pub use config::NodeConfig;
pub use error::{TypesError, TypesResult};
pub use flist::FlistSource;
pub use reservation::{NextAction, Reservation};
pub use types::*;
pub use units::{DiskType, Units, GIB, KIB, MIB};
