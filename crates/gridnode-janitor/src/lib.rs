//! gridnode-janitor — reclaims resources no reservation owns anymore.
//!
//! The provisioning engine cleans up after itself, but a crash between
//! acquiring and recording a resource leaves it behind. The [`Janitor`]
//! periodically walks storage subvolumes and zdb containers, and deletes
//! whatever is neither used by a live container nor backed by a live
//! reservation.

pub mod janitor;
pub mod report;

pub use janitor::{Janitor, SweepPolicy};
pub use report::SweepReport;
