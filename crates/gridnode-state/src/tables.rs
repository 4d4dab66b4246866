//! redb table definitions for the reservation cache.
//!
//! Keys are `{twin}-{contract}`, values JSON-serialized
//! [`crate::cache::CachedReservation`] records.

use redb::TableDefinition;

/// Locally known reservations keyed by `{twin}-{contract}`.
pub const RESERVATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("reservations");
