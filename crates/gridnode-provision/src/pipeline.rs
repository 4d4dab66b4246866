//! Reservation pipeline: where a reservation goes next.
//!
//! ```text
//!   Create ──▶ Sign ──(quorum)──▶ Pay ──▶ Deploy
//!     │          │                 │
//!     │          └──────┬──────────┘
//!     ▼                 ▼ (expired)
//!  Invalid            Delete
//! ```
//!
//! `Deploy`, `Delete`, `Deleted` and `Invalid` are fixed points. The
//! pipeline is a pure function of the reservation and the clock.

use std::collections::HashSet;

use tracing::debug;

use gridnode_types::reservation::NextAction;
use gridnode_types::{epoch_secs, Reservation};

/// Advance `r` until it stops moving. Returns the reservation and whether
/// its next action changed.
pub fn next(mut r: Reservation, now: u64) -> (Reservation, bool) {
    let start = r.next_action;
    loop {
        let action = step(&r, now);
        if action == r.next_action {
            break;
        }
        debug!(id = r.id, from = ?r.next_action, to = ?action, "reservation advanced");
        r.next_action = action;
    }
    let changed = r.next_action != start;
    (r, changed)
}

fn step(r: &Reservation, now: u64) -> NextAction {
    let action = r.next_action;
    if action.is_fixed_point() {
        return action;
    }
    if r.expired(now) {
        return NextAction::Delete;
    }
    match action {
        NextAction::Create if r.provisioning_expired(now) => NextAction::Invalid,
        NextAction::Create => NextAction::Sign,
        NextAction::Sign if quorum_reached(r) => NextAction::Pay,
        NextAction::Pay => NextAction::Deploy,
        other => other,
    }
}

/// Count signatures from distinct requested signers against the quorum.
pub fn quorum_reached(r: &Reservation) -> bool {
    let request = &r.signing_request_provision;
    let signed: HashSet<_> = r
        .signatures_provision
        .iter()
        .map(|s| s.tid)
        .filter(|tid| request.signers.contains(tid))
        .collect();
    signed.len() as u64 >= u64::from(request.quorum_min)
}

/// Wall-clock front end to [`next`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Pipeline;

impl Pipeline {
    pub fn next(&self, r: Reservation) -> (Reservation, bool) {
        next(r, epoch_secs())
    }
}
