//! Single-latest-event-per-key resolution for replaceable kinds.

use crate::event::Event;
use crate::index::Index;

/// Why an incoming event is not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// A newer (or equally new with a smaller id) event holds the key.
    Stale,
    /// The author deleted this id or its replaceable address.
    Deleted,
}

/// Outcome of resolving an incoming event against the current holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    /// Store the incoming event and remove `old_id` in the same commit.
    Supersede(String),
    Reject(RejectReason),
}

/// Decide how `incoming` interacts with what the index currently holds.
///
/// Tombstoned events are rejected first; otherwise non-replaceable kinds are
/// always accepted. The caller must hold the key lock for `incoming` until
/// the decision is committed.
pub fn resolve(incoming: &Event, index: &Index) -> Decision {
    if index.is_denied(incoming) {
        return Decision::Reject(RejectReason::Deleted);
    }
    let Some(key) = incoming.replaceable_key() else {
        return Decision::Accept;
    };
    let Some(holder) = index
        .lookup_replaceable(&key)
        .and_then(|id| index.get(id))
    else {
        return Decision::Accept;
    };
    if holder.id == incoming.id {
        // Exact resubmission; the store reports it as a duplicate.
        return Decision::Accept;
    }
    if incoming.supersedes(holder) {
        Decision::Supersede(holder.id.clone())
    } else {
        Decision::Reject(RejectReason::Stale)
    }
}
