//! Kind-5 deletion requests (NIP-09).
//!
//! A deletion may name events by id (`e` tags) or replaceable addresses
//! (`a` tags). Only the deletion author's own events are affected; foreign
//! references are ignored without error.

use std::sync::Arc;

use tracing::debug;

use crate::codec::is_hex32;
use crate::event::{Event, EventClass, ReplaceableKey};
use crate::index::Index;

/// Targets named by a deletion, restricted to the deletion author.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    pub ids: Vec<String>,
    pub addresses: Vec<ReplaceableKey>,
}

/// Collect the `e` and `a` references of a deletion event.
///
/// Addresses owned by another pubkey are dropped here; id references cannot
/// be checked until the target is known, so they are kept as long as they
/// have the shape of an event id.
pub fn references(deletion: &Event) -> References {
    let mut refs = References::default();
    for id in deletion.tag_values("e").filter(|v| is_hex32(v)) {
        if !refs.ids.iter().any(|known| known == id) {
            refs.ids.push(id.to_string());
        }
    }
    for address in deletion.tag_values("a") {
        match ReplaceableKey::from_address(address) {
            Some(key) if key.pubkey == deletion.pubkey => {
                if !refs.addresses.contains(&key) {
                    refs.addresses.push(key);
                }
            }
            _ => debug!(address = %address, "ignoring foreign or malformed address"),
        }
    }
    refs
}

/// Apply a deletion to the index and return the events it tombstoned.
///
/// Every id reference is recorded in the deny-list under the deletion
/// author, so a same-author event that shows up later is still refused.
/// Address references tombstone the current holder when it is not newer
/// than the deletion, and refuse later submissions up to that timestamp.
/// Deletions never remove other deletions.
pub fn apply(deletion: &Event, index: &mut Index) -> Vec<Arc<Event>> {
    let refs = references(deletion);
    let mut removed = Vec::new();

    for id in &refs.ids {
        let target = index.get(id).cloned();
        match target {
            Some(ev) if ev.class() == EventClass::Deletion => {
                debug!(id = %id, "deleting a deletion has no effect");
                continue;
            }
            Some(ev) if ev.pubkey != deletion.pubkey => {
                debug!(id = %id, "ignoring deletion of another author's event");
                continue;
            }
            Some(_) => {
                if let Some(ev) = index.remove(id) {
                    removed.push(ev);
                }
            }
            None => {}
        }
        index.deny_id(&deletion.pubkey, id);
    }

    for key in refs.addresses {
        let holder = index
            .lookup_replaceable(&key)
            .and_then(|id| index.get(id))
            .filter(|ev| ev.created_at <= deletion.created_at)
            .map(|ev| ev.id.clone());
        if let Some(id) = holder {
            if let Some(ev) = index.remove(&id) {
                removed.push(ev);
            }
        }
        index.deny_address(key, deletion.created_at);
    }

    removed
}
