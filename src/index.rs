//! In-memory orderings over the stored event set.
//!
//! Payloads live once, in the by-id map, behind `Arc`. Every other ordering
//! holds only ids or [`TimeKey`]s, so an update never has to touch more than
//! one copy of an event.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, HashMap, HashSet},
    ops::Bound,
    sync::Arc,
};

use crate::event::{Event, ReplaceableKey};
use crate::filter::{Filter, Plan, UntilBound};

/// Position of an event in result order: `created_at` desc, then `id` asc.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeKey {
    created_at: Reverse<u64>,
    id: String,
}

impl TimeKey {
    pub fn new(created_at: u64, id: impl Into<String>) -> Self {
        Self {
            created_at: Reverse(created_at),
            id: id.into(),
        }
    }

    pub fn of(ev: &Event) -> Self {
        Self::new(ev.created_at, ev.id.clone())
    }

    pub fn created_at(&self) -> u64 {
        self.created_at.0
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Every ordering the query planner can use, plus the deletion deny-lists.
#[derive(Debug, Default)]
pub struct Index {
    events: HashMap<String, Arc<Event>>,
    by_time: BTreeSet<TimeKey>,
    by_tag: HashMap<(String, String), BTreeSet<TimeKey>>,
    by_replaceable: HashMap<ReplaceableKey, String>,
    deleted_ids: HashSet<(String, String)>,
    deleted_addresses: HashMap<ReplaceableKey, u64>,
}

/// Tag pairs worth indexing: single-letter names with a value.
fn indexed_tags(ev: &Event) -> impl Iterator<Item = (String, String)> + '_ {
    ev.tags.iter().filter_map(|t| {
        let name = t.name()?;
        let value = t.value()?;
        (name.chars().count() == 1).then(|| (name.to_string(), value.to_string()))
    })
}

impl Index {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Event>> {
        self.events.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    /// Insert an event into every ordering. Returns `false` if the id was
    /// already present, in which case nothing changes.
    ///
    /// The replaceable-key slot is overwritten unconditionally; deciding who
    /// may hold it is the resolver's job.
    pub fn put(&mut self, ev: Arc<Event>) -> bool {
        if self.events.contains_key(&ev.id) {
            return false;
        }
        let tk = TimeKey::of(&ev);
        for pair in indexed_tags(&ev) {
            self.by_tag.entry(pair).or_default().insert(tk.clone());
        }
        if let Some(key) = ev.replaceable_key() {
            self.by_replaceable.insert(key, ev.id.clone());
        }
        self.by_time.insert(tk);
        self.events.insert(ev.id.clone(), ev);
        true
    }

    /// Remove an event from every ordering. Absent ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Event>> {
        let ev = self.events.remove(id)?;
        let tk = TimeKey::of(&ev);
        self.by_time.remove(&tk);
        for pair in indexed_tags(&ev) {
            if let Some(set) = self.by_tag.get_mut(&pair) {
                set.remove(&tk);
                if set.is_empty() {
                    self.by_tag.remove(&pair);
                }
            }
        }
        if let Some(key) = ev.replaceable_key() {
            if self.by_replaceable.get(&key).map(String::as_str) == Some(id) {
                self.by_replaceable.remove(&key);
            }
        }
        Some(ev)
    }

    /// Time keys with `since <= created_at <= until_max`, newest first.
    pub fn scan_by_time(
        &self,
        since: Option<u64>,
        until_max: Option<u64>,
    ) -> impl Iterator<Item = &TimeKey> + '_ {
        time_range(&self.by_time, since, until_max)
    }

    /// Time keys of events carrying the tag `[name, value, ...]`.
    pub fn lookup_by_tag(&self, name: &str, value: &str) -> Option<&BTreeSet<TimeKey>> {
        self.by_tag.get(&(name.to_string(), value.to_string()))
    }

    /// Current holder of a replaceable key.
    pub fn lookup_replaceable(&self, key: &ReplaceableKey) -> Option<&str> {
        self.by_replaceable.get(key).map(String::as_str)
    }

    /// Record that `pubkey` deleted `id`.
    pub fn deny_id(&mut self, pubkey: &str, id: &str) -> bool {
        self.deleted_ids.insert((pubkey.to_string(), id.to_string()))
    }

    pub fn is_id_denied(&self, pubkey: &str, id: &str) -> bool {
        self.deleted_ids
            .contains(&(pubkey.to_string(), id.to_string()))
    }

    /// Record that everything at `key` up to `created_at` was deleted.
    pub fn deny_address(&mut self, key: ReplaceableKey, created_at: u64) {
        let entry = self.deleted_addresses.entry(key).or_insert(created_at);
        *entry = (*entry).max(created_at);
    }

    pub fn address_tombstone(&self, key: &ReplaceableKey) -> Option<u64> {
        self.deleted_addresses.get(key).copied()
    }

    /// Whether `ev` was deleted by its author, by id or by address.
    pub fn is_denied(&self, ev: &Event) -> bool {
        if self.is_id_denied(&ev.pubkey, &ev.id) {
            return true;
        }
        ev.replaceable_key()
            .and_then(|key| self.address_tombstone(&key))
            .is_some_and(|until| ev.created_at <= until)
    }

    pub fn denied_id_count(&self) -> usize {
        self.deleted_ids.len()
    }

    /// Visit events matching `filter` in result order, honoring `limit`.
    ///
    /// Runs entirely under the caller's borrow, so the visited set is a
    /// consistent snapshot.
    pub fn select(&self, filter: &Filter, bound: UntilBound, mut visit: impl FnMut(&Arc<Event>)) {
        let limit = filter.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return;
        }
        let until_max = match (filter.until, bound) {
            (Some(0), UntilBound::Exclusive) => return,
            (Some(u), UntilBound::Exclusive) => Some(u - 1),
            (Some(u), UntilBound::Inclusive) => Some(u),
            (None, _) => None,
        };
        let mut emitted = 0;
        let mut emit = |ev: &Arc<Event>| -> bool {
            if filter.matches_bounded(ev, bound) {
                visit(ev);
                emitted += 1;
            }
            emitted < limit
        };
        match filter.plan() {
            Plan::Ids(ids) => {
                let keys: BTreeSet<TimeKey> = ids
                    .iter()
                    .filter_map(|id| self.events.get(id))
                    .map(|ev| TimeKey::of(ev))
                    .collect();
                self.emit_keys(keys.iter(), &mut emit);
            }
            Plan::Replaceable(rkeys) => {
                let keys: BTreeSet<TimeKey> = rkeys
                    .iter()
                    .filter_map(|k| self.by_replaceable.get(k))
                    .filter_map(|id| self.events.get(id))
                    .map(|ev| TimeKey::of(ev))
                    .collect();
                self.emit_keys(keys.iter(), &mut emit);
            }
            Plan::Tag { name, values } => {
                // Union of posting lists restricted to the time window.
                let mut keys: BTreeSet<&TimeKey> = BTreeSet::new();
                for value in &values {
                    if let Some(set) = self.lookup_by_tag(&name, value) {
                        keys.extend(time_range(set, filter.since, until_max));
                    }
                }
                self.emit_keys(keys.into_iter(), &mut emit);
            }
            Plan::Scan => {
                self.emit_keys(self.scan_by_time(filter.since, until_max), &mut emit);
            }
        }
    }

    fn emit_keys<'a>(
        &self,
        keys: impl Iterator<Item = &'a TimeKey>,
        emit: &mut impl FnMut(&Arc<Event>) -> bool,
    ) {
        for tk in keys {
            if let Some(ev) = self.events.get(&tk.id) {
                if !emit(ev) {
                    break;
                }
            }
        }
    }
}

fn time_range(
    set: &BTreeSet<TimeKey>,
    since: Option<u64>,
    until_max: Option<u64>,
) -> impl Iterator<Item = &TimeKey> + '_ {
    let start = match until_max {
        Some(max) => Bound::Included(TimeKey::new(max, String::new())),
        None => Bound::Unbounded,
    };
    let since = since.unwrap_or(0);
    set.range((start, Bound::Unbounded))
        .take_while(move |tk| tk.created_at() >= since)
}
