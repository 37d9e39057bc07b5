//! Event store façade: save, query, count, delete and replace.
//!
//! Writes follow validate → classify → resolve → persist → commit. The
//! commit is a short critical section over the in-memory [`Index`]; the
//! persistence I/O around it runs under a per-key lock only, so writers to
//! unrelated keys do not wait on each other's disk writes.
//!
//! Lock order is key lock, then write gate, then index. Every mutation holds
//! the write gate shared for its whole duration; [`Store::reindex`] holds it
//! exclusively so no acknowledged write can fall between its scan and swap.

use std::{
    ops::ControlFlow,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::Stream;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rand::{seq::SliceRandom, thread_rng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::backend::{Backend, FsBackend, MemoryBackend};
use crate::codec;
use crate::config::DEFAULT_LOCK_SHARDS;
use crate::deletion;
use crate::error::{Error, Result};
use crate::event::{Event, EventClass, ReplaceableKey};
use crate::filter::{Filter, UntilBound};
use crate::index::Index;
use crate::locks::KeyLocks;
use crate::resolver::{self, Decision, RejectReason};

const EVENTS_PREFIX: &str = "events/";
const DELETED_PREFIX: &str = "deleted/";
const DELETED_ADDR_PREFIX: &str = "deleted-addr/";

/// Tuning knobs for a [`Store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Verify Schnorr signatures on save.
    pub verify_sig: bool,
    /// How `until` is compared against `created_at`.
    pub until_bound: UntilBound,
    /// Number of key-lock shards.
    pub lock_shards: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            verify_sig: true,
            until_bound: UntilBound::default(),
            lock_shards: DEFAULT_LOCK_SHARDS,
        }
    }
}

/// What `save_event` did with an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The event is new and now stored.
    Stored,
    /// The exact id was already stored; nothing changed.
    Duplicate,
    /// The event replaced the previous holder of its replaceable key.
    Superseded(String),
    /// A newer event holds the replaceable key; the submission was dropped.
    Stale,
    /// A kind-5 record: the listed ids were tombstoned and the record stored.
    Deleted(Vec<String>),
}

/// Counters reported after rebuilding the index from the backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadStats {
    pub events: usize,
    pub denied_ids: usize,
    pub denied_addresses: usize,
    /// Payloads removed because they were superseded or tombstoned.
    pub healed: usize,
    /// Payloads that could not be decoded and were skipped.
    pub corrupt: usize,
}

/// Persisted form of an address tombstone.
#[derive(Debug, Serialize, Deserialize)]
struct AddressTombstone {
    kind: u16,
    pubkey: String,
    d: Option<String>,
    created_at: u64,
}

/// Shared, cloneable handle to an event store.
#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn Backend>,
    index: RwLock<Index>,
    write_gate: RwLock<()>,
    locks: KeyLocks,
    opts: StoreOptions,
}

impl Inner {
    fn new(backend: Arc<dyn Backend>, opts: StoreOptions) -> Self {
        Self {
            backend,
            index: RwLock::new(Index::new()),
            write_gate: RwLock::new(()),
            locks: KeyLocks::new(opts.lock_shards),
            opts,
        }
    }
}

impl Store {
    /// Open a store over `backend`, rebuilding the index from its contents.
    pub fn open(backend: Arc<dyn Backend>, opts: StoreOptions) -> Result<Self> {
        let store = Self {
            inner: Arc::new(Inner::new(backend, opts)),
        };
        store.reindex()?;
        Ok(store)
    }

    /// Open a store persisted under a directory.
    pub fn open_dir(root: impl Into<std::path::PathBuf>, opts: StoreOptions) -> Result<Self> {
        Self::open(Arc::new(FsBackend::open(root)?), opts)
    }

    /// Create an empty store that lives only in memory.
    pub fn in_memory(opts: StoreOptions) -> Self {
        Self {
            inner: Arc::new(Inner::new(Arc::new(MemoryBackend::new()), opts)),
        }
    }

    pub fn options(&self) -> &StoreOptions {
        &self.inner.opts
    }

    /// Number of events currently visible to queries.
    pub fn len(&self) -> usize {
        self.read_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate, classify and persist an event.
    ///
    /// Stale replaceable submissions and exact duplicates are successful
    /// no-ops. Resubmitting a tombstoned event fails with [`Error::Deleted`].
    pub fn save_event(&self, ev: &Event) -> Result<SaveOutcome> {
        codec::validate(ev, self.inner.opts.verify_sig)?;
        if ev.class() == EventClass::Deletion {
            let removed = self.apply_deletion(ev)?;
            // Keep the deletion record itself so clients can see it.
            self.commit(ev)?;
            return Ok(SaveOutcome::Deleted(removed));
        }
        self.commit(ev)
    }

    /// `save_event` restricted to replaceable and parameterized-replaceable kinds.
    pub fn replace_event(&self, ev: &Event) -> Result<SaveOutcome> {
        if !ev.class().is_replaceable() {
            return Err(Error::NotReplaceable(ev.kind));
        }
        self.save_event(ev)
    }

    /// Apply a kind-5 deletion and return the ids it tombstoned.
    ///
    /// The deletion record itself is not stored; use [`Store::save_event`]
    /// for that.
    pub fn delete_event(&self, ev: &Event) -> Result<Vec<String>> {
        if ev.class() != EventClass::Deletion {
            return Err(Error::NotADeletion(ev.kind));
        }
        codec::validate(ev, self.inner.opts.verify_sig)?;
        self.apply_deletion(ev)
    }

    /// Stream events matching `filter`, newest first, ids ascending on ties.
    ///
    /// The matching set is captured when this is called; later writes do not
    /// affect an open stream. Dropping the stream cancels it.
    pub fn query_events(&self, filter: &Filter) -> EventStream {
        let mut events = Vec::new();
        self.read_index()
            .select(filter, self.inner.opts.until_bound, |ev| events.push(ev.clone()));
        debug!(matched = events.len(), "query");
        EventStream::new(events)
    }

    /// Number of events `query_events(filter)` would yield.
    pub fn count_events(&self, filter: &Filter) -> u64 {
        let mut count = 0u64;
        self.read_index()
            .select(filter, self.inner.opts.until_bound, |_| count += 1);
        debug!(count = count, "count");
        count
    }

    /// Point lookup by id.
    pub fn get_event(&self, id: &str) -> Option<Arc<Event>> {
        self.read_index().get(id).cloned()
    }

    /// Re-validate a random sample of persisted events, signatures included.
    ///
    /// Returns how many events were checked.
    pub fn verify_sample(&self, sample: usize) -> Result<usize> {
        let mut keys = vec![];
        self.inner.backend.scan(EVENTS_PREFIX, &mut |key, _| {
            keys.push(key.to_string());
            Ok(ControlFlow::Continue(()))
        })?;
        keys.shuffle(&mut thread_rng());
        let take = sample.min(keys.len());
        for key in keys.iter().take(take) {
            let data = self.inner.backend.get(key)?.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, format!("{key} vanished"))
            })?;
            let ev = codec::decode(&data)?;
            codec::validate(&ev, true)?;
        }
        Ok(take)
    }

    /// Rebuild every ordering and deny-list from the backend.
    ///
    /// Replaceable events are re-resolved, so a crash between writing a new
    /// holder and removing the old one heals here. Undecodable payloads are
    /// skipped and counted. Writers block until the new index is in place;
    /// queries keep reading the old one meanwhile.
    pub fn reindex(&self) -> Result<LoadStats> {
        let _gate = self.inner.write_gate.write();
        let backend = &self.inner.backend;
        let mut index = Index::new();
        let mut stats = LoadStats::default();

        backend.scan(DELETED_PREFIX, &mut |key, _| {
            let mut parts = key[DELETED_PREFIX.len()..].splitn(2, '/');
            if let (Some(pubkey), Some(id)) = (parts.next(), parts.next()) {
                if index.deny_id(pubkey, id) {
                    stats.denied_ids += 1;
                }
            }
            Ok(ControlFlow::Continue(()))
        })?;

        backend.scan(DELETED_ADDR_PREFIX, &mut |key, data| {
            match serde_json::from_slice::<AddressTombstone>(data) {
                Ok(t) => {
                    let key = ReplaceableKey {
                        pubkey: t.pubkey,
                        kind: t.kind,
                        d: t.d,
                    };
                    if index.address_tombstone(&key).is_none() {
                        stats.denied_addresses += 1;
                    }
                    index.deny_address(key, t.created_at);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable address tombstone"),
            }
            Ok(ControlFlow::Continue(()))
        })?;

        let mut stale_keys = vec![];
        backend.scan(EVENTS_PREFIX, &mut |key, data| {
            let ev = match codec::decode(data) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping undecodable event");
                    stats.corrupt += 1;
                    return Ok(ControlFlow::Continue(()));
                }
            };
            match resolver::resolve(&ev, &index) {
                Decision::Accept => {
                    index.put(Arc::new(ev));
                }
                Decision::Supersede(old) => {
                    index.remove(&old);
                    stale_keys.push(event_key(&old));
                    index.put(Arc::new(ev));
                }
                Decision::Reject(_) => stale_keys.push(key.to_string()),
            }
            Ok(ControlFlow::Continue(()))
        })?;

        for key in &stale_keys {
            backend.delete(key)?;
        }
        stats.healed = stale_keys.len();
        stats.events = index.len();
        *self.write_index() = index;
        info!(
            events = stats.events,
            denied_ids = stats.denied_ids,
            denied_addresses = stats.denied_addresses,
            healed = stats.healed,
            corrupt = stats.corrupt,
            "index rebuilt"
        );
        Ok(stats)
    }

    /// Resolve, persist and commit a validated event under its key lock.
    fn commit(&self, ev: &Event) -> Result<SaveOutcome> {
        let lock_key = ev
            .replaceable_key()
            .map(|k| k.to_string())
            .unwrap_or_else(|| ev.id.clone());
        let _guard = self.inner.locks.lock(&lock_key);
        let _gate = self.inner.write_gate.read();

        let decision = {
            let index = self.read_index();
            if index.contains(&ev.id) {
                debug!(id = %ev.id, "duplicate");
                return Ok(SaveOutcome::Duplicate);
            }
            resolver::resolve(ev, &index)
        };
        match decision {
            Decision::Reject(RejectReason::Stale) => {
                debug!(id = %ev.id, "stale replaceable event dropped");
                return Ok(SaveOutcome::Stale);
            }
            Decision::Reject(RejectReason::Deleted) => {
                return Err(Error::Deleted(ev.id.clone()));
            }
            Decision::Accept | Decision::Supersede(_) => {}
        }

        let key = event_key(&ev.id);
        self.inner.backend.put(&key, &codec::encode(ev)?)?;

        let superseded = {
            let mut index = self.write_index();
            // A deletion may have landed while the payload was being written.
            if index.is_denied(ev) {
                drop(index);
                self.inner.backend.delete(&key)?;
                return Err(Error::Deleted(ev.id.clone()));
            }
            let old = match &decision {
                Decision::Supersede(old_id) => index.remove(old_id),
                _ => None,
            };
            index.put(Arc::new(ev.clone()));
            old
        };

        match superseded {
            Some(old) => {
                self.inner.backend.delete(&event_key(&old.id))?;
                debug!(id = %ev.id, old = %old.id, "superseded");
                Ok(SaveOutcome::Superseded(old.id.clone()))
            }
            None => {
                debug!(id = %ev.id, kind = ev.kind, "stored");
                Ok(SaveOutcome::Stored)
            }
        }
    }

    /// Tombstone targets in the index, then persist the deny entries it
    /// recorded and drop the removed payloads.
    fn apply_deletion(&self, ev: &Event) -> Result<Vec<String>> {
        let refs = deletion::references(ev);
        let _gate = self.inner.write_gate.read();
        let (removed, denied) = {
            let mut index = self.write_index();
            let removed = deletion::apply(ev, &mut index);
            let denied: Vec<&String> = refs
                .ids
                .iter()
                .filter(|id| index.is_id_denied(&ev.pubkey, id))
                .collect();
            (removed, denied)
        };

        let backend = &self.inner.backend;
        for id in denied {
            backend.put(&format!("{DELETED_PREFIX}{}/{id}", ev.pubkey), b"")?;
        }
        for key in &refs.addresses {
            let tombstone = AddressTombstone {
                kind: key.kind,
                pubkey: key.pubkey.clone(),
                d: key.d.clone(),
                created_at: ev.created_at,
            };
            backend.put(
                &address_key(key, ev.created_at),
                &serde_json::to_vec(&tombstone)?,
            )?;
        }
        for victim in &removed {
            backend.delete(&event_key(&victim.id))?;
        }
        let ids: Vec<String> = removed.iter().map(|e| e.id.clone()).collect();
        debug!(deletion = %ev.id, tombstoned = ids.len(), "deletion applied");
        Ok(ids)
    }

    fn read_index(&self) -> RwLockReadGuard<'_, Index> {
        self.inner.index.read()
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, Index> {
        self.inner.index.write()
    }
}

/// Compute the canonical storage key for an event id.
fn event_key(id: &str) -> String {
    let sub1 = id.get(0..2).unwrap_or("__");
    let sub2 = id.get(2..4).unwrap_or("__");
    format!("{EVENTS_PREFIX}{sub1}/{sub2}/{id}.json")
}

/// Storage key for one address tombstone; several may exist per address.
fn address_key(key: &ReplaceableKey, created_at: u64) -> String {
    let digest = hex::encode(Sha256::digest(key.to_string().as_bytes()));
    format!("{DELETED_ADDR_PREFIX}{digest}/{created_at}.json")
}

/// Lazy sequence of query results.
///
/// Poll it as a [`Stream`], or turn it into a plain iterator with
/// [`IntoIterator`]. Dropping it stops delivery and releases the captured
/// snapshot.
#[derive(Debug)]
pub struct EventStream {
    events: std::vec::IntoIter<Arc<Event>>,
}

impl EventStream {
    fn new(events: Vec<Arc<Event>>) -> Self {
        Self {
            events: events.into_iter(),
        }
    }

    /// Results not yet delivered.
    pub fn remaining(&self) -> usize {
        self.events.len()
    }
}

impl IntoIterator for EventStream {
    type Item = Arc<Event>;
    type IntoIter = std::vec::IntoIter<Arc<Event>>;

    fn into_iter(self) -> Self::IntoIter {
        self.events
    }
}

impl Stream for EventStream {
    type Item = Arc<Event>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Poll::Ready(self.get_mut().events.next())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.events.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_shards_by_prefix() {
        let id = "abcd".repeat(16);
        assert_eq!(event_key(&id), format!("events/ab/cd/{id}.json"));
        assert_eq!(event_key("a"), "events/__/__/a.json");
    }

    #[test]
    fn address_keys_differ_by_timestamp() {
        let key = ReplaceableKey::from_address("30023:p:slug").unwrap();
        assert_ne!(address_key(&key, 1), address_key(&key, 2));
        assert!(address_key(&key, 1).starts_with(DELETED_ADDR_PREFIX));
    }

    #[test]
    fn empty_store_answers_queries() {
        let store = Store::in_memory(StoreOptions::default());
        assert!(store.is_empty());
        assert_eq!(store.count_events(&Filter::new()), 0);
        assert_eq!(store.query_events(&Filter::new()).into_iter().count(), 0);
    }
}
