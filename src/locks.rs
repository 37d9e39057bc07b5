//! Sharded mutual exclusion keyed by replaceable key or event id.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use parking_lot::{Mutex, MutexGuard};

/// Fixed table of mutexes; a key always maps to the same shard.
///
/// Writers to the same key serialize on one shard while unrelated keys
/// usually land on different shards and proceed in parallel.
#[derive(Debug)]
pub struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(shards: usize) -> Self {
        let shards = shards.max(1);
        Self {
            shards: (0..shards).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Block until the shard owning `key` is free and hold it for the guard's lifetime.
    pub fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.shards[self.shard_of(key)].lock()
    }

    fn shard_of<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}
