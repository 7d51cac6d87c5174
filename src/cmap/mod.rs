//! Concurrent awaitable map: sharded keyed storage with first-waiter
//! rendezvous.
//!
//! The map supports the usual insert-if-absent / overwrite / lookup
//! operations plus [`AwaitMap::get_or_wait`], which lets a consumer reserve a
//! missing key and block until some producer publishes it. Thousands of
//! workers rendezvous this way on pending productions: targets that are not
//! yet parsed, packages that are mid-parse, artifacts still being built.
//!
//! Contention is bounded by sharding: a caller-supplied hash function maps
//! each key to one of N shards (N a power of two) and every shard has its own
//! mutex around a Robin-Hood open-addressed table. No operation ever blocks
//! while holding a shard lock; waiters receive an [`Arc<WaitGate>`] and block
//! on it only after the lock is released.
//!
//! Once a key has been produced it is permanent for the process lifetime.

pub mod table;
pub mod wait;

use parking_lot::Mutex;
use std::sync::Arc;

use table::RobinTable;
pub use wait::WaitGate;

/// Default shard count for the big maps (targets, packages).
pub const LARGE_SHARD_COUNT: usize = 256;
/// Default shard count for small auxiliary maps.
pub const SMALL_SHARD_COUNT: usize = 4;

/// Hash supplier. Supplied at construction so each operation computes the
/// hash exactly once, outside any lock.
pub type HashFn<K> = fn(&K) -> u64;

/// A keyed entry is either produced or reserved by one or more waiters.
enum EntryState<V> {
    /// Waiters exist but no value has been produced yet.
    Reserved(Arc<WaitGate>),
    /// The value has been produced; permanent from here on.
    Present(V),
}

/// Sharded concurrent map with awaitable inserts.
pub struct AwaitMap<K, V> {
    shards: Box<[Mutex<RobinTable<K, EntryState<V>>>]>,
    shard_mask: u64,
    hash: HashFn<K>,
}

impl<K: Eq + Clone, V: Clone> AwaitMap<K, V> {
    /// Creates a map with `shard_count` shards (must be a power of two).
    #[must_use]
    pub fn new(shard_count: usize, hash: HashFn<K>) -> Self {
        assert!(
            shard_count.is_power_of_two(),
            "shard count must be a power of two, got {shard_count}"
        );
        let shards = (0..shard_count)
            .map(|_| Mutex::new(RobinTable::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            shards,
            shard_mask: shard_count as u64 - 1,
            hash,
        }
    }

    /// Creates a map with the default large shard count.
    #[must_use]
    pub fn large(hash: HashFn<K>) -> Self {
        Self::new(LARGE_SHARD_COUNT, hash)
    }

    /// Creates a map with the default small shard count.
    #[must_use]
    pub fn small(hash: HashFn<K>) -> Self {
        Self::new(SMALL_SHARD_COUNT, hash)
    }

    fn shard(&self, hash: u64) -> &Mutex<RobinTable<K, EntryState<V>>> {
        &self.shards[(hash & self.shard_mask) as usize]
    }

    /// Inserts `key → value` only if the key has not been produced yet.
    /// Returns whether this call produced the key. Pending waiters are
    /// released either way the reservation resolves.
    pub fn add(&self, key: K, value: V) -> bool {
        let hash = (self.hash)(&key);
        let mut shard = self.shard(hash).lock();
        let gate = match shard.get_mut(hash, &key) {
            Some(EntryState::Present(_)) => return false,
            Some(entry @ EntryState::Reserved(_)) => {
                let EntryState::Reserved(gate) =
                    std::mem::replace(entry, EntryState::Present(value))
                else {
                    unreachable!()
                };
                Some(gate)
            }
            None => {
                shard.insert(hash, key, EntryState::Present(value));
                None
            }
        };
        drop(shard);
        if let Some(gate) = gate {
            gate.release();
        }
        true
    }

    /// Unconditional assignment. Overwrites a produced value and resolves a
    /// reservation, releasing its waiters.
    pub fn set(&self, key: K, value: V) {
        let hash = (self.hash)(&key);
        let mut shard = self.shard(hash).lock();
        let gate = match shard.insert(hash, key, EntryState::Present(value)) {
            Some(EntryState::Reserved(gate)) => Some(gate),
            _ => None,
        };
        drop(shard);
        if let Some(gate) = gate {
            gate.release();
        }
    }

    /// Returns the produced value for `key`, if any. Reservations read as
    /// absent.
    pub fn get(&self, key: &K) -> Option<V> {
        let hash = (self.hash)(key);
        let shard = self.shard(hash).lock();
        match shard.get(hash, key) {
            Some(EntryState::Present(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Returns the produced value, or a gate to wait on until a producer
    /// publishes the key. The `bool` is true iff this call created the
    /// reservation; exactly one caller per reservation window observes it.
    ///
    /// The shard lock is released before returning; callers block on the gate
    /// (if any) and then re-query to obtain the value.
    pub fn get_or_wait(&self, key: &K) -> (Option<V>, Option<Arc<WaitGate>>, bool) {
        let hash = (self.hash)(key);
        let mut shard = self.shard(hash).lock();
        match shard.get(hash, key) {
            Some(EntryState::Present(value)) => (Some(value.clone()), None, false),
            Some(EntryState::Reserved(gate)) => (None, Some(Arc::clone(gate)), false),
            None => {
                let gate = Arc::new(WaitGate::new());
                shard.insert(hash, key.clone(), EntryState::Reserved(Arc::clone(&gate)));
                (None, Some(gate), true)
            }
        }
    }

    /// Blocks until `key` is produced and returns its value.
    pub fn wait(&self, key: &K) -> V {
        loop {
            let (value, gate, _) = self.get_or_wait(key);
            if let Some(value) = value {
                return value;
            }
            if let Some(gate) = gate {
                gate.wait();
            }
        }
    }

    /// Snapshot of all produced values, in no particular order.
    /// Reserved entries are excluded.
    pub fn values(&self) -> Vec<V> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            out.extend(shard.values().filter_map(|entry| match entry {
                EntryState::Present(value) => Some(value.clone()),
                EntryState::Reserved(_) => None,
            }));
        }
        out
    }

    /// Number of produced keys.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|entry| matches!(entry, EntryState::Present(_)))
                    .count()
            })
            .sum()
    }

    /// Returns true if no key has been produced.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A concurrent set with first-insert-wins semantics, built on the map.
pub struct KeySet<K> {
    inner: AwaitMap<K, ()>,
}

impl<K: Eq + Clone> KeySet<K> {
    /// Creates a set with the given shard count.
    #[must_use]
    pub fn new(shard_count: usize, hash: HashFn<K>) -> Self {
        Self {
            inner: AwaitMap::new(shard_count, hash),
        }
    }

    /// Inserts `key`; returns true iff this call inserted it.
    pub fn add(&self, key: K) -> bool {
        self.inner.add(key, ())
    }

    /// Returns true if the key has been inserted.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.get(key).is_some()
    }

    /// Number of inserted keys.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Keyed completion signals: "this name is now built".
pub struct NotifyMap<K> {
    inner: AwaitMap<K, ()>,
}

impl<K: Eq + Clone> NotifyMap<K> {
    /// Creates a notify map with the given shard count.
    #[must_use]
    pub fn new(shard_count: usize, hash: HashFn<K>) -> Self {
        Self {
            inner: AwaitMap::new(shard_count, hash),
        }
    }

    /// Marks `key` complete, waking all waiters. Idempotent.
    pub fn notify(&self, key: K) {
        self.inner.set(key, ());
    }

    /// Returns true if `key` has completed.
    pub fn is_done(&self, key: &K) -> bool {
        self.inner.get(key).is_some()
    }

    /// Blocks until `key` completes.
    pub fn wait(&self, key: &K) {
        self.inner.wait(key);
    }
}
