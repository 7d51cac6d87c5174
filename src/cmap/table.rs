//! Open-addressed hash table with Robin-Hood displacement.
//!
//! Each shard of the awaitable map owns one of these. The hash is supplied by
//! the caller so it is computed exactly once per map operation; the table
//! keeps the top 56 bits of it packed into a per-slot metadata word together
//! with the slot's displacement from its ideal position. Lookups terminate
//! early once they pass a slot closer to home than the probe, and inserts
//! steal the slot of any richer resident, which keeps probe lengths tight at
//! high load. The table targets an 0.85 load factor and grows by doubling.
//!
//! Keys are never removed; the build graph only ever accretes entries.

use std::mem;

/// Displacement lives in the low byte of the metadata word; the remaining 56
/// bits hold the hash fragment used for indexing and as an equality pre-check.
const DIST_MASK: u64 = 0xFF;
const FRAG_MASK: u64 = !DIST_MASK;
const MAX_DIST: u64 = 255;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD_PERCENT: usize = 85;

struct Slot<K, V> {
    meta: u64,
    key: K,
    value: V,
}

impl<K, V> Slot<K, V> {
    fn dist(&self) -> u64 {
        self.meta & DIST_MASK
    }

    fn frag(&self) -> u64 {
        self.meta & FRAG_MASK
    }

    fn set_dist(&mut self, dist: u64) {
        debug_assert!(dist <= MAX_DIST);
        self.meta = (self.meta & FRAG_MASK) | dist;
    }
}

/// Robin-Hood open-addressing table keyed by caller-supplied hashes.
pub struct RobinTable<K, V> {
    slots: Vec<Option<Slot<K, V>>>,
    len: usize,
}

impl<K: Eq, V> RobinTable<K, V> {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }

    /// Number of occupied slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mask(&self) -> u64 {
        self.slots.len() as u64 - 1
    }

    fn home_index(meta_or_hash: u64, mask: u64) -> usize {
        // The low byte is either shard bits (of a raw hash) or the
        // displacement (of a packed meta word); both are excluded so the
        // index depends only on the stored fragment.
        ((meta_or_hash >> 8) & mask) as usize
    }

    /// Looks up `key`, whose hash is `hash`.
    pub fn get(&self, hash: u64, key: &K) -> Option<&V> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.mask();
        let frag = hash & FRAG_MASK;
        let mut idx = Self::home_index(hash, mask);
        let mut dist = 0;
        loop {
            match &self.slots[idx] {
                None => return None,
                Some(slot) => {
                    if slot.frag() == frag && slot.key == *key {
                        return Some(&slot.value);
                    }
                    // A resident closer to home than our probe means the key
                    // cannot be further along.
                    if slot.dist() < dist {
                        return None;
                    }
                }
            }
            idx = (idx + 1) & mask as usize;
            dist += 1;
        }
    }

    /// Mutable lookup; same contract as [`RobinTable::get`].
    pub fn get_mut(&mut self, hash: u64, key: &K) -> Option<&mut V> {
        if self.slots.is_empty() {
            return None;
        }
        let mask = self.mask();
        let frag = hash & FRAG_MASK;
        let mut idx = Self::home_index(hash, mask);
        let mut dist = 0;
        loop {
            match &self.slots[idx] {
                None => return None,
                Some(slot) => {
                    if slot.frag() == frag && slot.key == *key {
                        break;
                    }
                    if slot.dist() < dist {
                        return None;
                    }
                }
            }
            idx = (idx + 1) & mask as usize;
            dist += 1;
        }
        self.slots[idx].as_mut().map(|slot| &mut slot.value)
    }

    /// Inserts `key → value`; returns the previous value if the key was
    /// already present.
    pub fn insert(&mut self, hash: u64, key: K, value: V) -> Option<V> {
        self.reserve_one();
        let frag = hash & FRAG_MASK;

        // First pass: find the key if it already exists.
        let mask = self.mask();
        let mut idx = Self::home_index(hash, mask);
        let mut dist = 0;
        loop {
            match &mut self.slots[idx] {
                None => break,
                Some(slot) => {
                    if slot.frag() == frag && slot.key == key {
                        return Some(mem::replace(&mut slot.value, value));
                    }
                    if slot.dist() < dist {
                        break;
                    }
                }
            }
            idx = (idx + 1) & mask as usize;
            dist += 1;
        }

        self.place(Slot {
            meta: frag,
            key,
            value,
        });
        self.len += 1;
        None
    }

    /// Robin-Hood placement of a slot known not to be present.
    fn place(&mut self, mut incoming: Slot<K, V>) {
        loop {
            let mask = self.mask();
            let mut idx = Self::home_index(incoming.meta, mask);
            let mut dist = 0;
            loop {
                if dist > MAX_DIST {
                    // Pathological clustering; grow and retry placement.
                    self.grow();
                    break;
                }
                match &mut self.slots[idx] {
                    empty @ None => {
                        incoming.set_dist(dist);
                        *empty = Some(incoming);
                        return;
                    }
                    Some(resident) => {
                        if resident.dist() < dist {
                            // Steal from the richer resident and keep probing
                            // with the displaced slot.
                            incoming.set_dist(dist);
                            mem::swap(resident, &mut incoming);
                            dist = incoming.dist();
                        }
                    }
                }
                idx = (idx + 1) & mask as usize;
                dist += 1;
            }
        }
    }

    fn reserve_one(&mut self) {
        if self.slots.is_empty() {
            self.slots.resize_with(INITIAL_CAPACITY, || None);
        } else if (self.len + 1) * 100 > self.slots.len() * MAX_LOAD_PERCENT {
            self.grow();
        }
    }

    fn grow(&mut self) {
        let new_cap = (self.slots.len() * 2).max(INITIAL_CAPACITY);
        let old = mem::replace(&mut self.slots, Vec::new());
        self.slots.resize_with(new_cap, || None);
        for slot in old.into_iter().flatten() {
            self.place(slot);
        }
    }

    /// Iterates over all values in unspecified order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.slots.iter().flatten().map(|slot| &slot.value)
    }
}

impl<K: Eq, V> Default for RobinTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
