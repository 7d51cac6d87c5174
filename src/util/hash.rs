//! Stable, non-cryptographic hashing.
//!
//! The awaitable maps take their hash from the caller so it is computed once
//! per operation; this hasher is the default supplier. It must be stable
//! across processes because remote filesystem placement is derived from the
//! same function.
//!
//! The construction: input is consumed in 8-byte little-endian lanes (the
//! tail zero-padded), each lane folded in FNV-style (xor, multiply, rotate),
//! and the total written length is mixed into a splitmix-style finalizer so
//! short keys and padded tails still diverge.

use std::hash::{BuildHasher, Hash, Hasher};

/// Stable, non-cryptographic hasher with a fixed seed.
#[derive(Debug, Clone)]
pub struct StableHasher {
    state: u64,
    len: u64,
}

impl StableHasher {
    /// Fixed seed keeps shard selection and ring placement stable across
    /// runs and machines.
    const SEED: u64 = 0x7c0f_ac5e_11d4_3d6b;
    /// 64-bit FNV prime.
    const LANE_PRIME: u64 = 0x0000_0100_0000_01b3;

    fn lane(&mut self, lane: u64) {
        self.state = (self.state ^ lane).wrapping_mul(Self::LANE_PRIME);
        self.state = self.state.rotate_left(23);
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self {
            state: Self::SEED,
            len: 0,
        }
    }
}

impl Hasher for StableHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.len = self.len.wrapping_add(bytes.len() as u64);
        let mut chunks = bytes.chunks_exact(8);
        for chunk in &mut chunks {
            let mut lane = [0u8; 8];
            lane.copy_from_slice(chunk);
            self.lane(u64::from_le_bytes(lane));
        }
        let tail = chunks.remainder();
        if !tail.is_empty() {
            let mut lane = [0u8; 8];
            lane[..tail.len()].copy_from_slice(tail);
            self.lane(u64::from_le_bytes(lane));
        }
    }

    fn write_u8(&mut self, i: u8) {
        self.len = self.len.wrapping_add(1);
        self.lane(u64::from(i));
    }

    fn write_u64(&mut self, i: u64) {
        self.len = self.len.wrapping_add(8);
        self.lane(i);
    }

    fn finish(&self) -> u64 {
        // Splitmix-style finalizer; folding the length in separates inputs
        // that only differ by zero padding.
        let mut h = self.state ^ self.len.wrapping_mul(Self::LANE_PRIME);
        h ^= h >> 30;
        h = h.wrapping_mul(0xbf58_476d_1ce4_e5b9);
        h ^= h >> 27;
        h = h.wrapping_mul(0x94d0_49bb_1331_11eb);
        h ^= h >> 31;
        h
    }
}

/// Builder for [`StableHasher`], usable as a `HashMap` hasher.
#[derive(Clone, Default)]
pub struct StableBuildHasher;

impl BuildHasher for StableBuildHasher {
    type Hasher = StableHasher;

    fn build_hasher(&self) -> StableHasher {
        StableHasher::default()
    }
}

/// Hashes a single value with the stable hasher.
#[must_use]
pub fn hash_one<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = StableHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_across_instances() {
        assert_eq!(hash_one("//src/core:lib"), hash_one("//src/core:lib"));
        assert_ne!(hash_one("//src/core:lib"), hash_one("//src/core:bin"));
    }

    #[test]
    fn distinct_write_widths_mix() {
        let mut a = StableHasher::default();
        a.write_u64(7);
        let mut b = StableHasher::default();
        b.write_u8(7);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn length_fold_separates_padded_tails() {
        // Same lane values after padding, different lengths.
        let mut a = StableHasher::default();
        a.write(&[0u8; 3]);
        let mut b = StableHasher::default();
        b.write(&[0u8; 8]);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn multi_lane_inputs_spread() {
        let long_a = hash_one("//very/long/package/path/with/many/components:target_one");
        let long_b = hash_one("//very/long/package/path/with/many/components:target_two");
        assert_ne!(long_a, long_b);
    }

    #[test]
    fn empty_input_is_deterministic() {
        let h = StableHasher::default().finish();
        assert_eq!(h, StableHasher::default().finish());
    }
}
