//! Xor filter construction (Graf & Lemire, "Xor Filters: Faster and Smaller
//! Than Bloom and Cuckoo Filters"). Builds a 3-block fingerprint table via
//! the peel-and-assign algorithm; the builder is reseedable and capped at
//! `max_iterations` attempts before giving up, at which point the caller
//! falls back to the multi-hash filter.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::BloomDecodeError;

/// Default cap on construction retries before giving up on the xor filter
/// entirely, per peer.go's `bloomFilterRetryCount`-adjacent tuning -- here it
/// governs how many reseeded attempts `build` makes, not the unrelated
/// per-transaction retry count in the selection tracker.
pub const MAX_ITERATIONS: u32 = 10;

/// Reseedable construction state shared across invocations, mirroring the
/// source's `xorBuilder` held on `syncState` so repeated calls don't need to
/// re-derive randomness from scratch.
#[derive(Debug, Default)]
pub struct XorBuilder {
    pub max_iterations: u32,
    pub random_number_generator_seed: u64,
}

impl XorBuilder {
    pub fn new(seed: u64) -> Self {
        Self { max_iterations: MAX_ITERATIONS, random_number_generator_seed: seed }
    }
}

fn mix(mut x: u64) -> u64 {
    // splitmix64 finalizer
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^= x >> 31;
    x
}

fn hash_of_key(seed: u64, key: u64) -> u64 {
    mix(key.wrapping_add(seed))
}

fn reduce(hash: u64, n: u32) -> u32 {
    (((hash as u128) * (n as u128)) >> 64) as u32
}

/// Returns the absolute slot index for segment `segment` (0, 1 or 2) of a
/// per-key hash, given the block length.
fn segment_slot(hashed: u64, segment: u8, block_length: u32) -> u32 {
    let rotated = match segment {
        0 => hashed,
        1 => hashed.rotate_left(21),
        _ => hashed.rotate_left(42),
    };
    segment as u32 * block_length + reduce(rotated, block_length)
}

struct PeelResult {
    seed: u64,
    block_length: u32,
    /// Keys in peel order (= reverse assignment order), paired with which
    /// segment they were finally resolved through.
    order: Vec<(u64, u8)>,
}

fn block_length_for(size: usize) -> u32 {
    let capacity = 32 + (1.23 * size as f64).ceil() as u32;
    (capacity / 3).max(1)
}

fn try_peel(keys: &[u64], seed: u64) -> Option<PeelResult> {
    let size = keys.len();
    let block_length = block_length_for(size);
    let capacity = (block_length * 3) as usize;

    let mut xor_mask = vec![0u64; capacity];
    let mut count = vec![0u32; capacity];

    let hashed_keys: Vec<u64> = keys.iter().map(|k| hash_of_key(seed, *k)).collect();

    for &hashed in &hashed_keys {
        for segment in 0..3u8 {
            let slot = segment_slot(hashed, segment, block_length) as usize;
            xor_mask[slot] ^= hashed;
            count[slot] += 1;
        }
    }

    let mut queue: Vec<usize> = (0..capacity).filter(|&i| count[i] == 1).collect();
    let mut order = Vec::with_capacity(size);

    while let Some(slot) = queue.pop() {
        if count[slot] != 1 {
            continue;
        }
        let hashed = xor_mask[slot];
        let found_segment = (slot as u32 / block_length) as u8;
        order.push((hashed, found_segment));
        count[slot] = 0;

        for segment in 0..3u8 {
            if segment == found_segment {
                continue;
            }
            let other = segment_slot(hashed, segment, block_length) as usize;
            xor_mask[other] ^= hashed;
            if count[other] > 0 {
                count[other] -= 1;
                if count[other] == 1 {
                    queue.push(other);
                }
            }
        }
    }

    if order.len() != size {
        return None;
    }
    Some(PeelResult { seed, block_length, order })
}

fn build_peel(keys: &[u64], builder: &mut XorBuilder) -> Option<PeelResult> {
    let iterations = if builder.max_iterations == 0 { MAX_ITERATIONS } else { builder.max_iterations };
    let mut seed = builder.random_number_generator_seed;
    for _ in 0..iterations {
        if let Some(result) = try_peel(keys, seed) {
            builder.random_number_generator_seed = seed;
            return Some(result);
        }
        seed = mix(seed ^ 0x9E37_79B9_7F4A_7C15);
    }
    None
}

macro_rules! xor_filter {
    ($name:ident, $fp_ty:ty, $fp_fn:expr, $get:ident, $put:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name {
            seed: u64,
            block_length: u32,
            fingerprints: Vec<$fp_ty>,
        }

        impl $name {
            pub fn build(keys: &[u64], builder: &mut XorBuilder) -> Option<Self> {
                let peel = build_peel(keys, builder)?;
                let capacity = (peel.block_length * 3) as usize;
                let mut fingerprints = vec![0 as $fp_ty; capacity];
                let fp_fn: fn(u64) -> $fp_ty = $fp_fn;
                for &(hashed, found_segment) in peel.order.iter().rev() {
                    let mut fp = fp_fn(hashed);
                    for segment in 0..3u8 {
                        if segment == found_segment {
                            continue;
                        }
                        let other = segment_slot(hashed, segment, peel.block_length) as usize;
                        fp ^= fingerprints[other];
                    }
                    let slot = segment_slot(hashed, found_segment, peel.block_length) as usize;
                    fingerprints[slot] = fp;
                }
                Some(Self { seed: peel.seed, block_length: peel.block_length, fingerprints })
            }

            pub fn contains(&self, key: u64) -> bool {
                let hashed = hash_of_key(self.seed, key);
                let fp_fn: fn(u64) -> $fp_ty = $fp_fn;
                let mut f = fp_fn(hashed);
                for segment in 0..3u8 {
                    let slot = segment_slot(hashed, segment, self.block_length) as usize;
                    f ^= self.fingerprints[slot];
                }
                f == 0
            }

            pub fn marshal(&self) -> Bytes {
                let mut out = BytesMut::with_capacity(16 + self.fingerprints.len() * std::mem::size_of::<$fp_ty>());
                out.put_u64(self.seed);
                out.put_u32(self.block_length);
                out.put_u32(self.fingerprints.len() as u32);
                for fp in &self.fingerprints {
                    out.$put(*fp);
                }
                out.freeze()
            }

            pub fn unmarshal(mut buf: &[u8]) -> Result<Self, BloomDecodeError> {
                if buf.len() < 16 {
                    return Err(BloomDecodeError::Truncated);
                }
                let seed = buf.get_u64();
                let block_length = buf.get_u32();
                let len = buf.get_u32() as usize;
                let elem_size = std::mem::size_of::<$fp_ty>();
                if buf.remaining() < len * elem_size {
                    return Err(BloomDecodeError::Truncated);
                }
                let mut fingerprints = Vec::with_capacity(len);
                for _ in 0..len {
                    fingerprints.push(buf.$get());
                }
                Ok(Self { seed, block_length, fingerprints })
            }
        }
    };
}

fn fingerprint8(h: u64) -> u8 {
    (h ^ (h >> 32) ^ (h >> 56)) as u8
}

fn fingerprint32(h: u64) -> u32 {
    (h ^ (h >> 32)) as u32
}

xor_filter!(Xor8Filter, u8, fingerprint8, get_u8, put_u8);
xor_filter!(Xor32Filter, u32, fingerprint32, get_u32, put_u32);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_keys(n: u64) -> Vec<u64> {
        (0..n).map(|i| hash_of_key(i, 0xabcd_1234)).collect()
    }

    #[test]
    fn xor8_round_trips() {
        let keys = sample_keys(2000);
        let mut builder = XorBuilder::new(1);
        let filter = Xor8Filter::build(&keys, &mut builder).expect("construction should converge");
        for k in &keys {
            assert!(filter.contains(*k));
        }
        let bytes = filter.marshal();
        let decoded = Xor8Filter::unmarshal(&bytes).unwrap();
        for k in &keys {
            assert!(decoded.contains(*k));
        }
    }

    #[test]
    fn xor32_round_trips() {
        let keys = sample_keys(2000);
        let mut builder = XorBuilder::new(7);
        let filter = Xor32Filter::build(&keys, &mut builder).expect("construction should converge");
        for k in &keys {
            assert!(filter.contains(*k));
        }
        let bytes = filter.marshal();
        let decoded = Xor32Filter::unmarshal(&bytes).unwrap();
        for k in &keys {
            assert!(decoded.contains(*k));
        }
    }

    #[test]
    fn empty_key_set_constructs_trivially() {
        let mut builder = XorBuilder::new(42);
        let filter = Xor8Filter::build(&[], &mut builder).expect("empty set always peels");
        assert!(!filter.contains(123));
    }
}
