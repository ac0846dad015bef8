//! Classical k-hash bit-array bloom filter, sized by `optimal(n, fpr)` and
//! seeded with a random 32-bit shuffler carried in the wire format so a
//! decoder can reconstruct the same hash family.

use std::hash::Hasher;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use siphasher::sip::SipHasher13;

/// Target false positive rate for the multi-hash filter. The xor-based
/// filters have their own fixed false positive rate and need no tuning.
pub const FALSE_POSITIVE_RATE: f64 = 0.01;

/// Computes `(num_bits, num_hashes)` for `n` entries at false positive rate
/// `fpr`, using the standard bloom filter sizing formulas:
/// `m = ceil(-n * ln(fpr) / ln(2)^2)`, `k = round((m / n) * ln(2))`.
pub fn optimal(n: usize, fpr: f64) -> (usize, u32) {
    if n == 0 {
        return (8, 1);
    }
    let n = n as f64;
    let ln2 = std::f64::consts::LN_2;
    let m = (-n * fpr.ln() / (ln2 * ln2)).ceil().max(8.0);
    let k = ((m / n) * ln2).round().max(1.0);
    (m as usize, k as u32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiHashFilter {
    num_bits: usize,
    num_hashes: u32,
    shuffler: u32,
    bits: Vec<u64>,
}

impl MultiHashFilter {
    pub fn new(num_bits: usize, num_hashes: u32, shuffler: u32) -> Self {
        let num_bits = num_bits.max(8);
        let words = (num_bits + 63) / 64;
        Self { num_bits, num_hashes: num_hashes.max(1), shuffler, bits: vec![0u64; words] }
    }

    pub fn with_optimal_size(n: usize, fpr: f64, shuffler: u32) -> Self {
        let (num_bits, num_hashes) = optimal(n, fpr);
        Self::new(num_bits, num_hashes, shuffler)
    }

    fn bit_indices(&self, id: &[u8]) -> impl Iterator<Item = usize> + '_ {
        let mut hasher_a = SipHasher13::new_with_keys(self.shuffler as u64, 0);
        hasher_a.write(id);
        let h1 = hasher_a.finish();

        let mut hasher_b = SipHasher13::new_with_keys(0, self.shuffler as u64 ^ 0x9E37_79B9_7F4A_7C15);
        hasher_b.write(id);
        let h2 = hasher_b.finish();

        let num_bits = self.num_bits as u64;
        (0..self.num_hashes).map(move |i| {
            let combined = h1.wrapping_add((i as u64).wrapping_mul(h2));
            (combined % num_bits) as usize
        })
    }

    pub fn set(&mut self, id: &[u8]) {
        for idx in self.bit_indices(id).collect::<Vec<_>>() {
            self.bits[idx / 64] |= 1 << (idx % 64);
        }
    }

    pub fn test(&self, id: &[u8]) -> bool {
        self.bit_indices(id).all(|idx| self.bits[idx / 64] & (1 << (idx % 64)) != 0)
    }

    /// `shuffler(u32) | num_hashes(u32) | num_bits(u64) | packed bits`
    pub fn marshal(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(16 + self.bits.len() * 8);
        out.put_u32(self.shuffler);
        out.put_u32(self.num_hashes);
        out.put_u64(self.num_bits as u64);
        for word in &self.bits {
            out.put_u64(*word);
        }
        out.freeze()
    }

    pub fn unmarshal(mut buf: &[u8]) -> Result<Self, super::BloomDecodeError> {
        if buf.len() < 16 {
            return Err(super::BloomDecodeError::Truncated);
        }
        let shuffler = buf.get_u32();
        let num_hashes = buf.get_u32();
        let num_bits = buf.get_u64() as usize;
        let words = (num_bits + 63) / 64;
        if buf.remaining() < words * 8 {
            return Err(super::BloomDecodeError::Truncated);
        }
        let mut bits = Vec::with_capacity(words);
        for _ in 0..words {
            bits.push(buf.get_u64());
        }
        Ok(Self { num_bits, num_hashes, shuffler, bits })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_form() {
        let mut f = MultiHashFilter::with_optimal_size(64, FALSE_POSITIVE_RATE, 12345);
        let ids: Vec<[u8; 32]> = (0..64u8).map(|i| [i; 32]).collect();
        for id in &ids {
            f.set(id);
        }
        let bytes = f.marshal();
        let decoded = MultiHashFilter::unmarshal(&bytes).unwrap();
        for id in &ids {
            assert!(decoded.test(id));
        }
    }

    #[test]
    fn false_positive_rate_within_expected_band() {
        let n = 10_000usize;
        let mut f = MultiHashFilter::with_optimal_size(n, FALSE_POSITIVE_RATE, 0xdead_beef);
        let mut rng_state: u64 = 0x1234_5678_9abc_def0;
        let mut next = || {
            rng_state ^= rng_state << 13;
            rng_state ^= rng_state >> 7;
            rng_state ^= rng_state << 17;
            rng_state
        };
        let members: Vec<[u8; 32]> = (0..n)
            .map(|_| {
                let mut id = [0u8; 32];
                id[..8].copy_from_slice(&next().to_le_bytes());
                id
            })
            .collect();
        for id in &members {
            f.set(id);
        }
        let non_members: Vec<[u8; 32]> = (0..n)
            .map(|_| {
                let mut id = [0u8; 32];
                id[..8].copy_from_slice(&next().to_le_bytes());
                id[8] = 0xff;
                id
            })
            .collect();
        let false_positives = non_members.iter().filter(|id| f.test(*id)).count();
        let rate = false_positives as f64 / n as f64;
        assert!(rate <= 0.02, "false positive rate too high: {rate}");
    }
}
