//! Wire framing for a bloom filter plus the factory (`make_bloom_filter`)
//! that picks a filter kind and builds it over a slice of the local
//! transaction pool, mirroring the source's `makeBloomFilter`.

use bytes::Bytes;
use txnsync_types::{GroupCounter, RequestParams};

use crate::multi_hash::{self, MultiHashFilter};
use crate::xor::{Xor32Filter, Xor8Filter, XorBuilder};
use crate::BloomDecodeError;

/// The inclusive range of local group counters a filter was built over, used
/// to decide whether a previously sent filter can be reused verbatim for a
/// later round (`sameParams`) instead of rebuilt from scratch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TransactionsRange {
    pub first_counter: GroupCounter,
    pub last_counter: GroupCounter,
}

impl TransactionsRange {
    pub fn new(first_counter: GroupCounter, last_counter: GroupCounter) -> Self {
        Self { first_counter, last_counter }
    }

    pub fn is_empty(&self) -> bool {
        self.last_counter < self.first_counter
    }
}

/// Wire tag for the filter kind, in the order the source assigns them so the
/// tag byte round-trips between implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BloomFilterKind {
    Invalid = 0,
    MultiHash = 1,
    Xor32 = 2,
    Xor8 = 3,
}

impl TryFrom<u8> for BloomFilterKind {
    type Error = BloomDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::MultiHash),
            2 => Ok(Self::Xor32),
            3 => Ok(Self::Xor8),
            other => Err(BloomDecodeError::UnknownKind(other)),
        }
    }
}

/// A decoded filter capable of set/test, regardless of which underlying
/// construction produced it. Mirrors `util/bloom`'s `GenericFilter` interface.
#[derive(Debug, Clone)]
pub enum BloomFilter {
    MultiHash(MultiHashFilter),
    Xor32(Xor32Filter),
    Xor8(Xor8Filter),
}

impl BloomFilter {
    pub fn kind(&self) -> BloomFilterKind {
        match self {
            BloomFilter::MultiHash(_) => BloomFilterKind::MultiHash,
            BloomFilter::Xor32(_) => BloomFilterKind::Xor32,
            BloomFilter::Xor8(_) => BloomFilterKind::Xor8,
        }
    }

    pub fn test(&self, id_prefix: u64) -> bool {
        match self {
            BloomFilter::MultiHash(f) => f.test(&id_prefix.to_le_bytes()),
            BloomFilter::Xor32(f) => f.contains(id_prefix),
            BloomFilter::Xor8(f) => f.contains(id_prefix),
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            BloomFilter::MultiHash(f) => f.marshal(),
            BloomFilter::Xor32(f) => f.marshal(),
            BloomFilter::Xor8(f) => f.marshal(),
        }
    }

    pub fn decode(kind: BloomFilterKind, bytes: &[u8]) -> Result<Self, BloomDecodeError> {
        match kind {
            BloomFilterKind::Invalid => Err(BloomDecodeError::UnknownKind(0)),
            BloomFilterKind::MultiHash => Ok(BloomFilter::MultiHash(MultiHashFilter::unmarshal(bytes)?)),
            BloomFilterKind::Xor32 => Ok(BloomFilter::Xor32(Xor32Filter::unmarshal(bytes)?)),
            BloomFilterKind::Xor8 => Ok(BloomFilter::Xor8(Xor8Filter::unmarshal(bytes)?)),
        }
    }
}

/// A bloom filter as carried on the wire: the sharding it was built for, the
/// range of local counters it covers, and its encoded body. `encoded_bytes`
/// is kept undecoded until a caller actually needs to test membership.
#[derive(Debug, Clone)]
pub struct BloomFilterDescriptor {
    pub kind: BloomFilterKind,
    pub params: RequestParams,
    pub contained_range: TransactionsRange,
    pub encoded_bytes: Bytes,
    /// Tells the receiving peer to discard any filter it previously held for
    /// this `(modulator, offset)` pair rather than layering this one on top.
    /// See the "Open Question: clearPrevious with no matching prior entry"
    /// decision in DESIGN.md.
    pub clear_previous: bool,
}

impl BloomFilterDescriptor {
    /// True when `other` was built for the same shard and already covers (or
    /// equals) this descriptor's range, so a rebuild can be skipped and
    /// `other` reused as-is. Mirrors `bloomFilter.sameParams`.
    pub fn same_params(&self, other: &BloomFilterDescriptor) -> bool {
        self.params == other.params && self.contained_range == other.contained_range
    }

    pub fn decode_filter(&self) -> Result<BloomFilter, BloomDecodeError> {
        BloomFilter::decode(self.kind, &self.encoded_bytes)
    }
}

/// Builds a filter descriptor for `params` over `pool`, an already-sorted
/// `(counter, id_prefix)` iterator covering the local pool snapshot.
///
/// - `modulator == 0`: wants nothing, produces an empty descriptor with no
///   encoded body.
/// - `modulator == 1`: wants everything; if `hint_prev` was already built for
///   "everything" over an equal-or-wider range, it is reused verbatim.
/// - otherwise: builds over only the subset of `pool` whose id prefix falls
///   in the requested shard.
///
/// Xor32 is attempted first; construction can fail to converge within the
/// iteration budget, in which case the multi-hash filter is used instead
/// (mirrors the source's `filterFactoryBloom` fallback from xor to
/// multi-hash).
pub fn make_bloom_filter(
    params: RequestParams,
    hint_prev: Option<&BloomFilterDescriptor>,
    pool: impl Iterator<Item = (GroupCounter, u64)> + Clone,
    builder: &mut XorBuilder,
) -> BloomFilterDescriptor {
    if params.wants_nothing() {
        return BloomFilterDescriptor {
            kind: BloomFilterKind::Invalid,
            params,
            contained_range: TransactionsRange::default(),
            encoded_bytes: Bytes::new(),
            clear_previous: false,
        };
    }

    let selected: Vec<(GroupCounter, u64)> = if params.wants_everything() {
        pool.clone().collect()
    } else {
        pool.clone().filter(|(_, id_prefix)| params.shard_contains(*id_prefix)).collect()
    };

    let range = match (selected.first(), selected.last()) {
        (Some((first, _)), Some((last, _))) => TransactionsRange::new(*first, *last),
        _ => TransactionsRange::default(),
    };

    if let Some(prev) = hint_prev {
        if prev.params == params && prev.contained_range == range && !range.is_empty() {
            return prev.clone();
        }
    }

    build_descriptor(params, range, &selected, builder)
}

fn build_descriptor(params: RequestParams, range: TransactionsRange, selected: &[(GroupCounter, u64)], builder: &mut XorBuilder) -> BloomFilterDescriptor {
    if selected.is_empty() {
        return BloomFilterDescriptor {
            kind: BloomFilterKind::Invalid,
            params,
            contained_range: range,
            encoded_bytes: Bytes::new(),
            clear_previous: false,
        };
    }

    let keys: Vec<u64> = selected.iter().map(|(_, id_prefix)| *id_prefix).collect();

    if let Some(filter) = Xor32Filter::build(&keys, builder) {
        return BloomFilterDescriptor {
            kind: BloomFilterKind::Xor32,
            params,
            contained_range: range,
            encoded_bytes: filter.marshal(),
            clear_previous: false,
        };
    }

    tracing::debug!(keys = keys.len(), modulator = params.modulator, offset = params.offset, "xor filter construction did not converge, falling back to multi-hash");
    let mut fallback = MultiHashFilter::with_optimal_size(keys.len(), multi_hash::FALSE_POSITIVE_RATE, builder.random_number_generator_seed as u32);
    for id in &keys {
        fallback.set(&id.to_le_bytes());
    }
    BloomFilterDescriptor { kind: BloomFilterKind::MultiHash, params, contained_range: range, encoded_bytes: fallback.marshal(), clear_previous: false }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(n: u64) -> Vec<(GroupCounter, u64)> {
        (0..n).map(|i| (i, i.wrapping_mul(0x9E37_79B9_7F4A_7C15))).collect()
    }

    #[test]
    fn zero_modulator_builds_empty_descriptor() {
        let mut builder = XorBuilder::new(1);
        let desc = make_bloom_filter(RequestParams::none(), None, pool(100).into_iter(), &mut builder);
        assert_eq!(desc.kind, BloomFilterKind::Invalid);
        assert!(desc.encoded_bytes.is_empty());
    }

    #[test]
    fn everything_descriptor_contains_all_members() {
        let data = pool(500);
        let mut builder = XorBuilder::new(1);
        let desc = make_bloom_filter(RequestParams::everything(), None, data.clone().into_iter(), &mut builder);
        let filter = desc.decode_filter().unwrap();
        for (_, id_prefix) in &data {
            assert!(filter.test(*id_prefix));
        }
    }

    #[test]
    fn sharded_descriptor_excludes_other_shards() {
        let data = pool(2000);
        let params = RequestParams::new(4, 2);
        let mut builder = XorBuilder::new(1);
        let desc = make_bloom_filter(params, None, data.clone().into_iter(), &mut builder);
        let filter = desc.decode_filter().unwrap();
        for (_, id_prefix) in data.iter().filter(|(_, p)| params.shard_contains(*p)) {
            assert!(filter.test(*id_prefix));
        }
    }

    #[test]
    fn hint_with_matching_range_is_reused() {
        let data = pool(50);
        let mut builder = XorBuilder::new(1);
        let first = make_bloom_filter(RequestParams::everything(), None, data.clone().into_iter(), &mut builder);
        let second = make_bloom_filter(RequestParams::everything(), Some(&first), data.into_iter(), &mut builder);
        assert_eq!(first.encoded_bytes, second.encoded_bytes);
    }
}
