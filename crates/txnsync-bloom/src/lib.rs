//! Bloom filter construction and decoding for the transaction sync wire
//! protocol: a classical multi-hash filter and two Xor-filter variants
//! (8-bit and 32-bit fingerprints), plus the descriptor framing and the
//! selection factory that picks among them.

pub mod descriptor;
pub mod multi_hash;
pub mod xor;

pub use descriptor::{make_bloom_filter, BloomFilter, BloomFilterDescriptor, BloomFilterKind, TransactionsRange};
pub use multi_hash::MultiHashFilter;
pub use xor::{Xor32Filter, Xor8Filter, XorBuilder};

/// Failure modes decoding a filter off the wire. These never cross into a
/// disconnect decision directly; callers fold them into
/// `txnsync_types::TxnSyncError::InvalidBloom`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BloomDecodeError {
    #[error("buffer ended before the filter was fully read")]
    Truncated,

    #[error("filter kind tag {0} is not recognized")]
    UnknownKind(u8),
}
