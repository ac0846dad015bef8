/// Sharding contract a peer hands us (or we hand a peer): "send me transactions
/// whose ID prefix satisfies `id % modulator == offset`".
///
/// `modulator == 0` means "send me nothing"; `modulator == 1` means "send me
/// everything". `offset < modulator` is an invariant enforced at construction
/// whenever `modulator > 1`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RequestParams {
    pub modulator: u8,
    pub offset: u8,
}

impl RequestParams {
    /// Builds a params pair, clamping `offset` into `[0, modulator)` the same
    /// way the source's `setLocalRequestParams` does (`offset % modulator`)
    /// rather than rejecting out-of-range input.
    pub fn new(modulator: u8, offset: u64) -> Self {
        if modulator == 0 {
            return Self { modulator: 0, offset: 0 };
        }
        Self { modulator, offset: (offset % modulator as u64) as u8 }
    }

    pub const fn none() -> Self {
        Self { modulator: 0, offset: 0 }
    }

    pub const fn everything() -> Self {
        Self { modulator: 1, offset: 0 }
    }

    pub fn wants_nothing(&self) -> bool {
        self.modulator == 0
    }

    pub fn wants_everything(&self) -> bool {
        self.modulator == 1
    }

    /// Tests whether a 64-bit little-endian transaction ID prefix falls in
    /// this shard. `modulator <= 1` is handled by the caller (gate checks in
    /// selection skip this entirely for "everything"/"nothing").
    pub fn shard_contains(&self, id_prefix_le: u64) -> bool {
        if self.modulator <= 1 {
            return self.modulator == 1;
        }
        id_prefix_le % self.modulator as u64 == self.offset as u64
    }
}

/// Extracts the first 8 bytes of a 32-byte transaction ID, little-endian, as
/// used by the shard test. Mirrors the source's `txidToUint64`.
pub fn id_prefix_le(id: &[u8; 32]) -> u64 {
    u64::from_le_bytes(id[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_offset_to_modulator() {
        let p = RequestParams::new(4, 9);
        assert_eq!(p.modulator, 4);
        assert_eq!(p.offset, 1);
    }

    #[test]
    fn zero_modulator_wants_nothing() {
        assert!(RequestParams::new(0, 7).wants_nothing());
    }

    #[test]
    fn shard_contains_respects_offset() {
        let p = RequestParams { modulator: 4, offset: 1 };
        assert!(p.shard_contains(5));
        assert!(!p.shard_contains(4));
    }

    #[test]
    fn everything_and_nothing_bypass_modulo() {
        assert!(RequestParams::everything().shard_contains(u64::MAX));
        assert!(!RequestParams::none().shard_contains(0));
    }
}
