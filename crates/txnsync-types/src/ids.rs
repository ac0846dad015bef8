use reth_primitives::B256;

/// Stable 32-byte identifier for a transaction group.
pub type GroupTransactionId = B256;

/// Monotone counter assigned to a transaction group on pool entry, local to
/// this node. Used as a stable scan cursor by the selection algorithm.
pub type GroupCounter = u64;

/// Opaque cookie identifying the underlying network connection to a peer.
/// Immutable after peer construction; the core never interprets it.
pub type NetworkHandle = B256;

/// A monotonically increasing block-height number supplied by the host.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct Round(pub u64);

impl Round {
    /// Saturating subtraction, mirroring the source's `basics.Round.SubSaturate`.
    pub fn sub_saturate(self, n: u64) -> Round {
        Round(self.0.saturating_sub(n))
    }

    pub fn next(self) -> Round {
        Round(self.0 + 1)
    }
}

impl From<u64> for Round {
    fn from(value: u64) -> Self {
        Round(value)
    }
}

impl std::fmt::Display for Round {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u64> for Round {
    type Output = Round;

    fn add(self, rhs: u64) -> Round {
        Round(self.0 + rhs)
    }
}
