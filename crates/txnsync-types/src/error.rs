/// Error kinds from §7. Errors on the incoming path always trigger peer
/// eviction and never propagate into the mainloop; `HeapEmpty` and
/// `SequenceMismatch` are internal draining-loop signals and are never
/// surfaced to a disconnect decision.
#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone, Copy)]
pub enum TxnSyncError {
    #[error("peer speaks an unsupported protocol version")]
    UnsupportedVersion,

    #[error("bloom filter descriptor failed to decode or names an unknown kind")]
    InvalidBloom,

    #[error("transaction group frame is malformed")]
    DecodingFailed,

    #[error("incoming message queue is saturated")]
    QueueFull,

    #[error("ordering heap is empty")]
    HeapEmpty,

    #[error("sequence number does not match the expected value")]
    SequenceMismatch,

    #[error("ordering heap is at capacity")]
    HeapFull,
}

impl TxnSyncError {
    /// Whether this error kind warrants disconnecting the peer it was raised
    /// for. `HeapEmpty`/`SequenceMismatch` are draining-loop control flow,
    /// never a disconnect reason.
    pub fn is_disconnect_reason(&self) -> bool {
        !matches!(self, TxnSyncError::HeapEmpty | TxnSyncError::SequenceMismatch)
    }
}
