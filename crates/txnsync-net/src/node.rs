//! The external interfaces the driver is built against: the host node it
//! synchronizes transactions for, and the structured log sink it reports
//! through. Both are non-blocking from the driver's point of view, per the
//! single-threaded cooperative mainloop requirement -- a `NodeConnector`
//! implementation must never block the caller; it hands off to its own
//! background machinery and returns immediately.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use txnsync_types::{GroupCounter, NetworkHandle, Round, SignedTxGroup, TxnSyncError};

/// Outcome of handing a batch of decoded transaction groups to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAcceptance {
    /// How many of the submitted groups were actually new to the pool.
    pub accepted: usize,
    /// Whether the pool's own backlog is currently full, in which case the
    /// driver should back off requesting more from this peer.
    pub backlog_full: bool,
}

/// The node this engine is embedded in. Implemented once per process by the
/// host; `txnsync-net` never talks to the network or the pool directly.
pub trait NodeConnector: Send + Sync + 'static {
    /// The round the host is currently on. Polled by the driver on every
    /// round-change notification.
    fn current_round(&self) -> Round;

    /// Measured network latency to `peer`, refreshed by the driver once per
    /// round turnover.
    fn peer_latency(&self, peer: NetworkHandle) -> Duration;

    /// A snapshot of the local pool's pending transaction groups, ordered by
    /// ascending group counter. Must be cheap to call repeatedly; the driver
    /// calls it once per peer per scheduling tick unless a message series is
    /// already in flight for that peer.
    fn pending_transactions(&self) -> Arc<[SignedTxGroup]>;

    /// Current number of groups held in the pool, used to size bloom
    /// filters and to detect `messageSeriesPendingTransactions` snapshot
    /// invalidation (a pool shrink below a tracked group counter).
    fn transaction_pool_size(&self) -> usize;

    /// Hands decoded groups received from `peer` to the pool. Must not
    /// block; the pool is expected to queue internally and report back via
    /// `ack_channel` whichever groups above `low_watermark` were accepted.
    fn submit_transaction_groups(&self, peer: NetworkHandle, groups: &[SignedTxGroup], message_seq: u64) -> PoolAcceptance;

    /// Non-blocking enqueue of an already-framed outgoing message. Returns
    /// an error if the underlying transport's send queue for `peer` is
    /// saturated; the driver treats this the same as any other disconnect
    /// reason.
    fn send_message(&self, peer: NetworkHandle, frame: bytes::Bytes) -> Result<(), TxnSyncError>;

    /// Requests that the transport drop `peer`, citing `reason`.
    fn disconnect(&self, peer: NetworkHandle, reason: TxnSyncError);

    /// A `watch` stream the host ticks every time `current_round` advances.
    /// The driver selects on this alongside its other event sources (§4.8)
    /// rather than polling `current_round` on a timer.
    fn round_changes(&self) -> watch::Receiver<Round>;

    /// A `watch` stream the host ticks whenever the pending pool changes
    /// shape (new arrival, eviction, shrink). The driver uses this to notice
    /// a pool shrink below a peer's pinned `messageSeriesPendingTransactions`
    /// snapshot (see the "Open Question" decision in DESIGN.md) and as a
    /// general nudge to re-evaluate peers sooner than their next deadline.
    fn pool_changes(&self) -> watch::Receiver<()>;
}

/// Structured log sink. A thin seam over `tracing` so call sites read as
/// "log this domain event" rather than scattering `tracing::event!` calls
/// with ad hoc fields; the default implementation below is exactly that.
pub trait Logger: Send + Sync + 'static {
    fn incoming_message(&self, peer: NetworkHandle, sequence: u64, size: usize);
    fn outgoing_message(&self, peer: NetworkHandle, sequence: u64, size: usize);
    fn peer_disconnected(&self, peer: NetworkHandle, reason: TxnSyncError);
    fn bloom_filter_lost(&self, peer: NetworkHandle);
    fn selection_progress(&self, peer: NetworkHandle, selected: usize, group_counter_cursor: GroupCounter);
}

/// `tracing`-backed logger, the ambient default for any driver that doesn't
/// supply its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn incoming_message(&self, peer: NetworkHandle, sequence: u64, size: usize) {
        tracing::debug!(peer_id = %peer, sequence, size, "incoming transaction sync message");
    }

    fn outgoing_message(&self, peer: NetworkHandle, sequence: u64, size: usize) {
        tracing::debug!(peer_id = %peer, sequence, size, "outgoing transaction sync message");
    }

    fn peer_disconnected(&self, peer: NetworkHandle, reason: TxnSyncError) {
        tracing::warn!(peer_id = %peer, %reason, "disconnecting transaction sync peer");
    }

    fn bloom_filter_lost(&self, peer: NetworkHandle) {
        tracing::error!(peer_id = %peer, "incoming bloom filter history trim failed to make room (filter lost)");
    }

    fn selection_progress(&self, peer: NetworkHandle, selected: usize, group_counter_cursor: GroupCounter) {
        tracing::trace!(peer_id = %peer, selected, group_counter_cursor, "selected pending transactions");
    }
}
