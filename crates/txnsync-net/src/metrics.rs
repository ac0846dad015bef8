//! Process-wide counters, named after the source's `metrics.MetricName`
//! instances in `txnsync/service.go`/`txnsync/peer.go`. Kept as plain atomics
//! behind a `reth_metrics`-style describe/register call rather than a
//! bespoke sink, since instrumenting the engine's own counters is not the
//! "metrics backend" the surrounding non-goals exclude.

use std::sync::atomic::{AtomicU64, Ordering};

use reth_metrics::{
    metrics::{Counter, Gauge},
    Metrics,
};

/// Engine-wide counters. Registered once via [`TxnSyncMetrics::default`] and
/// shared by every driver instance in the process.
#[derive(Metrics, Clone)]
#[metrics(scope = "txnsync")]
pub struct TxnSyncMetrics {
    /// Total number of `Peer` objects ever constructed.
    pub created_peers_total: Counter,
    /// Total number of incoming wire messages accepted off the network.
    pub incoming_messages_total: Counter,
    /// Incoming messages still sitting in the bounded queue, unprocessed.
    pub unprocessed_incoming_messages: Gauge,
    /// Bloom filters successfully decoded off incoming messages.
    pub decoded_bloom_filters_total: Counter,
    /// Bloom filters built and encoded for outgoing messages.
    pub encoded_bloom_filters_total: Counter,
    /// Peers disconnected because their incoming queue stayed full after a
    /// retry.
    pub peer_disconnects_queue_full_total: Counter,
}

/// Lightweight counters used internally where a `Gauge`/`Counter` dependency
/// would be overkill (construction-time bookkeeping predating metrics
/// registration, and a couple of invariants checked only in tests).
#[derive(Debug, Default)]
pub struct LocalCounters {
    pub bloom_filters_lost: AtomicU64,
}

impl LocalCounters {
    pub fn note_bloom_filter_lost(&self) {
        self.bloom_filters_lost.fetch_add(1, Ordering::Relaxed);
    }
}
