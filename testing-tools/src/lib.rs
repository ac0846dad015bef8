//! In-memory [`NodeConnector`] and a handful of fixture builders, used by
//! `txnsync-net`'s integration tests to stand in for a real pool/transport
//! without pulling in an actual node.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use txnsync_net::node::{Logger, NodeConnector, PoolAcceptance};
use txnsync_types::{GroupTransactionId, NetworkHandle, Round, SignedTxGroup, TxnSyncError};

/// Builds a deterministic transaction group for tests: the id is the byte
/// repeated across all 32 bytes, the payload just names the counter.
pub fn sample_group(id_byte: u8, counter: u64) -> SignedTxGroup {
    SignedTxGroup::new(GroupTransactionId::repeat_byte(id_byte), counter, Bytes::from(format!("group-{counter}")))
}

/// `n` sequentially-countered groups with distinct, well-spread ids (so
/// sharding tests split them roughly evenly).
pub fn sample_pool(n: u64) -> Vec<SignedTxGroup> {
    (0..n).map(|i| sample_group((i % 251) as u8, i)).collect()
}

/// An in-memory stand-in for a host node: a pending-transaction pool, a
/// round counter, per-peer latency table, and recorders for every outbound
/// send/disconnect/accept so tests can assert on them after driving the
/// engine.
pub struct MockNode {
    round_tx: watch::Sender<Round>,
    pool_changed_tx: watch::Sender<()>,
    pool: RwLock<Vec<SignedTxGroup>>,
    latency: RwLock<HashMap<NetworkHandle, Duration>>,
    sent: Mutex<Vec<(NetworkHandle, Bytes)>>,
    disconnected: Mutex<Vec<(NetworkHandle, TxnSyncError)>>,
    accepted: Mutex<Vec<SignedTxGroup>>,
    backlog_full: std::sync::atomic::AtomicBool,
    pool_size_override: AtomicU64,
}

impl MockNode {
    pub fn new() -> Arc<Self> {
        let (round_tx, _) = watch::channel(Round::default());
        let (pool_changed_tx, _) = watch::channel(());
        Arc::new(Self {
            round_tx,
            pool_changed_tx,
            pool: RwLock::new(Vec::new()),
            latency: RwLock::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            disconnected: Mutex::new(Vec::new()),
            accepted: Mutex::new(Vec::new()),
            backlog_full: std::sync::atomic::AtomicBool::new(false),
            pool_size_override: AtomicU64::new(0),
        })
    }

    /// Replaces the pending pool wholesale (must already be sorted by
    /// ascending group counter, matching `NodeConnector::pending_transactions`'s
    /// contract) and notifies any pool-change watchers.
    pub fn set_pool(&self, groups: Vec<SignedTxGroup>) {
        *self.pool.write() = groups;
        let _ = self.pool_changed_tx.send(());
    }

    pub fn set_round(&self, round: Round) {
        let _ = self.round_tx.send(round);
    }

    pub fn set_latency(&self, peer: NetworkHandle, latency: Duration) {
        self.latency.write().insert(peer, latency);
    }

    pub fn set_backlog_full(&self, full: bool) {
        self.backlog_full.store(full, Ordering::SeqCst);
    }

    /// Overrides `transaction_pool_size()` independent of the actual pool
    /// length, for exercising the pool-shrink snapshot-invalidation path
    /// without also having to change what `pending_transactions()` returns.
    pub fn set_pool_size_override(&self, size: usize) {
        self.pool_size_override.store(size as u64, Ordering::SeqCst);
    }

    pub fn sent_messages(&self) -> Vec<(NetworkHandle, Bytes)> {
        self.sent.lock().clone()
    }

    pub fn disconnected_peers(&self) -> Vec<(NetworkHandle, TxnSyncError)> {
        self.disconnected.lock().clone()
    }

    pub fn accepted_groups(&self) -> Vec<SignedTxGroup> {
        self.accepted.lock().clone()
    }
}

impl NodeConnector for MockNode {
    fn current_round(&self) -> Round {
        *self.round_tx.borrow()
    }

    fn peer_latency(&self, peer: NetworkHandle) -> Duration {
        self.latency.read().get(&peer).copied().unwrap_or(Duration::ZERO)
    }

    fn pending_transactions(&self) -> Arc<[SignedTxGroup]> {
        Arc::from(self.pool.read().clone())
    }

    fn transaction_pool_size(&self) -> usize {
        let overridden = self.pool_size_override.load(Ordering::SeqCst) as usize;
        if overridden > 0 {
            overridden
        } else {
            self.pool.read().len()
        }
    }

    fn submit_transaction_groups(&self, _peer: NetworkHandle, groups: &[SignedTxGroup], _message_seq: u64) -> PoolAcceptance {
        self.accepted.lock().extend_from_slice(groups);
        PoolAcceptance { accepted: groups.len(), backlog_full: self.backlog_full.load(Ordering::SeqCst) }
    }

    fn send_message(&self, peer: NetworkHandle, frame: Bytes) -> Result<(), TxnSyncError> {
        self.sent.lock().push((peer, frame));
        Ok(())
    }

    fn disconnect(&self, peer: NetworkHandle, reason: TxnSyncError) {
        self.disconnected.lock().push((peer, reason));
    }

    fn round_changes(&self) -> watch::Receiver<Round> {
        self.round_tx.subscribe()
    }

    fn pool_changes(&self) -> watch::Receiver<()> {
        self.pool_changed_tx.subscribe()
    }
}

/// Discards every log event; used where a test needs a `Logger` but doesn't
/// care about its output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn incoming_message(&self, _peer: NetworkHandle, _sequence: u64, _size: usize) {}
    fn outgoing_message(&self, _peer: NetworkHandle, _sequence: u64, _size: usize) {}
    fn peer_disconnected(&self, _peer: NetworkHandle, _reason: TxnSyncError) {}
    fn bloom_filter_lost(&self, _peer: NetworkHandle) {}
    fn selection_progress(&self, _peer: NetworkHandle, _selected: usize, _group_counter_cursor: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_pool_is_sorted_by_counter() {
        let pool = sample_pool(50);
        for window in pool.windows(2) {
            assert!(window[0].group_counter < window[1].group_counter);
        }
    }

    #[tokio::test]
    async fn mock_node_records_sent_and_disconnected() {
        use txnsync_types::TransactionGroup;

        let node = MockNode::new();
        let peer = NetworkHandle::repeat_byte(7);
        node.send_message(peer, Bytes::from_static(b"hi")).unwrap();
        node.disconnect(peer, TxnSyncError::QueueFull);

        assert_eq!(node.sent_messages(), vec![(peer, Bytes::from_static(b"hi"))]);
        assert_eq!(node.disconnected_peers(), vec![(peer, TxnSyncError::QueueFull)]);
        let _ = sample_group(1, 1).group_transaction_id();
    }
}
