//! Incoming-message dispatch (C7). Runs on network threads, never on the
//! mainloop: parses the wire envelope, decodes the embedded bloom filter and
//! transaction groups, and hands the fully-decoded message to the mainloop
//! over a bounded channel. Per §9's "Concurrency re-architecture" design
//! note, the per-peer ordering heap itself is touched only by the driver --
//! the dispatcher's sole cross-thread artifact is this bounded MPSC, which
//! keeps every peer field single-writer (§5).

use std::sync::Arc;

use tokio::sync::mpsc;
use txnsync_types::{NetworkHandle, TxnSyncError};

use crate::message::SyncMessage;
use crate::metrics::TxnSyncMetrics;
use crate::node::NodeConnector;

/// A fully parsed, not-yet-ordered incoming message, destined for a
/// specific peer's ordering heap once the mainloop drains it off the
/// channel.
#[derive(Debug)]
pub struct DispatchedMessage {
    pub peer: NetworkHandle,
    pub sequence: u64,
    pub message: SyncMessage,
    pub size: usize,
}

/// Parses and validates incoming wire bytes, then enqueues onto the bounded
/// channel the driver drains. Cheap to clone; every network-handling task
/// gets its own handle backed by the same underlying channel.
#[derive(Clone)]
pub struct IncomingDispatcher<N: NodeConnector> {
    sender: mpsc::Sender<DispatchedMessage>,
    node: Arc<N>,
    metrics: TxnSyncMetrics,
}

impl<N: NodeConnector> IncomingDispatcher<N> {
    pub fn new(sender: mpsc::Sender<DispatchedMessage>, node: Arc<N>, metrics: TxnSyncMetrics) -> Self {
        Self { sender, node, metrics }
    }

    /// Parses `raw` as a sync message from `peer` and queues it for the
    /// mainloop. On any decode failure the peer is disconnected immediately
    /// and nothing is queued, matching §7's "errors on the incoming path
    /// always trigger peer eviction."
    ///
    /// `prune_peers` is invoked once, with no arguments, if the channel is
    /// found full on the first attempt; it's expected to disconnect some
    /// set of stale/low-priority peers so a retried send has a chance of
    /// succeeding. If the channel is still full after that one retry, `peer`
    /// itself -- the one whose message couldn't be queued -- is
    /// disconnected with `QueueFull`, per §7.
    pub fn dispatch(&self, peer: NetworkHandle, raw: &[u8], prune_peers: impl FnOnce()) {
        let message = match SyncMessage::decode(raw) {
            Ok(message) => message,
            Err(err) => {
                self.node.disconnect(peer, err);
                return;
            }
        };

        self.metrics.incoming_messages_total.increment(1);
        if message.bloom_filter.is_some() {
            self.metrics.decoded_bloom_filters_total.increment(1);
        }

        let dispatched = DispatchedMessage { peer, sequence: message.sequence_number, message, size: raw.len() };

        if let Err(err) = self.try_enqueue(dispatched) {
            match err {
                mpsc::error::TrySendError::Full(dispatched) => {
                    prune_peers();
                    if let Err(mpsc::error::TrySendError::Full(_)) = self.try_enqueue(dispatched) {
                        self.metrics.peer_disconnects_queue_full_total.increment(1);
                        self.node.disconnect(peer, TxnSyncError::QueueFull);
                    }
                }
                mpsc::error::TrySendError::Closed(_) => {
                    self.node.disconnect(peer, TxnSyncError::QueueFull);
                }
            }
        }
    }

    fn try_enqueue(&self, message: DispatchedMessage) -> Result<(), mpsc::error::TrySendError<DispatchedMessage>> {
        self.sender.try_send(message)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::{BufMut, BytesMut};
    use tokio::sync::watch;
    use txnsync_types::{Round, SignedTxGroup};

    use super::*;
    use crate::message::{SyncMessage, TimingParams, WIRE_VERSION};

    struct MockNode {
        disconnects: std::sync::Mutex<Vec<(NetworkHandle, TxnSyncError)>>,
    }

    impl NodeConnector for MockNode {
        fn current_round(&self) -> Round {
            Round::default()
        }
        fn peer_latency(&self, _peer: NetworkHandle) -> Duration {
            Duration::ZERO
        }
        fn pending_transactions(&self) -> Arc<[SignedTxGroup]> {
            Arc::from(Vec::new())
        }
        fn transaction_pool_size(&self) -> usize {
            0
        }
        fn submit_transaction_groups(&self, _peer: NetworkHandle, _groups: &[SignedTxGroup], _message_seq: u64) -> crate::node::PoolAcceptance {
            crate::node::PoolAcceptance { accepted: 0, backlog_full: false }
        }
        fn send_message(&self, _peer: NetworkHandle, _frame: bytes::Bytes) -> Result<(), TxnSyncError> {
            Ok(())
        }
        fn disconnect(&self, peer: NetworkHandle, reason: TxnSyncError) {
            self.disconnects.lock().unwrap().push((peer, reason));
        }
        fn round_changes(&self) -> watch::Receiver<Round> {
            watch::channel(Round::default()).1
        }
        fn pool_changes(&self) -> watch::Receiver<()> {
            watch::channel(()).1
        }
    }

    fn sample_message(seq: u64) -> Vec<u8> {
        SyncMessage {
            sequence_number: seq,
            round: Round(1),
            request_params: None,
            bloom_filter: None,
            transaction_groups: Vec::new(),
            timing: TimingParams::default(),
        }
        .encode()
        .to_vec()
    }

    #[tokio::test]
    async fn malformed_message_disconnects_peer_without_enqueuing() {
        let node = Arc::new(MockNode { disconnects: Default::default() });
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = IncomingDispatcher::new(tx, node.clone(), TxnSyncMetrics::default());

        let mut garbage = BytesMut::new();
        garbage.put_u8(99);
        garbage.put_u64(0);
        dispatcher.dispatch(NetworkHandle::repeat_byte(1), &garbage, || {});

        assert!(rx.try_recv().is_err());
        assert_eq!(node.disconnects.lock().unwrap()[0].1, TxnSyncError::UnsupportedVersion);
    }

    #[tokio::test]
    async fn valid_message_is_enqueued() {
        let node = Arc::new(MockNode { disconnects: Default::default() });
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = IncomingDispatcher::new(tx, node, TxnSyncMetrics::default());

        dispatcher.dispatch(NetworkHandle::repeat_byte(2), &sample_message(7), || {});

        let dispatched = rx.try_recv().expect("message should be queued");
        assert_eq!(dispatched.sequence, 7);
    }

    #[tokio::test]
    async fn full_queue_invokes_prune_then_disconnects_on_retry_failure() {
        let node = Arc::new(MockNode { disconnects: Default::default() });
        let (tx, _rx) = mpsc::channel(1);
        let dispatcher = IncomingDispatcher::new(tx, node.clone(), TxnSyncMetrics::default());

        // fill the one slot
        dispatcher.dispatch(NetworkHandle::repeat_byte(1), &sample_message(1), || {});

        let prune_calls = Arc::new(AtomicUsize::new(0));
        let prune_calls_clone = prune_calls.clone();
        dispatcher.dispatch(NetworkHandle::repeat_byte(2), &sample_message(2), move || {
            prune_calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(prune_calls.load(Ordering::SeqCst), 1);
        let disconnects = node.disconnects.lock().unwrap();
        assert_eq!(disconnects.last(), Some(&(NetworkHandle::repeat_byte(2), TxnSyncError::QueueFull)));
    }
}
