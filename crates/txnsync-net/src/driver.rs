//! The sync mainloop (C8): a single-threaded cooperative event loop owning
//! every peer's state. Network threads only ever reach it through the
//! bounded incoming channel built by [`IncomingDispatcher`]; everything else
//! -- scheduling, message construction, heap draining -- happens here and
//! only here, satisfying §5's single-writer-per-peer-field requirement.
//!
//! Re-expressed from the source's goroutine-per-loop design (`mainLoop`
//! selecting on a handful of Go channels) as one `tokio::select!` over a
//! cancellation signal, the incoming queue, two `watch` streams the host
//! ticks on round change and pool change, and a deadline timer driven by
//! the scheduler. See the "Concurrency re-architecture" decision in
//! DESIGN.md for why this reaches for `async`/`select!` instead of mirroring
//! the teacher's manual `Future::poll` style.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::{mpsc, oneshot, watch};
use txnsync_bloom::XorBuilder;
use txnsync_types::{NetworkHandle, Round, TxnSyncError};

use crate::builder::{build_outgoing_message, BuildOutcome};
use crate::config::Configuration;
use crate::dispatcher::{DispatchedMessage, IncomingDispatcher};
use crate::message::IncomingEnvelope;
use crate::metrics::{LocalCounters, TxnSyncMetrics};
use crate::node::{Logger, NodeConnector, TracingLogger};
use crate::peer::Peer;
use crate::scheduler::Scheduler;

/// Handed to the host's network layer. Lets it feed incoming bytes to the
/// driver and get a ready-made [`IncomingDispatcher`] without reaching into
/// the driver's internals.
#[derive(Clone)]
pub struct DriverHandle<N: NodeConnector> {
    incoming_tx: mpsc::Sender<DispatchedMessage>,
    live_peers: Arc<RwLock<Vec<NetworkHandle>>>,
    node: Arc<N>,
    metrics: TxnSyncMetrics,
    max_peers: usize,
}

impl<N: NodeConnector> DriverHandle<N> {
    /// Decodes and queues one incoming frame from `peer`. Safe to call
    /// concurrently from as many network tasks as the host likes; internally
    /// this is exactly [`IncomingDispatcher::dispatch`] with the prune step
    /// wired to this driver's live-peer list and `max_peers` cap.
    pub fn dispatch_incoming(&self, peer: NetworkHandle, raw: &[u8]) {
        let dispatcher = IncomingDispatcher::new(self.incoming_tx.clone(), self.node.clone(), self.metrics.clone());
        let live_peers = self.live_peers.clone();
        let node = self.node.clone();
        let max_peers = self.max_peers;
        dispatcher.dispatch(peer, raw, move || prune_oldest_peer(&live_peers, node.as_ref(), max_peers));
    }
}

/// Disconnects the longest-connected peer if the live set is over
/// `max_peers`. Called only as the dispatcher's retry hook (§4.7): a
/// saturated incoming queue is almost always a sign of too many live peers
/// rather than one slow one, so the cheapest fix is to shed the oldest
/// connection and let the retried send through.
fn prune_oldest_peer<N: NodeConnector>(live_peers: &RwLock<Vec<NetworkHandle>>, node: &N, max_peers: usize) {
    let oldest = {
        let guard = live_peers.read();
        if guard.len() <= max_peers {
            None
        } else {
            guard.first().copied()
        }
    };
    if let Some(handle) = oldest {
        node.disconnect(handle, TxnSyncError::QueueFull);
    }
}

/// Owns all peer state and runs the cooperative mainloop. Constructed once
/// per node; `run` consumes it and returns only on cancellation.
pub struct Driver<N: NodeConnector, L: Logger = TracingLogger> {
    node: Arc<N>,
    logger: L,
    config: Configuration,
    metrics: TxnSyncMetrics,
    counters: Arc<LocalCounters>,

    start: Instant,
    round: Round,

    peers: HashMap<NetworkHandle, Peer>,
    live_peers: Arc<RwLock<Vec<NetworkHandle>>>,
    scheduler: Scheduler,

    incoming_rx: mpsc::Receiver<DispatchedMessage>,
    round_rx: watch::Receiver<Round>,
    pool_rx: watch::Receiver<()>,
    cancel_rx: oneshot::Receiver<()>,

    xor_builder: XorBuilder,
}

impl<N: NodeConnector> Driver<N, TracingLogger> {
    pub fn new(node: Arc<N>, config: Configuration) -> (Self, DriverHandle<N>, oneshot::Sender<()>) {
        Self::with_logger(node, config, TracingLogger)
    }
}

impl<N: NodeConnector, L: Logger> Driver<N, L> {
    pub fn with_logger(node: Arc<N>, config: Configuration, logger: L) -> (Self, DriverHandle<N>, oneshot::Sender<()>) {
        let (incoming_tx, incoming_rx) = mpsc::channel(config.max_bounded_incoming_queue);
        let round_rx = node.round_changes();
        let pool_rx = node.pool_changes();
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let metrics = TxnSyncMetrics::default();
        let live_peers = Arc::new(RwLock::new(Vec::new()));
        let round = node.current_round();
        let max_peers = config.max_peers;

        let driver = Self {
            node: node.clone(),
            logger,
            config,
            metrics: metrics.clone(),
            counters: Arc::new(LocalCounters::default()),
            start: Instant::now(),
            round,
            peers: HashMap::new(),
            live_peers: live_peers.clone(),
            scheduler: Scheduler::new(),
            incoming_rx,
            round_rx,
            pool_rx,
            cancel_rx,
            xor_builder: XorBuilder::new(rand::random()),
        };

        let handle = DriverHandle { incoming_tx, live_peers, node, metrics, max_peers };
        (driver, handle, cancel_tx)
    }

    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    /// Runs until `cancel_tx` fires or is dropped. Never returns otherwise.
    pub async fn run(mut self) {
        loop {
            let deadline = self.scheduler.next_deadline();
            let sleep = match deadline {
                Some(at) => {
                    let remaining = at.saturating_sub(self.now());
                    tokio::time::sleep(remaining)
                }
                None => tokio::time::sleep(Duration::from_secs(3600)),
            };
            tokio::pin!(sleep);

            tokio::select! {
                biased;

                _ = &mut self.cancel_rx => {
                    return;
                }

                Some(dispatched) = self.incoming_rx.recv() => {
                    self.handle_incoming(dispatched);
                }

                Ok(()) = self.round_rx.changed() => {
                    let round = *self.round_rx.borrow_and_update();
                    self.handle_round_change(round);
                }

                Ok(()) = self.pool_rx.changed() => {
                    self.pool_rx.borrow_and_update();
                    self.handle_pool_change();
                }

                _ = &mut sleep => {
                    self.drain_due_peers();
                }
            }
        }
    }

    fn register_peer(&mut self, handle: NetworkHandle, is_outgoing: bool) {
        if self.peers.contains_key(&handle) {
            return;
        }
        let latency = self.node.peer_latency(handle);
        let peer = Peer::new(handle, is_outgoing, self.config.is_relay, &self.config, latency);
        self.peers.insert(handle, peer);
        self.live_peers.write().push(handle);
        self.metrics.created_peers_total.increment(1);
        self.scheduler.schedule_peer(handle, self.now());
    }

    fn drop_peer(&mut self, handle: NetworkHandle, reason: TxnSyncError) {
        if self.peers.remove(&handle).is_none() {
            return;
        }
        self.live_peers.write().retain(|h| h != &handle);
        self.scheduler.remove(&handle);
        self.logger.peer_disconnected(handle, reason);
        self.node.disconnect(handle, reason);
    }

    fn handle_incoming(&mut self, dispatched: DispatchedMessage) {
        let DispatchedMessage { peer, sequence, message, size } = dispatched;

        self.register_peer(peer, false);
        let Some(peer_state) = self.peers.get_mut(&peer) else { return };

        self.logger.incoming_message(peer, sequence, size);

        if let Err(err) = peer_state.incoming_messages.enqueue(sequence, IncomingEnvelope { message, size }) {
            self.drop_peer(peer, err);
            return;
        }

        self.metrics.unprocessed_incoming_messages.set(peer_state.incoming_messages.len() as f64);
        self.drain_peer_heap(peer);
    }

    /// Drains every in-order message now sitting at the head of `peer`'s
    /// ordering heap, per §4.8: pop while the next expected sequence is
    /// available, stop (without error) on `SequenceMismatch` or `HeapEmpty`.
    fn drain_peer_heap(&mut self, peer: NetworkHandle) {
        loop {
            let Some(peer_state) = self.peers.get_mut(&peer) else { return };
            let expected = peer_state.next_received_message_seq;
            let envelope = match peer_state.incoming_messages.pop_sequence(expected) {
                Ok(envelope) => envelope,
                Err(_) => return,
            };
            peer_state.next_received_message_seq += 1;
            self.deliver_message(peer, envelope);
        }
    }

    fn deliver_message(&mut self, peer: NetworkHandle, envelope: IncomingEnvelope) {
        let now = self.now();
        let round = self.round;
        let IncomingEnvelope { message, size } = envelope;

        let Some(peer_state) = self.peers.get_mut(&peer) else { return };
        peer_state.last_round = peer_state.last_round.max(message.round);

        if let Some(modulator_offset) = message.request_params {
            peer_state.update_request_params(modulator_offset.modulator, modulator_offset.offset);
        }

        if let Some(descriptor) = message.bloom_filter {
            self.metrics.decoded_bloom_filters_total.increment(1);
            let lost = peer_state.add_incoming_bloom_filter(message.round, descriptor, round);
            if lost {
                self.counters.note_bloom_filter_lost();
                self.logger.bloom_filter_lost(peer);
            }
        }

        let peer_latency = peer_state.cached_latency;
        peer_state.update_incoming_message_timing(
            message.timing.ref_txn_block_msg_seq,
            message.timing.next_msg_min_delay,
            message.timing.response_elapsed_time,
            &message.timing.accepted_msg_seq,
            round,
            now,
            Duration::ZERO,
            peer_latency,
            size,
        );

        if !message.transaction_groups.is_empty() {
            peer_state.update_incoming_transaction_groups(&message.transaction_groups);
            let acceptance = self.node.submit_transaction_groups(peer, &message.transaction_groups, message.sequence_number);
            if acceptance.backlog_full {
                tracing::debug!(peer_id = %peer, "transaction pool backlog full, pacing down");
            }
        }

        // A fresh incoming message always means this peer is owed a prompt
        // reply; (re)schedule it for the next mainloop tick rather than
        // waiting for whatever deadline it already had queued.
        self.scheduler.schedule_peer(peer, now);
    }

    fn handle_round_change(&mut self, round: Round) {
        self.round = round;
        for (handle, peer) in self.peers.iter_mut() {
            peer.cached_latency = self.node.peer_latency(*handle);
            // Round turnover is the driver's timer for retrying a shard the
            // tracker stalled on: a harmless no-op unless an earlier bloom
            // false positive left the current checkpoint ahead of the one
            // before it.
            peer.retry_stalled_shard();
        }
    }

    /// A pool shrink can invalidate a peer's pinned
    /// `message_series_pending_transactions` snapshot (see the "Open
    /// Question" decision in DESIGN.md): if the snapshot is now longer than
    /// the live pool, drop it so the next selection re-reads a fresh one
    /// instead of indexing past the end.
    fn handle_pool_change(&mut self) {
        let pool_size = self.node.transaction_pool_size();
        for peer in self.peers.values_mut() {
            if let Some(series) = &peer.message_series_pending_transactions {
                if series.len() > pool_size {
                    peer.message_series_pending_transactions = None;
                }
            }
        }
    }

    fn drain_due_peers(&mut self) {
        let now = self.now();
        while let Some(handle) = self.scheduler.pop_due(now) {
            self.tick_peer(handle, now);
        }
    }

    fn tick_peer(&mut self, handle: NetworkHandle, now: Duration) {
        let pool = self.node.pending_transactions();
        let is_relay = self.config.is_relay;
        let beta = self.config.beta;
        let round = self.round;

        let Some(peer) = self.peers.get_mut(&handle) else { return };

        let outcome = build_outgoing_message(peer, &pool, &self.config, round, is_relay, beta, now, &mut self.xor_builder);

        match outcome {
            BuildOutcome::Sent { frame, reschedule, sequence, bloom_built, .. } => {
                let frame_len = frame.len();
                if let Err(err) = self.node.send_message(handle, frame) {
                    self.drop_peer(handle, err);
                    return;
                }
                if bloom_built {
                    self.metrics.encoded_bloom_filters_total.increment(1);
                }
                self.logger.outgoing_message(handle, sequence, frame_len);
                self.scheduler.schedule_peer(handle, now + reschedule);
            }
            BuildOutcome::Skipped { reschedule } => {
                if let Some(delay) = reschedule {
                    self.scheduler.schedule_peer(handle, now + delay);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bytes::Bytes;
    use tokio::sync::watch;
    use txnsync_types::SignedTxGroup;

    use super::*;
    use crate::node::PoolAcceptance;

    struct StubNode {
        round_tx: watch::Sender<Round>,
        pool_tx: watch::Sender<()>,
        sent: Mutex<Vec<(NetworkHandle, Bytes)>>,
        disconnects: Mutex<Vec<(NetworkHandle, TxnSyncError)>>,
    }

    impl StubNode {
        fn new() -> Arc<Self> {
            let (round_tx, _) = watch::channel(Round::default());
            let (pool_tx, _) = watch::channel(());
            Arc::new(Self { round_tx, pool_tx, sent: Mutex::new(Vec::new()), disconnects: Mutex::new(Vec::new()) })
        }
    }

    impl NodeConnector for StubNode {
        fn current_round(&self) -> Round {
            *self.round_tx.borrow()
        }
        fn peer_latency(&self, _peer: NetworkHandle) -> Duration {
            Duration::from_millis(10)
        }
        fn pending_transactions(&self) -> Arc<[SignedTxGroup]> {
            Arc::from(Vec::new())
        }
        fn transaction_pool_size(&self) -> usize {
            0
        }
        fn submit_transaction_groups(&self, _peer: NetworkHandle, _groups: &[SignedTxGroup], _message_seq: u64) -> PoolAcceptance {
            PoolAcceptance { accepted: 0, backlog_full: false }
        }
        fn send_message(&self, peer: NetworkHandle, frame: Bytes) -> Result<(), TxnSyncError> {
            self.sent.lock().unwrap().push((peer, frame));
            Ok(())
        }
        fn disconnect(&self, peer: NetworkHandle, reason: TxnSyncError) {
            self.disconnects.lock().unwrap().push((peer, reason));
        }
        fn round_changes(&self) -> watch::Receiver<Round> {
            self.round_tx.subscribe()
        }
        fn pool_changes(&self) -> watch::Receiver<()> {
            self.pool_tx.subscribe()
        }
    }

    #[tokio::test]
    async fn incoming_message_delivers_in_sequence_order() {
        let node = StubNode::new();
        let (mut driver, handle, _cancel) = Driver::new(node.clone(), Configuration::default());

        let peer_id = NetworkHandle::repeat_byte(3);
        driver.register_peer(peer_id, false);

        let msg1 = crate::message::SyncMessage {
            sequence_number: 1,
            round: Round(0),
            request_params: None,
            bloom_filter: None,
            transaction_groups: Vec::new(),
            timing: crate::message::TimingParams::default(),
        }
        .encode();
        let msg2 = crate::message::SyncMessage {
            sequence_number: 2,
            round: Round(0),
            request_params: None,
            bloom_filter: None,
            transaction_groups: Vec::new(),
            timing: crate::message::TimingParams::default(),
        }
        .encode();

        handle.dispatch_incoming(peer_id, &msg2);
        handle.dispatch_incoming(peer_id, &msg1);

        let first = driver.incoming_rx.recv().await.unwrap();
        driver.handle_incoming(first);
        let second = driver.incoming_rx.recv().await.unwrap();
        driver.handle_incoming(second);

        let peer = driver.peers.get(&peer_id).unwrap();
        assert_eq!(peer.next_received_message_seq, 3);
    }

    #[tokio::test]
    async fn oldest_peer_is_pruned_past_capacity() {
        let node = StubNode::new();
        let mut config = Configuration::default();
        config.max_peers = 1;
        let (mut driver, _handle, _cancel) = Driver::new(node.clone(), config);

        let first = NetworkHandle::repeat_byte(1);
        let second = NetworkHandle::repeat_byte(2);
        driver.register_peer(first, false);
        driver.register_peer(second, false);

        prune_oldest_peer(&driver.live_peers, node.as_ref(), 1);

        assert_eq!(node.disconnects.lock().unwrap().first().map(|(p, _)| *p), Some(first));
    }

    #[tokio::test]
    async fn prune_is_a_no_op_under_capacity() {
        let node = StubNode::new();
        let live_peers = Arc::new(RwLock::new(vec![NetworkHandle::repeat_byte(1)]));
        prune_oldest_peer(&live_peers, node.as_ref(), 4);
        assert!(node.disconnects.lock().unwrap().is_empty());
    }
}
