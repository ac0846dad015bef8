//! End-to-end-ish coverage of the peer-facing algorithms: two peers with
//! identical pools converging on the same transaction set, shard
//! partitioning, out-of-order message reassembly, bloom filter history
//! eviction, bandwidth re-estimation, and the incoming queue's full-disconnect
//! path. Each test drives the public API directly rather than spinning up the
//! full `Driver::run` loop, so the assertions stay tied to one algorithm at a
//! time.

use std::sync::Arc;
use std::time::Duration;

use testing_tools::{sample_pool, MockNode};
use tokio::sync::mpsc;
use txnsync_bloom::XorBuilder;
use txnsync_net::node::NodeConnector;
use txnsync_net::{build_outgoing_message, BuildOutcome, Configuration, IncomingDispatcher, Peer, SyncMessage, TimingParams};
use txnsync_types::{GroupTransactionId, NetworkHandle, RequestParams, Round, TransactionGroup};

fn peer(byte: u8, cfg: &Configuration) -> Peer {
    Peer::new(NetworkHandle::repeat_byte(byte), true, false, cfg, Duration::from_millis(5))
}

#[test]
fn two_peers_with_identical_pools_each_select_everything() {
    let cfg = Configuration::default();
    let pool: Arc<[_]> = Arc::from(sample_pool(40));

    let mut a = peer(1, &cfg);
    a.update_request_params(1, 0); // "everything"
    let mut b = peer(2, &cfg);
    b.update_request_params(1, 0);

    let mut builder = XorBuilder::new(1);
    let out_a = build_outgoing_message(&mut a, &pool, &cfg, Round(1), false, Duration::from_millis(250), Duration::ZERO, &mut builder);
    let out_b = build_outgoing_message(&mut b, &pool, &cfg, Round(1), false, Duration::from_millis(250), Duration::ZERO, &mut builder);

    for outcome in [out_a, out_b] {
        match outcome {
            BuildOutcome::Sent { frame, .. } => {
                let decoded = SyncMessage::decode(&frame).unwrap();
                assert_eq!(decoded.transaction_groups.len(), 40);
            }
            BuildOutcome::Skipped { .. } => panic!("both peers want everything, expected a send"),
        }
    }
}

#[test]
fn sharded_peer_only_selects_its_partition() {
    let cfg = Configuration::default();
    let pool: Arc<[_]> = Arc::from(sample_pool(500));

    let mut p = peer(3, &cfg);
    p.update_request_params(4, 2); // wants id % 4 == 2

    let mut builder = XorBuilder::new(7);
    let outcome = build_outgoing_message(&mut p, &pool, &cfg, Round(1), false, Duration::from_millis(250), Duration::ZERO, &mut builder);

    let BuildOutcome::Sent { frame, .. } = outcome else { panic!("expected a send") };
    let decoded = SyncMessage::decode(&frame).unwrap();
    assert!(!decoded.transaction_groups.is_empty());
    for group in &decoded.transaction_groups {
        let id_prefix = txnsync_types::params::id_prefix_le(group.group_transaction_id().as_slice().try_into().unwrap());
        assert_eq!(id_prefix % 4, 2);
    }
}

#[test]
fn out_of_order_messages_drain_in_sequence_order() {
    let cfg = Configuration::default();
    let mut p = peer(4, &cfg);

    p.incoming_messages
        .enqueue(3, make_envelope(3))
        .unwrap();
    p.incoming_messages
        .enqueue(1, make_envelope(1))
        .unwrap();
    p.incoming_messages
        .enqueue(2, make_envelope(2))
        .unwrap();

    let mut drained = Vec::new();
    let mut expected = p.next_received_message_seq;
    while let Ok(envelope) = p.incoming_messages.pop_sequence(expected) {
        drained.push(envelope.message.sequence_number);
        expected += 1;
    }
    assert_eq!(drained, vec![1, 2, 3]);
}

fn make_envelope(seq: u64) -> txnsync_net::IncomingEnvelope {
    let message = SyncMessage {
        sequence_number: seq,
        round: Round(0),
        request_params: None,
        bloom_filter: None,
        transaction_groups: Vec::new(),
        timing: TimingParams::default(),
    };
    txnsync_net::IncomingEnvelope { message, size: 0 }
}

#[test]
fn bloom_filter_history_evicts_oldest_past_capacity() {
    let cfg = Configuration::default();
    let mut p = peer(5, &cfg);

    // One filter per round, same shard, never cleared -- this should
    // eventually hit MAX_INCOMING_BLOOM_FILTER_HISTORY and start evicting the
    // oldest surviving entry rather than reporting the new one lost.
    for round in 0..250u64 {
        let descriptor = txnsync_bloom::BloomFilterDescriptor {
            kind: txnsync_bloom::BloomFilterKind::Invalid,
            params: RequestParams::everything(),
            contained_range: txnsync_bloom::TransactionsRange::default(),
            encoded_bytes: bytes::Bytes::new(),
            clear_previous: false,
        };
        let lost = p.add_incoming_bloom_filter(Round(round), descriptor, Round(round));
        assert!(!lost, "compaction should always free a slot once eviction kicks in");
    }
}

#[test]
fn rate_estimate_updates_from_round_trip_timing() {
    let mut cfg = Configuration::default();
    cfg.transaction_sync_significant_message_threshold = 1; // any message counts as significant
    let mut p = peer(6, &cfg);

    let ids = vec![GroupTransactionId::repeat_byte(9)];
    p.update_message_sent(Round(1), &ids, Duration::from_millis(1), 1, 10_000);

    let before = p.data_exchange_rate;
    p.update_incoming_message_timing(
        1,                             // ref_txn_block_msg_seq: acks our seq 1
        Duration::ZERO,
        Duration::from_millis(5),      // response_elapsed_time
        &[],
        Round(1),
        Duration::from_millis(200),    // current_time
        Duration::ZERO,
        Duration::from_millis(10),     // peer_latency
        10_000,                       // incoming_message_size
    );

    assert_ne!(p.data_exchange_rate, before, "a significant round-trip sample should move the rate estimate");
}

#[tokio::test]
async fn full_incoming_queue_disconnects_after_failed_retry() {
    let node = MockNode::new();
    let (tx, _rx) = mpsc::channel(1);
    let dispatcher = IncomingDispatcher::new(tx, node.clone(), txnsync_net::TxnSyncMetrics::default());

    let filler = SyncMessage {
        sequence_number: 1,
        round: Round(0),
        request_params: None,
        bloom_filter: None,
        transaction_groups: Vec::new(),
        timing: TimingParams::default(),
    }
    .encode();
    dispatcher.dispatch(NetworkHandle::repeat_byte(1), &filler, || {});

    let second = SyncMessage {
        sequence_number: 2,
        round: Round(0),
        request_params: None,
        bloom_filter: None,
        transaction_groups: Vec::new(),
        timing: TimingParams::default(),
    }
    .encode();

    let peer_two = NetworkHandle::repeat_byte(2);
    dispatcher.dispatch(peer_two, &second, || {});

    let disconnects = node.disconnected_peers();
    assert_eq!(disconnects.last().map(|(p, _)| *p), Some(peer_two));
}
