//! Message builder (C6): the central per-peer algorithm invoked when the
//! scheduler fires. Stages 1-4 of §4.6 are mostly already implemented as
//! `Peer` methods (`advance_state`, `message_construction_ops`,
//! `select_pending_transactions`, `next_schedule_offset`); this module
//! orchestrates them, builds the bloom filter via `txnsync_bloom`, and frames
//! the result with `SyncMessage`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use txnsync_bloom::{make_bloom_filter, BloomFilterDescriptor, XorBuilder};
use txnsync_types::{params::id_prefix_le, RequestParams, Round, SignedTxGroup, TransactionGroup};

use crate::config::Configuration;
use crate::message::{SyncMessage, TimingParams};
use crate::peer::{MessageConstructionOps, Peer, PeerOps};

/// What came out of a scheduling tick for one peer.
pub enum BuildOutcome {
    /// A message was built and should be handed to the transport.
    Sent { frame: Bytes, partial: bool, reschedule: Duration, sequence: u64, bloom_built: bool },
    /// Nothing was sent this tick (e.g. waiting out an interruptible
    /// holdoff); `reschedule` is `None` when the peer doesn't need a new
    /// scheduler entry at all (already has one pending, e.g. after
    /// `SET_INTERRUPTIBLE`).
    Skipped { reschedule: Option<Duration> },
}

/// Runs one scheduling tick for `peer`: advances its pacing state, decides
/// what an outgoing message needs, selects transactions and/or builds a
/// bloom filter, frames the wire message, and computes the next deadline.
///
/// `pool` is the host's current pending-transaction snapshot, already
/// sorted by ascending `GroupCounter` (the `NodeConnector::pending_transactions`
/// contract).
pub fn build_outgoing_message(
    peer: &mut Peer,
    pool: &Arc<[SignedTxGroup]>,
    config: &Configuration,
    round: Round,
    is_relay: bool,
    beta: Duration,
    now: Duration,
    xor_builder: &mut XorBuilder,
) -> BuildOutcome {
    let ops = peer.advance_state(now, is_relay);

    if !ops.contains(PeerOps::SEND_MESSAGE) {
        let reschedule = if ops.contains(PeerOps::RESCHEDULE) { Some(beta) } else { None };
        return BuildOutcome::Skipped { reschedule };
    }

    let construction_ops = peer.message_construction_ops(is_relay, true);

    let mut bloom_filter: Option<BloomFilterDescriptor> = None;
    if construction_ops.contains(MessageConstructionOps::BLOOM_FILTER) {
        let params = RequestParams { modulator: peer.local_transactions_modulator, offset: peer.local_transactions_base_offset };
        let hint = peer.last_sent_bloom_filter();
        let pool_iter = pool.iter().map(|g| (g.group_counter(), id_prefix_le(g.group_transaction_id().as_slice().try_into().unwrap())));
        let mut descriptor = make_bloom_filter(params, hint, pool_iter, xor_builder);
        let reused = hint.is_some_and(|h| h.encoded_bytes == descriptor.encoded_bytes && h.params == descriptor.params);
        descriptor.clear_previous = !reused;
        bloom_filter = Some(descriptor);
    }

    let bloom_size = bloom_filter.as_ref().map(|d| d.encoded_bytes.len()).unwrap_or(0);

    let mut selected_groups = Vec::new();
    let mut partial = false;
    if construction_ops.contains(MessageConstructionOps::TRANSACTIONS) {
        let selection = peer.select_pending_transactions(pool, beta, round, bloom_size);
        partial = selection.has_more_pending;
        selected_groups = selection.groups;
    }

    let request_params =
        construction_ops.contains(MessageConstructionOps::UPDATE_REQUEST_PARAMS).then(|| RequestParams { modulator: peer.local_transactions_modulator, offset: peer.local_transactions_base_offset });

    let next_msg_min_delay = if construction_ops.contains(MessageConstructionOps::NEXT_MIN_DELAY) { beta * 2 } else { Duration::ZERO };

    let sequence_number = peer.next_outbound_sequence();
    let accepted_msg_seq = peer.take_accepted_messages();
    let timing = TimingParams {
        ref_txn_block_msg_seq: peer.last_confirmed_message_seq_received(),
        response_elapsed_time: peer.response_elapsed_time(now),
        accepted_msg_seq,
        next_msg_min_delay,
    };

    let selected_ids: Vec<_> = selected_groups.iter().map(|g| g.group_transaction_id()).collect();
    let bloom_built = bloom_filter.as_ref().is_some_and(|d| !d.encoded_bytes.is_empty());

    let message = SyncMessage { sequence_number, round, request_params, bloom_filter: bloom_filter.clone(), transaction_groups: selected_groups, timing };
    let frame = message.encode();

    peer.update_message_sent(round, &selected_ids, now, sequence_number, frame.len());
    if let Some(descriptor) = bloom_filter {
        peer.update_sent_bloom_filter(descriptor);
    }

    let _ = config; // reserved: bloom sizing and pool bounds derive from config at call sites that build `pool`
    let (reschedule, _reschedule_ops) = peer.next_schedule_offset(is_relay, beta, partial, now);

    BuildOutcome::Sent { frame, partial, reschedule, sequence: sequence_number, bloom_built }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use txnsync_types::{GroupTransactionId, NetworkHandle};

    use super::*;
    use crate::config::Configuration;

    fn group(byte: u8, counter: u64) -> SignedTxGroup {
        SignedTxGroup::new(GroupTransactionId::repeat_byte(byte), counter, Bytes::from_static(b"payload"))
    }

    #[test]
    fn first_tick_sends_a_message_for_a_fresh_non_relay_peer() {
        let cfg = Configuration::default();
        let mut peer = Peer::new(NetworkHandle::repeat_byte(9), true, false, &cfg, Duration::from_millis(20));
        peer.update_request_params(1, 0);

        let pool: Arc<[SignedTxGroup]> = Arc::from(vec![group(1, 1), group(2, 2)]);
        let mut xor_builder = XorBuilder::new(1);

        let outcome = build_outgoing_message(&mut peer, &pool, &cfg, Round(1), false, Duration::from_millis(250), Duration::ZERO, &mut xor_builder);

        match outcome {
            BuildOutcome::Sent { frame, .. } => {
                let decoded = SyncMessage::decode(&frame).unwrap();
                assert_eq!(decoded.transaction_groups.len(), 2);
            }
            BuildOutcome::Skipped { .. } => panic!("expected a message on the first tick"),
        }
    }

    #[test]
    fn peer_wanting_nothing_sends_no_transactions() {
        let cfg = Configuration::default();
        let mut peer = Peer::new(NetworkHandle::repeat_byte(9), true, false, &cfg, Duration::from_millis(20));
        peer.update_request_params(0, 0);

        let pool: Arc<[SignedTxGroup]> = Arc::from(vec![group(1, 1)]);
        let mut xor_builder = XorBuilder::new(1);

        let outcome = build_outgoing_message(&mut peer, &pool, &cfg, Round(1), false, Duration::from_millis(250), Duration::ZERO, &mut xor_builder);

        match outcome {
            BuildOutcome::Sent { frame, .. } => {
                let decoded = SyncMessage::decode(&frame).unwrap();
                assert!(decoded.transaction_groups.is_empty());
            }
            BuildOutcome::Skipped { .. } => {}
        }
    }
}
