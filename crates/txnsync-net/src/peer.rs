//! Per-peer state: the pacing state machine, the recently-sent and
//! recently-received-bloom-filter bookkeeping, and the transaction
//! selection algorithm that decides what a peer still needs to see.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use txnsync_bloom::BloomFilterDescriptor;
use txnsync_types::{GroupCounter, NetworkHandle, Round, SignedTxGroup, TransactionGroup};

use crate::cache::TransactionCache;
use crate::config::{
    self, BLOOM_FILTER_RETRY_COUNT, DEFAULT_SIGNIFICANT_MESSAGE_THRESHOLD, MAX_ACCEPTED_MSG_SEQ, MAX_DATA_EXCHANGE_RATE_THRESHOLD,
    MAX_INCOMING_BLOOM_FILTER_HISTORY, MAX_TRANSACTION_GROUP_TRACKERS, MIN_DATA_EXCHANGE_RATE_THRESHOLD,
};
use crate::heap::MessageOrderingHeap;

/// Stage the peer's message pacing is in. Touched only by the driver's
/// single-threaded state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Before the first message timeout has elapsed; for an outgoing peer
    /// this means an incoming message just arrived and a reply is due.
    Startup,
    /// A message was just sent; holding off before sending another.
    Holdsoff,
    /// The holdoff period expired without a new trigger.
    Interrupt,
    /// Outgoing peers on a relay only: the next message must carry a bloom
    /// filter and nothing else.
    LateBloom,
}

impl Default for PeerState {
    fn default() -> Self {
        PeerState::Startup
    }
}

bitflags::bitflags! {
    /// Actions the driver must take as a result of advancing a peer's state.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PeerOps: u8 {
        const SEND_MESSAGE        = 0b0001;
        const SET_INTERRUPTIBLE   = 0b0010;
        const CLEAR_INTERRUPTIBLE = 0b0100;
        const RESCHEDULE          = 0b1000;
    }
}

bitflags::bitflags! {
    /// Which parts of an outgoing message need to be built.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageConstructionOps: u8 {
        const BLOOM_FILTER          = 0b0001;
        const TRANSACTIONS          = 0b0010;
        const NEXT_MIN_DELAY        = 0b0100;
        const UPDATE_REQUEST_PARAMS = 0b1000;
    }
}

#[derive(Debug, Clone)]
struct IncomingBloomFilter {
    descriptor: BloomFilterDescriptor,
    round: Round,
}

/// Per-`(offset, modulator)` checkpoint of how far the selection scan has
/// progressed, with `BLOOM_FILTER_RETRY_COUNT` historical checkpoints so a
/// shard can be rolled back and rescanned after a bloom false positive.
#[derive(Debug, Clone)]
struct RequestParamsGroupCounterState {
    offset: u8,
    modulator: u8,
    group_counters: [GroupCounter; BLOOM_FILTER_RETRY_COUNT],
}

/// Tracks, per requested shard, how far selection has scanned. A linear scan
/// over a handful of entries; `MAX_TRANSACTION_GROUP_TRACKERS` keeps it
/// small by design.
#[derive(Debug, Clone, Default)]
pub struct TransactionGroupCounterTracker(Vec<RequestParamsGroupCounterState>);

impl TransactionGroupCounterTracker {
    fn index(&self, offset: u8, modulator: u8) -> Option<usize> {
        self.0.iter().position(|s| s.offset == offset && s.modulator == modulator)
    }

    pub fn get(&self, offset: u8, modulator: u8) -> GroupCounter {
        self.index(offset, modulator).map(|i| self.0[i].group_counters[0]).unwrap_or(0)
    }

    pub fn set(&mut self, offset: u8, modulator: u8, counter: GroupCounter) {
        if let Some(i) = self.index(offset, modulator) {
            self.0[i].group_counters[0] = counter;
            return;
        }
        let mut group_counters = [0; BLOOM_FILTER_RETRY_COUNT];
        group_counters[0] = counter;
        let state = RequestParamsGroupCounterState { offset, modulator, group_counters };
        if self.0.len() == MAX_TRANSACTION_GROUP_TRACKERS {
            self.0.remove(0);
        }
        self.0.push(state);
    }

    /// Rolls the checkpoints for `(offset, modulator)` back by one slot, so
    /// the next selection rescans transaction groups it previously skipped
    /// (e.g. because of a bloom false positive) without rescanning
    /// everything. A no-op if there's no later checkpoint to roll back to.
    pub fn roll(&mut self, offset: u8, modulator: u8) {
        let Some(i) = self.index(offset, modulator) else { return };
        let counters = &mut self.0[i].group_counters;
        if counters[1] >= counters[0] {
            return;
        }
        let first = counters[0];
        counters.rotate_left(1);
        counters[BLOOM_FILTER_RETRY_COUNT - 1] = first;
    }
}

/// Local view of a remote peer the sync engine is talking to.
pub struct Peer {
    pub network_handle: NetworkHandle,
    pub is_outgoing: bool,
    pub significant_message_threshold: u64,
    pub state: PeerState,

    pub last_round: Round,
    pub incoming_messages: MessageOrderingHeap<crate::message::IncomingEnvelope>,
    pub next_received_message_seq: u64,

    recent_incoming_bloom_filters: Vec<IncomingBloomFilter>,
    pub recent_sent_transactions: TransactionCache,
    recent_sent_transactions_round: Round,

    pub requested_transactions_modulator: u8,
    pub requested_transactions_offset: u8,

    last_sent_message_sequence_number: u64,
    last_sent_message_round: Round,
    last_sent_message_timestamp: Duration,
    last_sent_message_size: usize,
    last_sent_bloom_filter: Option<BloomFilterDescriptor>,

    last_confirmed_message_seq_received: u64,
    last_received_message_local_round: Round,
    last_received_message_timestamp: Duration,
    last_received_message_size: usize,
    pub last_received_message_next_msg_min_delay: Duration,

    pub data_exchange_rate: u64,
    pub cached_latency: Duration,

    pub local_transactions_modulator: u8,
    pub local_transactions_base_offset: u8,

    last_transaction_selection_tracker: TransactionGroupCounterTracker,

    pub next_state_timestamp: Option<Duration>,
    pub message_series_pending_transactions: Option<Arc<[SignedTxGroup]>>,

    transaction_pool_ack_tx: mpsc::UnboundedSender<u64>,
    transaction_pool_ack_rx: mpsc::UnboundedReceiver<u64>,
    transaction_pool_ack_messages: Vec<u64>,

    last_selected_transactions_count: usize,

    /// Monotone outbound sequence counter; unlike `last_sent_message_sequence_number`
    /// this is never reset on acknowledgement, satisfying the "outbound messages to a
    /// given peer carry strictly increasing sequence numbers" ordering guarantee.
    next_outbound_sequence: u64,
}

/// Result of [`Peer::select_pending_transactions`].
pub struct Selection {
    pub groups: Vec<SignedTxGroup>,
    pub has_more_pending: bool,
}

impl Peer {
    pub fn new(network_handle: NetworkHandle, is_outgoing: bool, is_local_node_relay: bool, cfg: &config::Configuration, latency: Duration) -> Self {
        let (transaction_pool_ack_tx, transaction_pool_ack_rx) = mpsc::unbounded_channel();

        let mut data_exchange_rate = cfg.default_data_exchange_rate();
        let mut significant_message_threshold = DEFAULT_SIGNIFICANT_MESSAGE_THRESHOLD;
        let mut requested_transactions_modulator = 0;

        if is_local_node_relay {
            requested_transactions_modulator = 1;
        }
        if cfg.transaction_sync_data_exchange_rate > 0 {
            data_exchange_rate = cfg.transaction_sync_data_exchange_rate;
            significant_message_threshold = u64::MAX;
        }
        if cfg.transaction_sync_significant_message_threshold > 0 && cfg.transaction_sync_data_exchange_rate == 0 {
            significant_message_threshold = cfg.transaction_sync_significant_message_threshold;
        }

        Self {
            network_handle,
            is_outgoing,
            significant_message_threshold,
            state: PeerState::Startup,
            last_round: Round::default(),
            incoming_messages: MessageOrderingHeap::new(MAX_ACCEPTED_MSG_SEQ),
            next_received_message_seq: 1,
            recent_incoming_bloom_filters: Vec::new(),
            recent_sent_transactions: TransactionCache::new(
                config::SHORT_TERM_RECENT_TRANSACTIONS_SENT_BUFFER_LENGTH,
                config::LONG_TERM_RECENT_TRANSACTIONS_SENT_BUFFER_LENGTH,
                config::PENDING_UNCONFIRMED_REMOTE_MESSAGES,
            ),
            recent_sent_transactions_round: Round::default(),
            requested_transactions_modulator,
            requested_transactions_offset: 0,
            last_sent_message_sequence_number: 0,
            last_sent_message_round: Round::default(),
            last_sent_message_timestamp: Duration::ZERO,
            last_sent_message_size: 0,
            last_sent_bloom_filter: None,
            last_confirmed_message_seq_received: 0,
            last_received_message_local_round: Round::default(),
            last_received_message_timestamp: Duration::ZERO,
            last_received_message_size: 0,
            last_received_message_next_msg_min_delay: Duration::ZERO,
            data_exchange_rate,
            cached_latency: latency,
            local_transactions_modulator: 0,
            local_transactions_base_offset: 0,
            last_transaction_selection_tracker: TransactionGroupCounterTracker::default(),
            next_state_timestamp: None,
            message_series_pending_transactions: None,
            transaction_pool_ack_tx,
            transaction_pool_ack_rx,
            transaction_pool_ack_messages: Vec::with_capacity(MAX_ACCEPTED_MSG_SEQ),
            last_selected_transactions_count: 0,
            next_outbound_sequence: 1,
        }
    }

    /// Reserves and returns the next outbound sequence number for a message
    /// to this peer.
    pub fn next_outbound_sequence(&mut self) -> u64 {
        let seq = self.next_outbound_sequence;
        self.next_outbound_sequence += 1;
        seq
    }

    pub fn last_confirmed_message_seq_received(&self) -> u64 {
        self.last_confirmed_message_seq_received
    }

    /// How long ago the last incoming message from this peer was received,
    /// relative to `now`; `Duration::ZERO` if none has arrived yet. Reported
    /// back to the peer as `MsgSync.ResponseElapsedTime` so it can subtract
    /// our own processing time out of its round-trip bandwidth estimate.
    pub fn response_elapsed_time(&self, now: Duration) -> Duration {
        if self.last_received_message_timestamp.is_zero() {
            return Duration::ZERO;
        }
        now.saturating_sub(self.last_received_message_timestamp)
    }

    pub fn last_sent_bloom_filter(&self) -> Option<&BloomFilterDescriptor> {
        self.last_sent_bloom_filter.as_ref()
    }

    pub fn transaction_pool_ack_sender(&self) -> mpsc::UnboundedSender<u64> {
        self.transaction_pool_ack_tx.clone()
    }

    fn dequeue_pending_transaction_pool_ack_messages(&mut self) {
        while let Ok(seq) = self.transaction_pool_ack_rx.try_recv() {
            if self.transaction_pool_ack_messages.len() == MAX_ACCEPTED_MSG_SEQ {
                self.transaction_pool_ack_messages.remove(0);
            }
            self.transaction_pool_ack_messages.push(seq);
        }
    }

    pub fn take_accepted_messages(&mut self) -> Vec<u64> {
        self.dequeue_pending_transaction_pool_ack_messages();
        std::mem::replace(&mut self.transaction_pool_ack_messages, Vec::with_capacity(MAX_ACCEPTED_MSG_SEQ))
    }

    /// Picks the next batch of transaction groups this peer still needs,
    /// respecting its requested shard, its estimated bandwidth window, what
    /// it's already confirmed to have via incoming bloom filters, and what
    /// was already sent and not yet flushed by a round turnover.
    pub fn select_pending_transactions(&mut self, pool: &Arc<[SignedTxGroup]>, send_window: Duration, round: Round, bloom_filter_size: usize) -> Selection {
        if self.last_round < round.sub_saturate(1) || self.requested_transactions_modulator == 0 {
            return Selection { groups: Vec::new(), has_more_pending: false };
        }

        let pending: Arc<[SignedTxGroup]> = match &self.message_series_pending_transactions {
            Some(series) => series.clone(),
            None => pool.clone(),
        };

        if pending.is_empty() {
            return Selection { groups: Vec::new(), has_more_pending: false };
        }

        if self.recent_sent_transactions_round != round {
            self.recent_sent_transactions.reset();
            self.recent_sent_transactions_round = round;
        }

        let window_length_bytes = (send_window.as_secs_f64() * self.data_exchange_rate as f64) as i64 - bloom_filter_size as i64;

        let last_selection_group_counter = self.last_transaction_selection_tracker.get(self.requested_transactions_offset, self.requested_transactions_modulator);

        let start_index = pending.partition_point(|g| g.group_counter() < last_selection_group_counter);

        let effective_bloom_filters: Vec<&IncomingBloomFilter> = self
            .recent_incoming_bloom_filters
            .iter()
            .rev()
            .filter(|ribf| {
                ribf.descriptor.params.modulator == self.requested_transactions_modulator && ribf.descriptor.params.offset == self.requested_transactions_offset
            })
            .collect();

        let mut selected: Vec<SignedTxGroup> = Vec::with_capacity((self.last_selected_transactions_count * 2).min(pending.len() - start_index));
        let mut accumulated_size: i64 = 0;
        let mut window_reached = false;
        let mut has_more = false;
        let mut idx = start_index;

        'scan: while idx < pending.len() {
            let group = &pending[idx];
            let id_prefix = txnsync_types::params::id_prefix_le(group.group_transaction_id().as_slice().try_into().unwrap());

            if self.requested_transactions_modulator > 1 && id_prefix % self.requested_transactions_modulator as u64 != self.requested_transactions_offset as u64 {
                idx += 1;
                continue;
            }

            if self.recent_sent_transactions.contained(&group.group_transaction_id()) {
                idx += 1;
                continue;
            }

            for ribf in &effective_bloom_filters {
                if let Ok(filter) = ribf.descriptor.decode_filter() {
                    if filter.test(id_prefix) {
                        idx += 1;
                        continue 'scan;
                    }
                }
            }

            if window_reached {
                has_more = true;
                break;
            }

            accumulated_size += group.encoded_length() as i64;
            selected.push(group.clone());

            if accumulated_size > window_length_bytes {
                window_reached = true;
            }
            idx += 1;
        }

        self.last_selected_transactions_count = selected.len();

        if start_index < pending.len() {
            if idx == pending.len() {
                if idx > 0 {
                    self.last_transaction_selection_tracker.set(
                        self.requested_transactions_offset,
                        self.requested_transactions_modulator,
                        pending[idx - 1].group_counter() + 1,
                    );
                }
            } else {
                self.last_transaction_selection_tracker.set(self.requested_transactions_offset, self.requested_transactions_modulator, pending[idx].group_counter());
            }
        }

        if !has_more {
            self.message_series_pending_transactions = None;
        } else if self.message_series_pending_transactions.is_none() {
            self.message_series_pending_transactions = Some(pending.clone());
        }

        Selection { groups: selected, has_more_pending: has_more }
    }

    /// Rolls this shard's selection checkpoints back one slot, letting the
    /// next selection rescan groups skipped only because of a bloom false
    /// positive.
    pub fn retry_stalled_shard(&mut self) {
        self.last_transaction_selection_tracker.roll(self.requested_transactions_offset, self.requested_transactions_modulator);
    }

    pub fn set_local_request_params(&mut self, offset: u64, modulator: u64) {
        let modulator = modulator.min(255) as u8;
        self.local_transactions_modulator = modulator;
        if modulator != 0 {
            self.local_transactions_base_offset = (offset % modulator as u64) as u8;
        }
    }

    pub fn update_request_params(&mut self, modulator: u8, offset: u8) {
        self.requested_transactions_modulator = modulator;
        self.requested_transactions_offset = offset;
    }

    pub fn update_message_sent(&mut self, round: Round, selected_ids: &[txnsync_types::GroupTransactionId], timestamp: Duration, sequence_number: u64, message_size: usize) {
        self.recent_sent_transactions.add_slice(selected_ids, sequence_number, timestamp);
        self.last_sent_message_sequence_number = sequence_number;
        self.last_sent_message_round = round;
        self.last_sent_message_timestamp = timestamp;
        self.last_sent_message_size = message_size;
    }

    pub fn update_sent_bloom_filter(&mut self, descriptor: BloomFilterDescriptor) {
        if !descriptor.encoded_bytes.is_empty() {
            self.last_sent_bloom_filter = Some(descriptor);
        }
    }

    /// Prunes stale entries from the recent-incoming-bloom-filters list and
    /// inserts `descriptor`, matching the source's compact-in-place then
    /// append-or-evict-oldest algorithm. Returns `true` if the new filter had
    /// to be dropped because no room could be made for it -- this should be
    /// unreachable given the compaction above always frees a slot once the
    /// list is at capacity, but is surfaced rather than silently ignored (see
    /// the "new filter lost" decision in DESIGN.md).
    pub fn add_incoming_bloom_filter(&mut self, round: Round, descriptor: BloomFilterDescriptor, current_round: Round) -> bool {
        let min_round = current_round.sub_saturate(2);
        if round < min_round {
            return false;
        }

        let clear_previous = descriptor.clear_previous;
        let params = descriptor.params;
        let new_entry = IncomingBloomFilter { descriptor, round };

        let elem_ok = |entry: &IncomingBloomFilter| -> bool {
            if entry.round < min_round {
                return false;
            }
            if clear_previous && entry.descriptor.params == params {
                return false;
            }
            true
        };

        let mut oldest_round = current_round + 1;
        let mut first_of_oldest: Option<usize> = None;
        let mut kept = Vec::with_capacity(self.recent_incoming_bloom_filters.len());
        for entry in self.recent_incoming_bloom_filters.drain(..) {
            if elem_ok(&entry) {
                if entry.round < oldest_round {
                    oldest_round = entry.round;
                    first_of_oldest = Some(kept.len());
                }
                kept.push(entry);
            }
        }
        self.recent_incoming_bloom_filters = kept;

        if self.recent_incoming_bloom_filters.len() < MAX_INCOMING_BLOOM_FILTER_HISTORY {
            self.recent_incoming_bloom_filters.push(new_entry);
            return false;
        }
        if let Some(i) = first_of_oldest {
            self.recent_incoming_bloom_filters[i] = new_entry;
            return false;
        }
        true
    }

    pub fn update_incoming_transaction_groups(&mut self, groups: &[SignedTxGroup]) {
        for group in groups {
            self.recent_sent_transactions.add(group.group_transaction_id());
        }
    }

    /// Recomputes `data_exchange_rate` from a round-trip timing sample when
    /// the incoming message acknowledges our last sent message on the same
    /// round and the transmitted size clears `significant_message_threshold`.
    #[allow(clippy::too_many_arguments)]
    pub fn update_incoming_message_timing(
        &mut self,
        ref_txn_block_msg_seq: u64,
        next_msg_min_delay: Duration,
        response_elapsed_time: Duration,
        accepted_msg_seqs: &[u64],
        current_round: Round,
        current_time: Duration,
        time_in_queue: Duration,
        peer_latency: Duration,
        incoming_message_size: usize,
    ) {
        self.last_confirmed_message_seq_received = ref_txn_block_msg_seq;

        if self.last_confirmed_message_seq_received == self.last_sent_message_sequence_number
            && self.last_sent_message_round == current_round
            && self.last_sent_message_timestamp > Duration::ZERO
        {
            let time_since_sent = (current_time.saturating_sub(time_in_queue)).saturating_sub(self.last_sent_message_timestamp);
            let network_message_size = (self.last_sent_message_size + incoming_message_size) as u64;

            if response_elapsed_time > Duration::ZERO && peer_latency > Duration::ZERO && time_since_sent > response_elapsed_time + peer_latency && network_message_size >= self.significant_message_threshold {
                let network_transmit_time = time_since_sent - response_elapsed_time - peer_latency;
                if !network_transmit_time.is_zero() {
                    let mut rate = (network_message_size as f64 / network_transmit_time.as_secs_f64()) as u64;
                    rate = rate.clamp(MIN_DATA_EXCHANGE_RATE_THRESHOLD, MAX_DATA_EXCHANGE_RATE_THRESHOLD);
                    self.data_exchange_rate = rate;
                }
            }

            self.last_sent_message_sequence_number = 0;
            self.last_sent_message_round = Round::default();
            self.last_sent_message_timestamp = Duration::ZERO;
            self.last_sent_message_size = 0;
        }

        self.last_received_message_local_round = current_round;
        self.last_received_message_timestamp = current_time.saturating_sub(time_in_queue);
        self.last_received_message_size = incoming_message_size;
        self.last_received_message_next_msg_min_delay = next_msg_min_delay;
        for &accepted_msg_seq in accepted_msg_seqs {
            self.recent_sent_transactions.acknowledge(accepted_msg_seq);
        }
    }

    /// Drives the pacing state machine forward. Called when a schedule fires
    /// for this peer, before any message is built.
    pub fn advance_state(&mut self, current_time: Duration, is_relay: bool) -> PeerOps {
        let mut ops = PeerOps::empty();

        if is_relay {
            if self.is_outgoing {
                match self.state {
                    PeerState::Startup => {
                        self.next_state_timestamp = Some(current_time + self.last_received_message_next_msg_min_delay);
                        let messages_count = duration_div(self.last_received_message_next_msg_min_delay, config::MESSAGE_TIME_WINDOW);
                        self.state = if messages_count <= 2 { PeerState::LateBloom } else { PeerState::Holdsoff };
                        ops |= PeerOps::SEND_MESSAGE;
                    }
                    PeerState::Holdsoff => {
                        let remaining = self.next_state_timestamp.unwrap_or(Duration::ZERO).saturating_sub(current_time);
                        let messages_count = duration_div(remaining, config::MESSAGE_TIME_WINDOW);
                        if messages_count <= 2 {
                            self.state = PeerState::LateBloom;
                        }
                        ops |= PeerOps::SEND_MESSAGE;
                    }
                    PeerState::LateBloom => {
                        ops |= PeerOps::SEND_MESSAGE;
                    }
                    PeerState::Interrupt => {}
                }
            } else {
                match self.state {
                    PeerState::Startup => {
                        self.state = PeerState::Holdsoff;
                        ops |= PeerOps::SEND_MESSAGE;
                    }
                    PeerState::Holdsoff => {
                        ops |= PeerOps::SEND_MESSAGE;
                    }
                    PeerState::Interrupt | PeerState::LateBloom => {}
                }
            }
        } else {
            match self.state {
                PeerState::Startup => {
                    self.state = PeerState::Holdsoff;
                    ops |= PeerOps::SEND_MESSAGE;
                }
                PeerState::Holdsoff => {
                    if self.next_state_timestamp.is_none() {
                        self.state = PeerState::Interrupt;
                        ops |= PeerOps::SET_INTERRUPTIBLE | PeerOps::RESCHEDULE;
                    } else {
                        ops |= PeerOps::SEND_MESSAGE;
                    }
                }
                PeerState::Interrupt => {
                    self.state = PeerState::Holdsoff;
                    ops |= PeerOps::SEND_MESSAGE | PeerOps::CLEAR_INTERRUPTIBLE;
                }
                PeerState::LateBloom => {}
            }
        }

        ops
    }

    /// Decides which pieces of an outgoing message to build, given the
    /// current pacing state.
    pub fn message_construction_ops(&self, is_relay: bool, fetch_transactions: bool) -> MessageConstructionOps {
        let mut ops = MessageConstructionOps::empty();

        if is_relay {
            if self.is_outgoing {
                match self.state {
                    PeerState::LateBloom => {
                        if self.local_transactions_modulator != 0 {
                            ops |= MessageConstructionOps::BLOOM_FILTER;
                        }
                    }
                    PeerState::Holdsoff => {
                        ops |= MessageConstructionOps::TRANSACTIONS;
                    }
                    _ => {}
                }
            } else {
                if self.requested_transactions_modulator != 0 {
                    ops |= MessageConstructionOps::TRANSACTIONS;
                    if self.next_state_timestamp.is_none() && self.local_transactions_modulator != 0 {
                        ops |= MessageConstructionOps::BLOOM_FILTER;
                    }
                }
                if self.next_state_timestamp.is_none() {
                    ops |= MessageConstructionOps::NEXT_MIN_DELAY;
                }
            }
            ops |= MessageConstructionOps::UPDATE_REQUEST_PARAMS;
        } else {
            ops |= MessageConstructionOps::TRANSACTIONS;
            if fetch_transactions {
                match self.local_transactions_modulator {
                    0 => {}
                    1 => {
                        if self.next_state_timestamp.is_none() {
                            ops |= MessageConstructionOps::BLOOM_FILTER;
                        }
                    }
                    _ => ops |= MessageConstructionOps::BLOOM_FILTER,
                }
                ops |= MessageConstructionOps::UPDATE_REQUEST_PARAMS;
            }
        }

        ops
    }

    /// Computes the delay before the next scheduling tick for this peer,
    /// after a message (partial or final) was just sent.
    pub fn next_schedule_offset(&mut self, is_relay: bool, beta: Duration, partial_message: bool, current_time: Duration) -> (Duration, PeerOps) {
        if partial_message {
            return self.next_schedule_offset_partial(is_relay, beta, current_time);
        }
        self.next_schedule_offset_final(is_relay, beta, current_time)
    }

    fn next_schedule_offset_partial(&mut self, is_relay: bool, beta: Duration, current_time: Duration) -> (Duration, PeerOps) {
        if is_relay {
            if self.is_outgoing {
                if self.state == PeerState::Holdsoff {
                    return (config::MESSAGE_TIME_WINDOW, PeerOps::RESCHEDULE);
                }
                return (Duration::ZERO, PeerOps::empty());
            }
            if let Some(next_state_timestamp) = self.next_state_timestamp {
                if next_state_timestamp > Duration::ZERO {
                    if current_time + config::MESSAGE_TIME_WINDOW * 2 < next_state_timestamp {
                        return (config::MESSAGE_TIME_WINDOW, PeerOps::RESCHEDULE);
                    }
                    self.next_state_timestamp = None;
                    return (next_state_timestamp.saturating_sub(current_time), PeerOps::RESCHEDULE);
                }
            }
            self.next_state_timestamp = Some(current_time + 2 * beta);
            return (config::MESSAGE_TIME_WINDOW, PeerOps::RESCHEDULE);
        }

        if let Some(next_state_timestamp) = self.next_state_timestamp {
            if next_state_timestamp > Duration::ZERO {
                if current_time + config::MESSAGE_TIME_WINDOW * 2 < next_state_timestamp {
                    return (config::MESSAGE_TIME_WINDOW, PeerOps::RESCHEDULE);
                }
                self.next_state_timestamp = None;
                self.message_series_pending_transactions = None;
                self.state = PeerState::Holdsoff;
                return (next_state_timestamp.saturating_sub(current_time), PeerOps::RESCHEDULE | PeerOps::CLEAR_INTERRUPTIBLE);
            }
        }
        self.next_state_timestamp = Some(current_time + 2 * beta);
        (config::MESSAGE_TIME_WINDOW, PeerOps::RESCHEDULE)
    }

    fn next_schedule_offset_final(&mut self, is_relay: bool, beta: Duration, current_time: Duration) -> (Duration, PeerOps) {
        if is_relay {
            if self.is_outgoing {
                if self.state == PeerState::Holdsoff {
                    self.state = PeerState::LateBloom;
                    let mut extrapolated = config::MESSAGE_TIME_WINDOW;
                    if let Some(filter) = &self.last_sent_bloom_filter {
                        if !filter.contained_range.is_empty() {
                            extrapolated = Duration::from_secs_f64(filter.encoded_bytes.len() as f64 * self.data_exchange_rate as f64);
                        }
                    }
                    let next_state_timestamp = self.next_state_timestamp.unwrap_or(Duration::ZERO);
                    let next = next_state_timestamp.saturating_sub(extrapolated).saturating_sub(current_time);
                    self.next_state_timestamp = None;
                    return (next, PeerOps::RESCHEDULE);
                }
                self.next_state_timestamp = None;
                return (Duration::ZERO, PeerOps::empty());
            }
            if let Some(next_state_timestamp) = self.next_state_timestamp {
                if next_state_timestamp > Duration::ZERO {
                    self.next_state_timestamp = None;
                    return (next_state_timestamp.saturating_sub(current_time), PeerOps::RESCHEDULE);
                }
            }
            self.next_state_timestamp = None;
            return (beta * 2, PeerOps::RESCHEDULE);
        }

        if let Some(next_state_timestamp) = self.next_state_timestamp {
            if next_state_timestamp > Duration::ZERO {
                self.next_state_timestamp = None;
                return (next_state_timestamp.saturating_sub(current_time), PeerOps::RESCHEDULE);
            }
        }
        (beta, PeerOps::RESCHEDULE)
    }
}

fn duration_div(a: Duration, b: Duration) -> u64 {
    if b.is_zero() {
        return u64::MAX;
    }
    (a.as_nanos() / b.as_nanos().max(1)) as u64
}

/// Filters out outgoing peers, used by the relay rebroadcast path which only
/// ever targets peers that connected to us.
pub fn incoming_peers_only<'a>(peers: impl Iterator<Item = &'a Peer>) -> Vec<&'a Peer> {
    peers.filter(|p| !p.is_outgoing).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_rolls_back_one_checkpoint() {
        let mut tracker = TransactionGroupCounterTracker::default();
        tracker.set(0, 4, 10);
        tracker.set(0, 4, 20);
        tracker.set(0, 4, 30);
        assert_eq!(tracker.get(0, 4), 30);
        tracker.roll(0, 4);
        // `set` only ever writes slot 0 (mirrors the original), so there was
        // never a `20` checkpoint to roll back to -- rolling rotates the
        // single populated slot out and leaves the shard at its zero value.
        assert_eq!(tracker.get(0, 4), 0);
    }

    #[test]
    fn tracker_evicts_oldest_past_capacity() {
        let mut tracker = TransactionGroupCounterTracker::default();
        for m in 0..(MAX_TRANSACTION_GROUP_TRACKERS as u8 + 1) {
            tracker.set(0, m, m as u64);
        }
        assert_eq!(tracker.get(0, 0), 0);
        assert_eq!(tracker.get(0, MAX_TRANSACTION_GROUP_TRACKERS as u8), MAX_TRANSACTION_GROUP_TRACKERS as u64);
    }

    #[test]
    fn non_relay_state_machine_cycles_startup_holdsoff_interrupt() {
        let cfg = config::Configuration::default();
        let mut peer = Peer::new(NetworkHandle::repeat_byte(1), true, false, &cfg, Duration::from_millis(50));

        let ops = peer.advance_state(Duration::ZERO, false);
        assert_eq!(peer.state, PeerState::Holdsoff);
        assert!(ops.contains(PeerOps::SEND_MESSAGE));

        let ops = peer.advance_state(Duration::from_millis(10), false);
        assert_eq!(peer.state, PeerState::Interrupt);
        assert!(ops.contains(PeerOps::SET_INTERRUPTIBLE));

        let ops = peer.advance_state(Duration::from_millis(20), false);
        assert_eq!(peer.state, PeerState::Holdsoff);
        assert!(ops.contains(PeerOps::CLEAR_INTERRUPTIBLE));
    }
}
