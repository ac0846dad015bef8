//! Two-tier recently-sent-transaction cache. A short-term ring remembers
//! every id sent out, tagged with the sequence number of the message it went
//! out in; once the peer's feedback confirms that sequence was accepted, the
//! short-term entries for it migrate into a long-term ring that never needs
//! acknowledgement again. `contained` checks both tiers.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use txnsync_types::GroupTransactionId;

#[derive(Debug, Clone)]
struct PendingEntry {
    id: GroupTransactionId,
    sequence: u64,
}

/// Ring cache of ids sent to one peer, split into an unacknowledged
/// short-term tier and a confirmed long-term tier.
#[derive(Debug)]
pub struct TransactionCache {
    short_term_capacity: usize,
    long_term_capacity: usize,
    max_pending_sequences: usize,

    short_term: VecDeque<PendingEntry>,
    short_term_set: HashMap<GroupTransactionId, usize>,
    long_term: VecDeque<GroupTransactionId>,
    long_term_set: HashMap<GroupTransactionId, ()>,

    /// Sequence numbers still awaiting acknowledgement, in send order. Used
    /// to bound how many unconfirmed messages worth of ids we hold before
    /// evicting the oldest regardless of acknowledgement.
    pending_sequences: VecDeque<u64>,
}

impl TransactionCache {
    pub fn new(short_term_capacity: usize, long_term_capacity: usize, max_pending_sequences: usize) -> Self {
        Self {
            short_term_capacity,
            long_term_capacity,
            max_pending_sequences,
            short_term: VecDeque::new(),
            short_term_set: HashMap::new(),
            long_term: VecDeque::new(),
            long_term_set: HashMap::new(),
            pending_sequences: VecDeque::new(),
        }
    }

    /// Remembers a single id with no associated sequence number (e.g. ids
    /// learned from an incoming message rather than one we sent).
    pub fn add(&mut self, id: GroupTransactionId) {
        self.insert_short_term(id, 0);
    }

    /// Remembers a batch of ids sent together under `sequence` at `_timestamp`.
    pub fn add_slice(&mut self, ids: &[GroupTransactionId], sequence: u64, _timestamp: Duration) {
        if ids.is_empty() {
            return;
        }
        if !self.pending_sequences.contains(&sequence) {
            self.pending_sequences.push_back(sequence);
            while self.pending_sequences.len() > self.max_pending_sequences {
                self.pending_sequences.pop_front();
            }
        }
        for &id in ids {
            self.insert_short_term(id, sequence);
        }
    }

    fn insert_short_term(&mut self, id: GroupTransactionId, sequence: u64) {
        if self.short_term_set.contains_key(&id) || self.long_term_set.contains_key(&id) {
            return;
        }
        self.short_term.push_back(PendingEntry { id, sequence });
        self.short_term_set.insert(id, self.short_term.len() - 1);
        while self.short_term.len() > self.short_term_capacity {
            if let Some(evicted) = self.short_term.pop_front() {
                self.short_term_set.remove(&evicted.id);
            }
            self.reindex_short_term();
        }
    }

    fn reindex_short_term(&mut self) {
        self.short_term_set.clear();
        for (idx, entry) in self.short_term.iter().enumerate() {
            self.short_term_set.insert(entry.id, idx);
        }
    }

    /// Migrates every short-term entry sent under a sequence number `<=
    /// ack_seq` into the long-term tier, since the peer has now confirmed it
    /// received them.
    pub fn acknowledge(&mut self, ack_seq: u64) {
        if ack_seq == 0 {
            return;
        }
        let mut remaining = VecDeque::with_capacity(self.short_term.len());
        for entry in self.short_term.drain(..) {
            if entry.sequence != 0 && entry.sequence <= ack_seq {
                self.push_long_term(entry.id);
            } else {
                remaining.push_back(entry);
            }
        }
        self.short_term = remaining;
        self.reindex_short_term();
        self.pending_sequences.retain(|&s| s > ack_seq);
    }

    fn push_long_term(&mut self, id: GroupTransactionId) {
        if self.long_term_set.contains_key(&id) {
            return;
        }
        self.long_term.push_back(id);
        self.long_term_set.insert(id, ());
        while self.long_term.len() > self.long_term_capacity {
            if let Some(evicted) = self.long_term.pop_front() {
                self.long_term_set.remove(&evicted);
            }
        }
    }

    pub fn contained(&self, id: &GroupTransactionId) -> bool {
        self.short_term_set.contains_key(id) || self.long_term_set.contains_key(id)
    }

    /// Drops the short-term tier at the start of a new round, giving
    /// previously sent-but-unconfirmed transactions another chance of being
    /// selected. The long-term tier is untouched.
    pub fn reset(&mut self) {
        self.short_term.clear();
        self.short_term_set.clear();
        self.pending_sequences.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.short_term.is_empty() && self.long_term.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> GroupTransactionId {
        GroupTransactionId::repeat_byte(byte)
    }

    #[test]
    fn contains_after_add_slice() {
        let mut cache = TransactionCache::new(4, 8, 4);
        cache.add_slice(&[id(1), id(2)], 10, Duration::ZERO);
        assert!(cache.contained(&id(1)));
        assert!(cache.contained(&id(2)));
        assert!(!cache.contained(&id(3)));
    }

    #[test]
    fn acknowledge_migrates_to_long_term_and_survives_reset() {
        let mut cache = TransactionCache::new(4, 8, 4);
        cache.add_slice(&[id(1)], 10, Duration::ZERO);
        cache.acknowledge(10);
        cache.reset();
        assert!(cache.contained(&id(1)));
    }

    #[test]
    fn acknowledge_migrates_all_sequences_up_to_and_including_ack_seq() {
        let mut cache = TransactionCache::new(8, 8, 4);
        cache.add_slice(&[id(1)], 8, Duration::ZERO);
        cache.add_slice(&[id(2)], 9, Duration::ZERO);
        cache.add_slice(&[id(3)], 11, Duration::ZERO);
        cache.acknowledge(9);
        cache.reset();
        assert!(cache.contained(&id(1)));
        assert!(cache.contained(&id(2)));
        assert!(!cache.contained(&id(3)));
    }

    #[test]
    fn reset_drops_unacknowledged_short_term_entries() {
        let mut cache = TransactionCache::new(4, 8, 4);
        cache.add_slice(&[id(1)], 10, Duration::ZERO);
        cache.reset();
        assert!(!cache.contained(&id(1)));
    }

    #[test]
    fn short_term_capacity_evicts_oldest() {
        let mut cache = TransactionCache::new(2, 8, 4);
        cache.add(id(1));
        cache.add(id(2));
        cache.add(id(3));
        assert!(!cache.contained(&id(1)));
        assert!(cache.contained(&id(3)));
    }
}
