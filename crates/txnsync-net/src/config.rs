//! Tuning constants and the user-facing `Configuration`. Defaults mirror the
//! source's `config.Local` fields that feed the sync service
//! (`setTransactionSyncVariables`), re-expressed as a plain struct with
//! `serde` support for loading from the host's config file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Granularity of the message-pacing clock; `advancePeerState`'s "how many
/// more messages fit in the holdoff window" arithmetic is done in multiples
/// of this.
pub const MESSAGE_TIME_WINDOW: Duration = Duration::from_millis(50);

/// Default per-peer message cadence for non-relay nodes.
pub const DEFAULT_BETA: Duration = Duration::from_millis(250);

pub const MAX_INCOMING_BLOOM_FILTER_HISTORY: usize = 200;
pub const SHORT_TERM_RECENT_TRANSACTIONS_SENT_BUFFER_LENGTH: usize = 5000;
pub const LONG_TERM_RECENT_TRANSACTIONS_SENT_BUFFER_LENGTH: usize = 15000;
pub const PENDING_UNCONFIRMED_REMOTE_MESSAGES: usize = 20;

pub const MIN_DATA_EXCHANGE_RATE_THRESHOLD: u64 = 500 * 1024;
pub const MAX_DATA_EXCHANGE_RATE_THRESHOLD: u64 = 100 * 1024 * 1024 / 8;
pub const DEFAULT_DATA_EXCHANGE_RATE: u64 = MIN_DATA_EXCHANGE_RATE_THRESHOLD;
pub const DEFAULT_RELAY_TO_RELAY_DATA_EXCHANGE_RATE: u64 = 10 * 1024 * 1024 / 8;

pub const BLOOM_FILTER_RETRY_COUNT: usize = 3;
pub const MAX_TRANSACTION_GROUP_TRACKERS: usize = 15;
pub const DEFAULT_SIGNIFICANT_MESSAGE_THRESHOLD: u64 = 50_000;

pub const MAX_ACCEPTED_MSG_SEQ: usize = 64;

/// Host-provided tuning, analogous to the subset of `config.Local` the
/// source's sync service reads (`TransactionSyncDataExchangeRate`,
/// `TransactionSyncSignificantMessageThreshold`, `TxPoolSize`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Whether this node identifies itself as a relay to its peers; affects
    /// both default data-exchange-rate and the outgoing/incoming pacing
    /// state machine.
    pub is_relay: bool,

    /// Forces the data exchange rate instead of letting it be estimated from
    /// traffic; `0` means "estimate it".
    pub transaction_sync_data_exchange_rate: u64,

    /// Overrides the minimum message size used to trigger a data-exchange
    /// rate recalculation; only consulted when
    /// `transaction_sync_data_exchange_rate` is unset.
    pub transaction_sync_significant_message_threshold: u64,

    /// Local transaction pool capacity. Used to derive
    /// `max_bloom_filter_size` the way the source's
    /// `setTransactionSyncVariables` does.
    pub tx_pool_size: usize,

    pub beta: Duration,
    pub max_bounded_incoming_queue: usize,

    /// Soft cap on live peers used by the incoming dispatcher's prune step
    /// (§4.7): once exceeded, the oldest-connected peer is disconnected to
    /// make room before a saturated incoming queue is retried.
    pub max_peers: usize,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            is_relay: false,
            transaction_sync_data_exchange_rate: 0,
            transaction_sync_significant_message_threshold: 0,
            tx_pool_size: 15_000,
            beta: DEFAULT_BETA,
            max_bounded_incoming_queue: 1024,
            max_peers: 1024,
        }
    }
}

impl Configuration {
    /// `TxPoolSize * 5`, matching the source's xor-filter sizing comment: a
    /// bloom filter built over the whole pool should comfortably cover five
    /// pool's worth of ids before its false positive rate becomes a concern.
    pub fn max_bloom_filter_size(&self) -> usize {
        self.tx_pool_size * 5
    }

    pub fn default_data_exchange_rate(&self) -> u64 {
        if self.is_relay {
            DEFAULT_RELAY_TO_RELAY_DATA_EXCHANGE_RATE
        } else {
            DEFAULT_DATA_EXCHANGE_RATE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bloom_filter_size_derives_from_pool_size() {
        let cfg = Configuration { tx_pool_size: 1000, ..Default::default() };
        assert_eq!(cfg.max_bloom_filter_size(), 5000);
    }
}
