use bytes::Bytes;

use crate::ids::{GroupCounter, GroupTransactionId};

/// The boundary the core treats transaction groups through: a stable ID, a
/// monotone local counter, and a pre-computed encoded length. The core never
/// interprets `payload`; it forwards it opaquely to the pool and to C9 for
/// framing.
pub trait TransactionGroup {
    fn group_transaction_id(&self) -> GroupTransactionId;
    fn group_counter(&self) -> GroupCounter;
    fn encoded_length(&self) -> usize;
}

/// Concrete opaque transaction group: an ordered sequence of signed
/// transactions treated as an atomic unit. The core only ever reads the three
/// fields below; `payload` is handed to downstream validation untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTxGroup {
    pub group_transaction_id: GroupTransactionId,
    pub group_counter: GroupCounter,
    pub payload: Bytes,
}

impl SignedTxGroup {
    pub fn new(group_transaction_id: GroupTransactionId, group_counter: GroupCounter, payload: Bytes) -> Self {
        Self { group_transaction_id, group_counter, payload }
    }
}

impl TransactionGroup for SignedTxGroup {
    fn group_transaction_id(&self) -> GroupTransactionId {
        self.group_transaction_id
    }

    fn group_counter(&self) -> GroupCounter {
        self.group_counter
    }

    fn encoded_length(&self) -> usize {
        self.payload.len()
    }
}
