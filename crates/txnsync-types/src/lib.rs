//! Shared data model for the transaction sync engine: transaction group
//! identity, request-params sharding, and the error kinds that cross crate
//! boundaries.

pub mod error;
pub mod group;
pub mod ids;
pub mod params;

pub use error::TxnSyncError;
pub use group::{SignedTxGroup, TransactionGroup};
pub use ids::{GroupCounter, GroupTransactionId, NetworkHandle, Round};
pub use params::RequestParams;
