//! Peer-to-peer transaction group synchronization: per-peer pacing and
//! selection (`peer`), the reordering heap and deadline scheduler feeding
//! into it, the message builder and wire codec for outgoing traffic
//! (`builder`, `message`), the incoming dispatcher that decodes off network
//! threads (`dispatcher`), and the single-threaded mainloop that ties it all
//! together (`driver`). `node` defines the seam this crate is built against:
//! a host-supplied `NodeConnector` for the pool/transport and a `Logger` for
//! structured diagnostics.

pub mod builder;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod heap;
pub mod message;
pub mod metrics;
pub mod node;
pub mod peer;
pub mod scheduler;

pub use builder::{build_outgoing_message, BuildOutcome};
pub use config::Configuration;
pub use dispatcher::{DispatchedMessage, IncomingDispatcher};
pub use driver::{Driver, DriverHandle};
pub use message::{IncomingEnvelope, SyncMessage, TimingParams};
pub use metrics::{LocalCounters, TxnSyncMetrics};
pub use node::{Logger, NodeConnector, PoolAcceptance, TracingLogger};
pub use peer::{MessageConstructionOps, Peer, PeerOps, PeerState};
pub use scheduler::Scheduler;
