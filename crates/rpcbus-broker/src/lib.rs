//! rpcbus broker daemon.
//!
//! The broker accepts TCP connections from nodes, tracks their registered
//! interfaces, and routes `call`/`return` envelopes between them.
//!
//! ## Architecture
//!
//! - **Accept loop** ([`Broker`]): one registry entry and one task pair per
//!   accepted connection.
//! - **Connection pair**: a receive task that hands every read to the router
//!   synchronously, and a transmit task that drains that node's delivery
//!   queue — inbound processing never waits on another node's outbound
//!   backpressure.
//! - **[`NodeRegistry`]**: connection-id and name lookup for live nodes.
//! - **[`Router`]**: the protocol state machine over the four inbound
//!   envelope kinds.
//! - **[`DeliveryQueue`]**: bounded per-node FIFO; a saturated queue fails
//!   the offending message instead of stalling the router.

pub mod error;
pub mod queue;
pub mod registry;
pub mod router;
pub mod server;

pub use error::BrokerError;
pub use queue::{delivery_queue, DeliveryQueue, DeliveryReceiver, QueueError, QUEUE_CAPACITY};
pub use registry::{ConnId, NodeEntry, NodeRegistry};
pub use router::{Router, RouterVerdict};
pub use server::{Broker, BrokerConfig};
