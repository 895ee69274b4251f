//! rpcbus client library.
//!
//! A node opens one [`ClientSession`] to the daemon, registers a name and
//! a set of [`Interface`]s, and from then on can both call interfaces on
//! other nodes and serve inbound calls through its handlers.
//!
//! Calls look synchronous to the caller: [`ClientSession::call`] sends the
//! envelope and parks on the result until the matching `return` arrives or
//! the timeout fires. The session's receive task keeps serving inbound
//! calls while a call of ours is parked, so two nodes calling each other
//! never deadlock.

pub mod error;
pub mod handler;
pub mod session;

pub use error::ClientError;
pub use handler::{Args, Handler, HandlerError, Interface};
pub use session::{ClientSession, SessionConfig, SessionState};

pub use rpcbus_proto::{Value, ValueKind};
