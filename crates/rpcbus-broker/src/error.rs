//! Broker error types.

use thiserror::Error;

/// Errors surfaced by the broker's public API.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Proto(#[from] rpcbus_proto::ProtoError),
}
