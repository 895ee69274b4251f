use rpcbus_proto::{ProtoError, ValueKind};
use thiserror::Error;

/// Errors surfaced by the client session.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("session is not initialised")]
    NotInitialized,

    #[error("cannot connect to daemon: {0}")]
    ConnectFailed(String),

    #[error("no return received within the call timeout")]
    CallTimeout,

    /// The daemon reported a routing failure, the peer replied without a
    /// value, or the connection dropped while a call was in flight.
    #[error("call failed")]
    CallFailed,

    #[error("return type mismatch: expected {expected}, got {actual}")]
    TypeMismatch {
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("argument {index} missing")]
    ArgMissing { index: usize },

    #[error("argument {index} type mismatch: expected {expected}, got {actual}")]
    ArgTypeMismatch {
        index: usize,
        expected: ValueKind,
        actual: ValueKind,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}
