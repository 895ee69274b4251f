//! rpcbus wire protocol.
//!
//! Every message exchanged between a node and the broker is a single JSON
//! document (an [`Envelope`]) sent in one socket write. There is no length
//! framing: a message must fit in [`MAX_MESSAGE_SIZE`] bytes and a single
//! read yields exactly one envelope.
//!
//! Argument and return values travel as tagged records
//! (`{"type":"%d","val":42}`); the tag must match the format declared for
//! that position when the interface was registered.

pub mod envelope;
pub mod format;
pub mod value;

pub use envelope::{Api, Envelope, InterfaceDescriptor, DAEMON_NODE, MAX_MESSAGE_SIZE};
pub use format::{ArgFormat, RetFormat};
pub use value::{Value, ValueKind};

use thiserror::Error;

/// Errors from encoding, decoding, or format-string handling.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// JSON serialization or deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The serialized envelope exceeds the wire limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A format string contains something other than `%d`/`%s` codes.
    #[error("bad format string: {0:?}")]
    BadFormat(String),

    /// The number of values does not match the format string.
    #[error("argument count mismatch: format declares {expected}, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    /// A value's type tag disagrees with the declared format at a position.
    #[error("argument {index} type mismatch: declared {expected}, got {actual}")]
    TypeMismatch {
        index: usize,
        expected: ValueKind,
        actual: ValueKind,
    },
}
