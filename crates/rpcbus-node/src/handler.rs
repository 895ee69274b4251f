//! Interface handlers invoked for inbound calls.
//!
//! A node pairs each exported interface with a [`Handler`]. When a call
//! envelope arrives, the receive task looks the handler up by interface
//! name and invokes it inline; the handler's return value is sent back to
//! the caller before the next message is read.

use std::fmt;
use std::sync::Arc;

use rpcbus_proto::{ArgFormat, InterfaceDescriptor, Value};
use thiserror::Error;

use crate::error::ClientError;

/// Failure reported by a handler. The caller sees a generic error value;
/// the message is only logged on the callee side.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Borrowed view over the argument list of an inbound call.
#[derive(Debug, Clone, Copy)]
pub struct Args<'a> {
    values: &'a [Value],
}

impl<'a> Args<'a> {
    pub(crate) fn new(values: &'a [Value]) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn get(&self, index: usize) -> Result<&'a Value, ClientError> {
        self.values
            .get(index)
            .ok_or(ClientError::ArgMissing { index })
    }

    pub fn get_int(&self, index: usize) -> Result<i64, ClientError> {
        let value = self.get(index)?;
        value.as_int().ok_or(ClientError::ArgTypeMismatch {
            index,
            expected: rpcbus_proto::ValueKind::Int,
            actual: value.kind(),
        })
    }

    pub fn get_str(&self, index: usize) -> Result<&'a str, ClientError> {
        let value = self.get(index)?;
        value.as_str().ok_or(ClientError::ArgTypeMismatch {
            index,
            expected: rpcbus_proto::ValueKind::Str,
            actual: value.kind(),
        })
    }

    /// Validates the whole argument list against a format string and
    /// returns the values in order. Stops at the first mismatch.
    pub fn scan(&self, fmt: &str) -> Result<Vec<Value>, ClientError> {
        let fmt = ArgFormat::parse(fmt)?;
        if fmt.len() != self.values.len() {
            return Err(ClientError::Proto(rpcbus_proto::ProtoError::ArityMismatch {
                expected: fmt.len(),
                actual: self.values.len(),
            }));
        }
        let mut out = Vec::with_capacity(self.values.len());
        for (index, expected) in fmt.kinds().iter().enumerate() {
            let value = self.get(index)?;
            if value.kind() != *expected {
                return Err(ClientError::ArgTypeMismatch {
                    index,
                    expected: *expected,
                    actual: value.kind(),
                });
            }
            out.push(value.clone());
        }
        Ok(out)
    }
}

/// Callback for one exported interface.
pub trait Handler: Send + Sync + 'static {
    fn invoke(&self, args: Args<'_>) -> Result<Value, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(Args<'_>) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    fn invoke(&self, args: Args<'_>) -> Result<Value, HandlerError> {
        self(args)
    }
}

/// An exported interface: the wire descriptor plus the handler behind it.
#[derive(Clone)]
pub struct Interface {
    pub(crate) descriptor: InterfaceDescriptor,
    pub(crate) handler: Arc<dyn Handler>,
}

impl Interface {
    pub fn new(name: &str, args: &str, ret: &str, handler: impl Handler) -> Self {
        Self {
            descriptor: InterfaceDescriptor::new(name, args, ret),
            handler: Arc::new(handler),
        }
    }

    pub fn descriptor(&self) -> &InterfaceDescriptor {
        &self.descriptor
    }
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
