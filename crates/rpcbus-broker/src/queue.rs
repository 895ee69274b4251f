//! Per-node bounded delivery queue.
//!
//! Every connected node owns one queue of opaque outbound byte buffers. The
//! router produces into it without ever blocking: a full queue rejects the
//! message and the router synthesizes a failure for the originator instead.
//! The node's transmit task is the sole consumer.

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Fixed queue bound. One slow consumer saturates only its own queue.
pub const QUEUE_CAPACITY: usize = 32;

/// Why a `put` was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue already holds [`QUEUE_CAPACITY`] items.
    #[error("delivery queue full")]
    Full,
    /// The consumer is gone; the node is being torn down.
    #[error("delivery queue closed")]
    Closed,
}

/// Producer half, held in the node's registry entry and cloned by the
/// router for each enqueue.
#[derive(Debug, Clone)]
pub struct DeliveryQueue {
    tx: mpsc::Sender<Vec<u8>>,
}

/// Consumer half, owned by the node's transmit task.
#[derive(Debug)]
pub struct DeliveryReceiver {
    rx: mpsc::Receiver<Vec<u8>>,
}

/// Create a queue pair with the fixed capacity.
pub fn delivery_queue() -> (DeliveryQueue, DeliveryReceiver) {
    let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
    (DeliveryQueue { tx }, DeliveryReceiver { rx })
}

impl DeliveryQueue {
    /// Append a buffer, failing fast when the queue is saturated. Never
    /// blocks the caller.
    pub fn put(&self, buf: Vec<u8>) -> Result<(), QueueError> {
        match self.tx.try_send(buf) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(QueueError::Full),
            Err(TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }
}

impl DeliveryReceiver {
    /// Remove and return the head, waiting until an item is available.
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Stop accepting new items; already-queued buffers are dropped with
    /// the receiver.
    pub fn close(&mut self) {
        self.rx.close();
    }
}
