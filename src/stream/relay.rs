//! Unbounded FIFO handoff between the generation thread and the consumer.

use std::fmt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Identity of one generation run (the whole pipeline, or one model call
/// inside it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One entry on the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayItem {
    Token(String),
    /// Terminal marker for the run with this id.
    End(RunId),
}

/// Creates a connected sender/receiver pair.
pub fn relay() -> (RelaySender, RelayReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RelaySender { tx }, RelayReceiver { rx })
}

/// Producer half. Cheap to clone; every clone feeds the same queue.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: UnboundedSender<RelayItem>,
}

impl RelaySender {
    /// Enqueues an item without blocking. Items pushed after the receiver has
    /// been dropped are discarded.
    pub fn push(&self, item: RelayItem) {
        if self.tx.send(item).is_err() {
            tracing::trace!("relay receiver dropped; discarding item");
        }
    }
}

/// Consumer half.
#[derive(Debug)]
pub struct RelayReceiver {
    rx: UnboundedReceiver<RelayItem>,
}

impl RelayReceiver {
    /// Blocks the calling thread until an item is available. Returns `None`
    /// once every sender is gone and the queue is drained.
    ///
    /// Panics if called from within an async execution context; use
    /// [`pop_async`](Self::pop_async) there.
    pub fn pop(&mut self) -> Option<RelayItem> {
        self.rx.blocking_recv()
    }

    /// Waits for the next item without blocking the executor.
    pub async fn pop_async(&mut self) -> Option<RelayItem> {
        self.rx.recv().await
    }
}
