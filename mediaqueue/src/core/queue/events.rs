//! Observer notifications for the host application.
//!
//! Events are queued on an unbounded channel and consumed by the host's own loop.

use tokio::sync::mpsc;

use crate::core::jobs::Task;
use crate::core::TaskId;

/// Queue change notification
#[derive(Clone, Debug)]
pub enum QueueEvent {
    /// A task entered the queue
    TaskAdded(Task),
    /// A task's status, progress or output changed
    TaskUpdated(Task),
    /// A task was deleted from the queue
    TaskRemoved(TaskId),
    /// The set or order of tasks changed
    QueueChanged,
}

/// Sending side plus the (once-takeable) receiver
#[derive(Debug)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<QueueEvent>,
    rx: Option<mpsc::UnboundedReceiver<QueueEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }

    /// Queues an event; a dropped receiver is ignored.
    pub fn emit(&self, event: QueueEvent) {
        let _ = self.tx.send(event);
    }

    /// Takes the event receiver (can only be called once)
    pub fn take_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<QueueEvent>> {
        self.rx.take()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
