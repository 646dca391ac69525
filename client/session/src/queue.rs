//! Outbound message queue used while the session cannot send.

use bayeux_wire::Message;
use parking_lot::Mutex;

/// Thread-safe queue of outbound application messages.
///
/// Messages accumulate here while the session is batching or not yet ready
/// to send. The queue is drained atomically so that two threads flushing at
/// the same time can never send the same message twice.
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: Mutex<Vec<Message>>,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message.
    pub fn push(&self, message: Message) {
        self.messages.lock().push(message);
    }

    /// Drain the queue, returning every held message in insertion order.
    pub fn take_all(&self) -> Vec<Message> {
        std::mem::take(&mut *self.messages.lock())
    }

    /// Number of held messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_is_atomic() {
        let queue = MessageQueue::new();
        queue.push(Message::new("/a"));
        queue.push(Message::new("/b"));

        let drained = queue.take_all();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].channel, "/a");
        assert!(queue.is_empty());
        assert!(queue.take_all().is_empty());
    }
}
