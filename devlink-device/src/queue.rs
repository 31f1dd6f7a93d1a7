//! Bounded FIFO of messages waiting for the broker

use std::collections::VecDeque;
use std::sync::Mutex;

use log::*;

/// Broker delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub qos: QoS,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self { topic: topic.into(), payload: payload.into(), retain: false, qos: QoS::AtMostOnce }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

/// Overflow drops the oldest entry; the newest is never rejected.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    inner: Mutex<VecDeque<OutboundMessage>>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, inner: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append at the tail, returning the message dropped to make room
    pub fn enqueue(&self, message: OutboundMessage) -> Option<OutboundMessage> {
        let Ok(mut q) = self.inner.lock() else {
            return Some(message);
        };
        let dropped = if q.len() >= self.capacity {
            warn!("Queue full. Dropping oldest message.");
            q.pop_front()
        } else {
            None
        };
        q.push_back(message);
        dropped
    }

    pub fn dequeue(&self) -> Option<OutboundMessage> {
        self.inner.lock().ok()?.pop_front()
    }

    /// Put a message whose publish failed back at the tail
    pub fn requeue(&self, message: OutboundMessage) {
        debug!("Requeueing message for {}", message.topic);
        self.enqueue(message);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut q) = self.inner.lock() {
            q.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> OutboundMessage {
        OutboundMessage::new("stream/dev/rpcout", format!("{}", n))
    }

    #[test]
    fn eleventh_message_evicts_the_first() {
        let q = OutboundQueue::new(10);
        for n in 1..=10 {
            assert_eq!(q.enqueue(msg(n)), None);
        }
        assert_eq!(q.enqueue(msg(11)), Some(msg(1)));
        assert_eq!(q.len(), 10);

        let drained: Vec<_> = std::iter::from_fn(|| q.dequeue()).collect();
        assert_eq!(drained, (2..=11).map(msg).collect::<Vec<_>>());
    }

    #[test]
    fn requeue_goes_to_the_tail() {
        let q = OutboundQueue::new(10);
        q.enqueue(msg(1));
        q.enqueue(msg(2));
        let first = q.dequeue().unwrap();
        q.requeue(first);
        assert_eq!(q.dequeue(), Some(msg(2)));
        assert_eq!(q.dequeue(), Some(msg(1)));
        assert!(q.is_empty());
    }
}
