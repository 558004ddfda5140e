//! Bounded outbound queue for messages sent while disconnected.

use std::collections::VecDeque;

use tracing::warn;

use crate::event::Envelope;

/// FIFO of envelopes waiting for a connection. When full, the oldest entry
/// is dropped to make room.
#[derive(Debug)]
pub struct OutboundQueue {
    items: VecDeque<Envelope>,
    capacity: usize,
    dropped: u64,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            dropped: 0,
        }
    }

    /// Append. Returns the envelope evicted to make room, if any.
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = if self.items.len() >= self.capacity {
            self.dropped += 1;
            let oldest = self.items.pop_front();
            if let Some(oldest) = &oldest {
                warn!(kind = oldest.type_tag(), "outbound queue full, dropping oldest message");
            }
            oldest
        } else {
            None
        };
        self.items.push_back(envelope);
        evicted
    }

    /// Put back a message whose send failed, ahead of everything else.
    /// Dropped instead when the queue is already full of newer messages.
    pub fn requeue(&mut self, envelope: Envelope) {
        if self.items.len() >= self.capacity {
            self.dropped += 1;
            warn!(kind = envelope.type_tag(), "outbound queue full, dropping unsent message");
            return;
        }
        self.items.push_front(envelope);
    }

    pub fn pop(&mut self) -> Option<Envelope> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Messages lost to overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, NodeTopics};
    use crate::model::NodeId;

    fn msg(n: usize) -> Envelope {
        Envelope::new(EventKind::Subscribe(NodeTopics {
            node_ids: vec![NodeId::new(format!("n{n}"))],
        }))
    }

    fn node(envelope: &Envelope) -> String {
        match &envelope.kind {
            EventKind::Subscribe(t) => t.node_ids[0].to_string(),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keeps_order() {
        let mut queue = OutboundQueue::new(4);
        for n in 0..3 {
            assert!(queue.push(msg(n)).is_none());
        }
        let drained: Vec<String> = std::iter::from_fn(|| queue.pop()).map(|e| node(&e)).collect();
        assert_eq!(drained, ["n0", "n1", "n2"]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let mut queue = OutboundQueue::new(2);
        queue.push(msg(0));
        queue.push(msg(1));
        let evicted = queue.push(msg(2)).unwrap();
        assert_eq!(node(&evicted), "n0");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(node(&queue.pop().unwrap()), "n1");
    }

    #[test]
    fn requeue_goes_first() {
        let mut queue = OutboundQueue::new(3);
        queue.push(msg(1));
        queue.requeue(msg(0));
        assert_eq!(node(&queue.pop().unwrap()), "n0");
    }
}
