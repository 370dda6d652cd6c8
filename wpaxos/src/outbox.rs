//! The engine's send capability.
//!
//! The engine never touches sockets. Every outgoing message goes through an
//! [`Outbox`], which is fire-and-forget: delivery is best effort and a send
//! never blocks or fails from the engine's point of view. Messages addressed
//! to the sending node itself go through the same path and must be delivered
//! later, never re-entrantly.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::types::{Message, NodeId};

/// Fire-and-forget, per-peer message sink.
pub trait Outbox {
    /// Queue `message` for delivery to `to`.
    fn send(&self, to: NodeId, message: Message);
}

/// A message together with its destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Destination node.
    pub to: NodeId,
    /// The message.
    pub message: Message,
}

/// Outbox that records messages in a shared queue.
///
/// Clones share the queue. Simulation harnesses drain it and deliver the
/// envelopes in whatever order they want to test.
#[derive(Debug, Clone, Default)]
pub struct MemoryOutbox {
    queue: Rc<RefCell<VecDeque<Envelope>>>,
}

impl MemoryOutbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything sent so far, in send order.
    pub fn drain(&self) -> Vec<Envelope> {
        self.queue.borrow_mut().drain(..).collect()
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queue.borrow().is_empty()
    }
}

impl Outbox for MemoryOutbox {
    fn send(&self, to: NodeId, message: Message) {
        self.queue.borrow_mut().push_back(Envelope { to, message });
    }
}
