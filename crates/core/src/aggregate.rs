//! Aggregate root contract for aggregates that buffer domain events.

use crate::id::AggregateId;

/// Aggregate root marker + event buffer access.
///
/// Aggregates record what happened as events while handling a request. The
/// buffered events are later fanned out in-process and handed to the publisher;
/// dispatch clears the buffer once every subscriber has seen it.
pub trait AggregateRoot {
    /// Event type buffered by this aggregate.
    type Event;

    /// Returns the aggregate identifier.
    fn id(&self) -> AggregateId;

    /// Events recorded since the last dispatch, oldest first.
    fn domain_events(&self) -> &[Self::Event];

    /// Drop all buffered events.
    fn clear_events(&mut self);
}

/// Ordered buffer of events recorded by an aggregate.
///
/// Embed this in an aggregate and forward `AggregateRoot` to it.
#[derive(Debug, Clone, PartialEq)]
pub struct EventBuffer<E> {
    events: Vec<E>,
}

impl<E> EventBuffer<E> {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: E) {
        self.events.push(event);
    }

    pub fn as_slice(&self) -> &[E] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl<E> Default for EventBuffer<E> {
    fn default() -> Self {
        Self::new()
    }
}
