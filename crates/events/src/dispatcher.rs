//! In-process domain event fan-out.
//!
//! The dispatcher is the synchronous, same-process half of event propagation:
//! aggregates are marked after a state change, and once the surrounding unit of
//! work is done the caller dispatches their buffered events to every local
//! subscriber. Nothing here touches the broker.
//!
//! ## Ordering
//!
//! For each buffered event (oldest first), wildcard handlers run before the
//! handlers registered for that concrete event type, each group in registration
//! order.
//!
//! ## Failure
//!
//! The first handler error stops the dispatch. The aggregate keeps its buffer and
//! stays marked, so the caller can decide whether to retry the whole dispatch.
//!
//! ## Scope
//!
//! One dispatcher per composition root, shared via `Arc`. There is no global
//! registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use eventrelay_core::{AggregateId, AggregateRoot};

use crate::event::DomainEvent;
use crate::handler::HandlerError;

/// Subscriber key that receives every event type.
pub const WILDCARD: &str = "*";

/// A local subscriber callback.
pub type LocalHandler = Arc<dyn Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Shared handle to an aggregate whose events are waiting for dispatch.
pub type SharedAggregate = Arc<Mutex<dyn AggregateRoot<Event = DomainEvent> + Send>>;

#[derive(Default)]
pub struct DomainEventDispatcher {
    handlers: RwLock<HashMap<String, Vec<LocalHandler>>>,
    marked: Mutex<HashMap<AggregateId, SharedAggregate>>,
}

impl DomainEventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to every event type.
    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.register_for_event(WILDCARD, handler);
    }

    /// Subscribe to a single event type. `"*"` is equivalent to [`register`](Self::register).
    pub fn register_for_event<F>(&self, event_type: impl Into<String>, handler: F)
    where
        F: Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        handlers
            .entry(event_type.into())
            .or_default()
            .push(Arc::new(handler));
    }

    pub fn clear_handlers(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Add an aggregate to the pending set. Marking the same aggregate twice is a no-op.
    pub fn mark_aggregate_for_dispatch<A>(&self, aggregate: Arc<Mutex<A>>)
    where
        A: AggregateRoot<Event = DomainEvent> + Send + 'static,
    {
        let id = aggregate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .id();

        let mut marked = self.marked.lock().unwrap_or_else(PoisonError::into_inner);
        if marked.contains_key(&id) {
            return;
        }

        let shared: SharedAggregate = aggregate;
        marked.insert(id, shared);
        tracing::debug!(aggregate_id = %id, "aggregate marked for dispatch");
    }

    pub fn is_marked(&self, id: AggregateId) -> bool {
        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn clear_marked_aggregates(&self) {
        self.marked.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Fan out the buffered events of a marked aggregate.
    ///
    /// Returns how many events were dispatched; an unmarked id dispatches nothing.
    pub fn dispatch_events_for_aggregate(&self, id: AggregateId) -> Result<usize, HandlerError> {
        let aggregate = {
            let marked = self.marked.lock().unwrap_or_else(PoisonError::into_inner);
            match marked.get(&id) {
                Some(aggregate) => Arc::clone(aggregate),
                None => return Ok(0),
            }
        };

        let events: Vec<DomainEvent> = aggregate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .domain_events()
            .to_vec();

        for event in &events {
            for handler in self.handlers_for(event.event_type()) {
                if let Err(err) = handler(event) {
                    tracing::warn!(
                        aggregate_id = %id,
                        event_id = %event.event_id(),
                        event_type = event.event_type(),
                        error = %err,
                        "local event handler failed; aggregate left pending"
                    );
                    return Err(err);
                }
            }
        }

        aggregate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear_events();
        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        tracing::debug!(aggregate_id = %id, events = events.len(), "domain events dispatched");
        Ok(events.len())
    }

    // Snapshot so handlers can register further subscribers without deadlocking.
    fn handlers_for(&self, event_type: &str) -> Vec<LocalHandler> {
        let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
        let wildcard = handlers.get(WILDCARD).into_iter().flatten();
        let specific = if event_type == WILDCARD {
            None
        } else {
            handlers.get(event_type)
        };
        wildcard.chain(specific.into_iter().flatten()).cloned().collect()
    }
}

impl std::fmt::Debug for DomainEventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handler_count: usize = self
            .handlers
            .read()
            .map(|h| h.values().map(Vec::len).sum())
            .unwrap_or(0);
        f.debug_struct("DomainEventDispatcher")
            .field("handlers", &handler_count)
            .field("marked", &self.marked_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventrelay_core::EventBuffer;
    use serde_json::json;

    struct Order {
        id: AggregateId,
        events: EventBuffer<DomainEvent>,
    }

    impl Order {
        fn new() -> Self {
            Self {
                id: AggregateId::new(),
                events: EventBuffer::new(),
            }
        }

        fn raise(&mut self, event_type: &str) {
            self.events
                .record(DomainEvent::new(self.id, event_type, json!({})));
        }
    }

    impl AggregateRoot for Order {
        type Event = DomainEvent;

        fn id(&self) -> AggregateId {
            self.id
        }

        fn domain_events(&self) -> &[DomainEvent] {
            self.events.as_slice()
        }

        fn clear_events(&mut self) {
            self.events.clear();
        }
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync + 'static {
        let log = Arc::clone(log);
        move |event| {
            log.lock().unwrap().push(format!("{tag}:{}", event.event_type()));
            Ok(())
        }
    }

    #[test]
    fn wildcard_handlers_run_before_specific_ones() {
        let dispatcher = DomainEventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register_for_event("OrderCreated", recorder(&log, "specific"));
        dispatcher.register(recorder(&log, "any"));

        let order = Arc::new(Mutex::new(Order::new()));
        order.lock().unwrap().raise("OrderCreated");
        order.lock().unwrap().raise("OrderShipped");
        let id = order.lock().unwrap().id();

        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&order));
        let dispatched = dispatcher.dispatch_events_for_aggregate(id).unwrap();

        assert_eq!(dispatched, 2);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["any:OrderCreated", "specific:OrderCreated", "any:OrderShipped"]
        );
        assert!(order.lock().unwrap().domain_events().is_empty());
        assert!(!dispatcher.is_marked(id));
    }

    #[test]
    fn marking_is_idempotent() {
        let dispatcher = DomainEventDispatcher::new();
        let order = Arc::new(Mutex::new(Order::new()));

        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&order));
        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&order));

        assert_eq!(dispatcher.marked_count(), 1);
    }

    #[test]
    fn pending_aggregates_are_keyed_by_identity() {
        let dispatcher = DomainEventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(recorder(&log, "any"));

        let first = Arc::new(Mutex::new(Order::new()));
        let second = Arc::new(Mutex::new(Order::new()));
        first.lock().unwrap().raise("OrderCreated");
        second.lock().unwrap().raise("InvoiceIssued");
        let first_id = first.lock().unwrap().id();
        let second_id = second.lock().unwrap().id();
        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&first));
        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&second));
        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&first));

        assert_eq!(dispatcher.marked_count(), 2);
        assert_eq!(dispatcher.dispatch_events_for_aggregate(second_id).unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["any:InvoiceIssued"]);
        assert!(dispatcher.is_marked(first_id));
        assert!(!dispatcher.is_marked(second_id));
        assert_eq!(first.lock().unwrap().domain_events().len(), 1);
    }

    #[test]
    fn unknown_aggregate_dispatches_nothing() {
        let dispatcher = DomainEventDispatcher::new();
        assert_eq!(dispatcher.dispatch_events_for_aggregate(AggregateId::new()).unwrap(), 0);
    }

    #[test]
    fn handler_error_leaves_aggregate_pending() {
        let dispatcher = DomainEventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(|_| Err(HandlerError::permanent("nope")));
        dispatcher.register_for_event("OrderCreated", recorder(&log, "specific"));

        let order = Arc::new(Mutex::new(Order::new()));
        order.lock().unwrap().raise("OrderCreated");
        let id = order.lock().unwrap().id();
        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&order));

        let err = dispatcher.dispatch_events_for_aggregate(id).unwrap_err();
        assert!(err.is_permanent());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(order.lock().unwrap().domain_events().len(), 1);
        assert!(dispatcher.is_marked(id));
    }

    #[test]
    fn clearing_handlers_and_marks() {
        let dispatcher = DomainEventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.register(recorder(&log, "any"));
        dispatcher.clear_handlers();

        let order = Arc::new(Mutex::new(Order::new()));
        order.lock().unwrap().raise("OrderCreated");
        let id = order.lock().unwrap().id();
        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&order));

        assert_eq!(dispatcher.dispatch_events_for_aggregate(id).unwrap(), 1);
        assert!(log.lock().unwrap().is_empty());

        dispatcher.mark_aggregate_for_dispatch(Arc::clone(&order));
        dispatcher.clear_marked_aggregates();
        assert_eq!(dispatcher.marked_count(), 0);
    }
}
