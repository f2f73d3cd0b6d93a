//! Domain events: the event record, its wire envelope, routing keys, and
//! in-process fan-out.

pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod routing;

pub use dispatcher::{DomainEventDispatcher, LocalHandler, SharedAggregate, WILDCARD};
pub use envelope::{EventEnvelope, ParseError};
pub use event::{DomainEvent, Event};
pub use handler::HandlerError;
pub use routing::{routing_key, topic_matches};
