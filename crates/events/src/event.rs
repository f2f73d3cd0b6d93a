use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use eventrelay_core::{AggregateId, EventId};

use crate::routing::routing_key;

/// A typed domain event raised by an aggregate.
///
/// Typed events are converted into a [`DomainEvent`] (flat JSON payload) before
/// they leave the aggregate. The payload schema is owned by the producing context.
pub trait Event: Serialize {
    /// Stable PascalCase event name (e.g. "OrderCreated").
    fn event_type(&self) -> &'static str;
}

/// An immutable record of something that happened to an aggregate.
///
/// - `event_id` is assigned by the producer when the event is created and is the
///   idempotency key downstream.
/// - `event_type` is the PascalCase discriminator that routing keys derive from.
/// - `payload` is an untyped JSON blob; there is no schema versioning here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    event_id: EventId,
    aggregate_id: AggregateId,
    event_type: String,
    occurred_on: DateTime<Utc>,
    payload: JsonValue,
}

impl DomainEvent {
    /// Create a new event with a fresh id, occurring now.
    pub fn new(aggregate_id: AggregateId, event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self::from_parts(EventId::new(), aggregate_id, event_type, Utc::now(), payload)
    }

    /// Rebuild an event from its stored or transmitted parts.
    pub fn from_parts(
        event_id: EventId,
        aggregate_id: AggregateId,
        event_type: impl Into<String>,
        occurred_on: DateTime<Utc>,
        payload: JsonValue,
    ) -> Self {
        Self {
            event_id,
            aggregate_id,
            event_type: event_type.into(),
            occurred_on,
            payload,
        }
    }

    /// Convert a typed event into its flat representation.
    pub fn from_typed<E: Event>(aggregate_id: AggregateId, event: &E) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_value(event)?;
        Ok(Self::new(aggregate_id, event.event_type(), payload))
    }

    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    pub fn aggregate_id(&self) -> AggregateId {
        self.aggregate_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn occurred_on(&self) -> DateTime<Utc> {
        self.occurred_on
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }

    /// Topic routing key derived from the event type.
    pub fn routing_key(&self) -> String {
        routing_key(&self.event_type)
    }
}
