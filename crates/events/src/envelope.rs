//! Wire envelope for events crossing the broker.
//!
//! The JSON body of every published message has this shape:
//!
//! ```text
//! {
//!   "id": "<eventId>",
//!   "occurredOn": "<ISO-8601 timestamp>",
//!   "eventName": "<EventType>",
//!   "aggregateId": "<aggregateId>",
//!   "data": { ... }
//! }
//! ```
//!
//! `aggregateId` is always written but optional on read; producers that only
//! send `{id, occurredOn, eventName, data}` are accepted and their events carry
//! [`AggregateId::nil`].
//!
//! The same envelope is what the processed-event ledger keeps alongside a record,
//! so a failed event can be rebuilt and re-dispatched without the broker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use eventrelay_core::{AggregateId, EventId};

use crate::event::DomainEvent;

/// A message body that could not be turned into a [`DomainEvent`].
///
/// Parse failures are never retried: a malformed body stays malformed.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed event body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("event body has an empty eventName")]
    MissingEventName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: EventId,
    pub occurred_on: DateTime<Utc>,
    pub event_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_id: Option<AggregateId>,
    #[serde(default)]
    pub data: JsonValue,
}

impl EventEnvelope {
    pub fn from_event(event: &DomainEvent) -> Self {
        Self {
            id: event.event_id(),
            occurred_on: event.occurred_on(),
            event_name: event.event_type().to_string(),
            aggregate_id: Some(event.aggregate_id()),
            data: event.payload().clone(),
        }
    }

    pub fn into_event(self) -> DomainEvent {
        DomainEvent::from_parts(
            self.id,
            self.aggregate_id.unwrap_or(AggregateId::nil()),
            self.event_name,
            self.occurred_on,
            self.data,
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a raw message body.
    pub fn from_slice(body: &[u8]) -> Result<Self, ParseError> {
        let envelope: Self = serde_json::from_slice(body)?;
        if envelope.event_name.trim().is_empty() {
            return Err(ParseError::MissingEventName);
        }
        Ok(envelope)
    }
}

impl From<&DomainEvent> for EventEnvelope {
    fn from(event: &DomainEvent) -> Self {
        Self::from_event(event)
    }
}
