//! Publishing domain events to the broker.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use eventrelay_events::{DomainEvent, EventEnvelope};
use eventrelay_observability::MetricsSink;

use super::connection::{ConnectionError, ConnectionManager};
use super::transport::{ExchangeSpec, MessageProperties, TransportError};

pub const PUBLISH_DURATION: &str = "broker_publish_duration_ms";
pub const MESSAGES_PUBLISHED: &str = "broker_messages_published";
pub const PUBLISH_ERRORS: &str = "broker_publish_errors";
pub const PUBLISH_UNCONFIRMED: &str = "broker_publish_unconfirmed";

pub const HEADER_EVENT_NAME: &str = "event-name";
pub const HEADER_BOUNDED_CONTEXT: &str = "bounded-context";

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("broker rejected publish: {0}")]
    Transport(#[from] TransportError),
}

/// Outbound port for domain events.
///
/// Application services depend on this trait, never on a concrete broker.
/// Publishing is at-least-once: failures surface to the caller, who decides
/// whether to retry.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Declare whatever the publisher needs on the broker (the exchange).
    async fn initialize(&self) -> Result<(), PublishError>;

    async fn publish_event(&self, event: &DomainEvent) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn initialize(&self) -> Result<(), PublishError> {
        (**self).initialize().await
    }

    async fn publish_event(&self, event: &DomainEvent) -> Result<(), PublishError> {
        (**self).publish_event(event).await
    }
}

/// Publishes to a topic exchange through the [`ConnectionManager`].
///
/// Each event becomes one persistent JSON message:
///
/// - routing key derived from the event type (`OrderCreated` → `order.created`)
/// - body is the [`EventEnvelope`]
/// - `message_id` = event id, `timestamp` = occurred-on (epoch ms)
/// - headers `event-name` and `bounded-context`
pub struct BrokerEventPublisher {
    connection: ConnectionManager,
    exchange: ExchangeSpec,
    bounded_context: Option<String>,
    metrics: Arc<dyn MetricsSink>,
}

impl BrokerEventPublisher {
    pub fn new(
        connection: ConnectionManager,
        exchange: ExchangeSpec,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            connection,
            exchange,
            bounded_context: None,
            metrics,
        }
    }

    /// Fixed `bounded-context` header. Without it, the first routing-key segment is used.
    pub fn with_bounded_context(mut self, bounded_context: impl Into<String>) -> Self {
        self.bounded_context = Some(bounded_context.into());
        self
    }

    pub fn exchange(&self) -> &ExchangeSpec {
        &self.exchange
    }

    fn bounded_context_for<'a>(&'a self, routing_key: &'a str) -> &'a str {
        match &self.bounded_context {
            Some(context) => context,
            None => routing_key.split('.').next().unwrap_or(routing_key),
        }
    }

    fn message_properties(&self, event: &DomainEvent, routing_key: &str) -> MessageProperties {
        MessageProperties::persistent_json(
            event.event_id().to_string(),
            event.occurred_on().timestamp_millis(),
        )
        .with_header(HEADER_EVENT_NAME, event.event_type())
        .with_header(HEADER_BOUNDED_CONTEXT, self.bounded_context_for(routing_key))
    }

    /// `Ok(false)` when the broker signalled backpressure.
    async fn send(&self, event: &DomainEvent, routing_key: &str) -> Result<bool, PublishError> {
        let channel = self.connection.connect().await?;
        let body = EventEnvelope::from_event(event).to_bytes()?;
        let properties = self.message_properties(event, routing_key);

        let accepted = channel
            .publish(&self.exchange.name, routing_key, &body, &properties)
            .await?;
        Ok(accepted)
    }
}

#[async_trait]
impl EventPublisher for BrokerEventPublisher {
    async fn initialize(&self) -> Result<(), PublishError> {
        let channel = self.connection.connect().await?;
        channel.assert_exchange(&self.exchange).await?;
        info!(exchange = %self.exchange.name, "event publisher initialized");
        Ok(())
    }

    async fn publish_event(&self, event: &DomainEvent) -> Result<(), PublishError> {
        let started = Instant::now();
        let event_type = event.event_type();
        let routing_key = event.routing_key();

        let result = self.send(event, &routing_key).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(accepted) => {
                if !accepted {
                    warn!(
                        event_id = %event.event_id(),
                        event_type,
                        "broker buffer full; message not confirmed immediately"
                    );
                    self.metrics
                        .increment_counter(PUBLISH_UNCONFIRMED, 1, &[("event_type", event_type)]);
                }
                self.metrics
                    .record_histogram(PUBLISH_DURATION, elapsed_ms, &[("event_type", event_type)]);
                self.metrics
                    .increment_counter(MESSAGES_PUBLISHED, 1, &[("event_type", event_type)]);
                debug!(
                    event_id = %event.event_id(),
                    event_type,
                    routing_key = %routing_key,
                    exchange = %self.exchange.name,
                    "event published"
                );
                Ok(())
            }
            Err(err) => {
                self.metrics.record_histogram(
                    PUBLISH_DURATION,
                    elapsed_ms,
                    &[("event_type", event_type), ("error", "true")],
                );
                self.metrics
                    .increment_counter(PUBLISH_ERRORS, 1, &[("event_type", event_type)]);
                error!(
                    event_id = %event.event_id(),
                    event_type,
                    routing_key = %routing_key,
                    error = %err,
                    "failed to publish event"
                );
                Err(err)
            }
        }
    }
}
