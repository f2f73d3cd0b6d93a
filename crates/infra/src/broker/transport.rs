//! Broker transport boundary.
//!
//! The relay talks to the message broker only through these two traits:
//!
//! - [`BrokerConnector`] opens a channel (a fresh connection for the in-memory
//!   broker, a connection + channel pair for AMQP).
//! - [`BrokerChannel`] is the narrow set of topology, publish and consume
//!   operations the publisher and consumer need.
//!
//! ## Channel lifecycle
//!
//! Every channel exposes a `watch` signal that moves from `Open` to either
//! `Failed` (broker-side error, connection loss) or `Closed` (deliberate close).
//! The connection manager watches it to drive reconnects.
//!
//! ## Deliveries
//!
//! `consume` hands back an `mpsc` receiver. The stream ends when the consumer is
//! cancelled or the channel goes away. Each delivery must be settled with `ack`
//! or `nack` on the same channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_ENCODING_UTF8: &str = "utf-8";
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("channel is closed")]
    ChannelClosed,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Failed(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Topic => "topic",
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non-auto-delete topic exchange.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
            auto_delete: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// `x-dead-letter-exchange`
    pub dead_letter_exchange: Option<String>,
    /// `x-message-ttl`
    pub message_ttl: Option<Duration>,
}

impl QueueSpec {
    /// Durable, shared, non-auto-delete queue without dead-lettering.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: None,
            message_ttl: None,
        }
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// Message metadata carried next to the body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_mode: u8,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    /// Epoch milliseconds.
    pub timestamp: Option<i64>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    /// Persistent JSON message with the given id and timestamp.
    pub fn persistent_json(message_id: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            content_encoding: Some(CONTENT_ENCODING_UTF8.to_string()),
            message_id: Some(message_id.into()),
            timestamp: Some(timestamp_ms),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_open(&self) -> bool;

    /// Lifecycle signal; see the module docs.
    fn lifecycle(&self) -> watch::Receiver<ChannelState>;

    async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError>;

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError>;

    /// Publish a message. `Ok(false)` means the broker accepted the call but
    /// signalled backpressure (write buffer full); the message may still arrive.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, TransportError>;

    /// Start a consumer with prefetch 1.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Reject a delivery. Without requeue it is dead-lettered (or dropped when the
    /// queue has no dead-letter exchange).
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, TransportError>;
}

#[async_trait]
impl<C> BrokerConnector for Arc<C>
where
    C: BrokerConnector + ?Sized,
{
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        (**self).connect().await
    }
}
