//! Message broker plumbing: transport boundary, connection lifecycle, publisher
//! and consumer.

pub mod connection;
pub mod consumer;
pub mod in_memory;
pub mod publisher;
pub mod transport;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use connection::{ConnectionError, ConnectionManager, ReconnectPolicy};
pub use consumer::{ConsumeError, ConsumerTopology, EventConsumer, MessageHandler};
pub use in_memory::InMemoryBroker;
pub use publisher::{BrokerEventPublisher, EventPublisher, PublishError};
pub use transport::{
    BrokerChannel, BrokerConnector, ChannelState, Delivery, ExchangeKind, ExchangeSpec,
    MessageProperties, QueueSpec, TransportError,
};

#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
