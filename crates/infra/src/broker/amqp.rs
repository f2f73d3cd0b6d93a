//! AMQP 0-9-1 transport over `lapin`.
//!
//! One connection and one channel per [`BrokerConnector::connect`] call, prefetch
//! set to 1. Connection-level errors flip the lifecycle signal to `Failed`;
//! `close()` flips it to `Closed`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::transport::{
    BrokerChannel, BrokerConnector, ChannelState, Delivery, ExchangeKind, ExchangeSpec,
    MessageProperties, QueueSpec, TransportError,
};

const CONSUMER_BUFFER: usize = 16;
const REPLY_SUCCESS: u16 = 200;

fn protocol(err: lapin::Error) -> TransportError {
    match err {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::ChannelClosed
        }
        other => TransportError::Protocol(other.to_string()),
    }
}

#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
}

impl AmqpConnector {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(protocol)?;

        let (state, lifecycle) = watch::channel(ChannelState::Open);
        let state = Arc::new(state);

        let on_error = Arc::clone(&state);
        connection.on_error(move |err| {
            on_error.send_replace(ChannelState::Failed(err.to_string()));
        });

        info!(channel_id = channel.id(), "amqp channel opened");
        Ok(Arc::new(AmqpChannel {
            connection,
            channel,
            state,
            lifecycle,
        }))
    }
}

pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
    state: Arc<watch::Sender<ChannelState>>,
    lifecycle: watch::Receiver<ChannelState>,
}

impl std::fmt::Debug for AmqpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpChannel")
            .field("channel_id", &self.channel.id())
            .field("state", &*self.lifecycle.borrow())
            .finish()
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    let mut args = FieldTable::default();
    if let Some(dlx) = &spec.dead_letter_exchange {
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString(LongString::from(dlx.clone())),
        );
    }
    if let Some(ttl) = spec.message_ttl {
        args.insert(
            ShortString::from("x-message-ttl"),
            AMQPValue::LongLongInt(ttl.as_millis() as i64),
        );
    }
    args
}

fn to_amqp_properties(properties: &MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default().with_delivery_mode(properties.delivery_mode);

    if let Some(content_type) = &properties.content_type {
        amqp = amqp.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(encoding) = &properties.content_encoding {
        amqp = amqp.with_content_encoding(ShortString::from(encoding.clone()));
    }
    if let Some(message_id) = &properties.message_id {
        amqp = amqp.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(timestamp.max(0) as u64);
    }
    if !properties.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (key, value) in &properties.headers {
            headers.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        amqp = amqp.with_headers(headers);
    }
    amqp
}

fn from_amqp_properties(amqp: &BasicProperties) -> MessageProperties {
    let headers = amqp
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| match value {
                    AMQPValue::LongString(s) => Some((
                        key.as_str().to_string(),
                        String::from_utf8_lossy(s.as_bytes()).into_owned(),
                    )),
                    AMQPValue::ShortString(s) => {
                        Some((key.as_str().to_string(), s.as_str().to_string()))
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    MessageProperties {
        delivery_mode: amqp.delivery_mode().unwrap_or(1),
        content_type: amqp.content_type().as_ref().map(|s| s.as_str().to_string()),
        content_encoding: amqp
            .content_encoding()
            .as_ref()
            .map(|s| s.as_str().to_string()),
        message_id: amqp.message_id().as_ref().map(|s| s.as_str().to_string()),
        timestamp: amqp.timestamp().map(|t| t as i64),
        headers,
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
            && matches!(*self.lifecycle.borrow(), ChannelState::Open)
    }

    fn lifecycle(&self) -> watch::Receiver<ChannelState> {
        self.lifecycle.clone()
    }

    async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        self.channel
            .exchange_declare(
                &spec.name,
                exchange_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        self.channel
            .queue_declare(
                &spec.name,
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..Default::default()
                },
                queue_arguments(spec),
            )
            .await
            .map(|_| ())
            .map_err(protocol)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, TransportError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_amqp_properties(properties),
            )
            .await
            .map_err(protocol)?;

        let confirmation = confirm.await.map_err(protocol)?;
        Ok(!matches!(confirmation, Confirmation::Nack(_)))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(protocol)?;

        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        let tag = consumer_tag.to_string();

        tokio::spawn(async move {
            while let Some(next) = consumer.next().await {
                match next {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            properties: from_amqp_properties(&delivery.properties),
                            body: delivery.data,
                        };
                        if sender.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(consumer_tag = %tag, error = %err, "amqp consumer stream failed");
                        break;
                    }
                }
            }
            debug!(consumer_tag = %tag, "amqp consumer stream ended");
        });

        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(protocol)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(protocol)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(protocol)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.state.send_replace(ChannelState::Closed);

        let channel_result = self.channel.close(REPLY_SUCCESS, "OK").await;
        let connection_result = self.connection.close(REPLY_SUCCESS, "OK").await;
        channel_result.map_err(protocol)?;
        connection_result.map_err(protocol)
    }
}
