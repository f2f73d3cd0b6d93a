//! Consuming domain events from the broker.
//!
//! One consumer task per [`EventConsumer`], reading deliveries in order and
//! settling each before the broker hands over the next (prefetch 1). Handling
//! order therefore equals delivery order for a queue/consumer pair.
//!
//! Settlement:
//!
//! | outcome | action |
//! |---|---|
//! | handler `Ok` | ack |
//! | transient failure | nack + requeue |
//! | permanent failure, parse failure, handler panic | nack without requeue (dead-lettered) |
//!
//! When the delivery stream ends without [`EventConsumer::stop_consuming`] (the
//! channel died), the task resubscribes through the [`ConnectionManager`] once
//! per reconnect interval, up to the reconnect attempt cap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use eventrelay_events::{DomainEvent, EventEnvelope};
use eventrelay_observability::MetricsSink;

use crate::config::{DEFAULT_DEAD_LETTER_EXCHANGE, DEFAULT_EXCHANGE, DEFAULT_MESSAGE_TTL, DEFAULT_QUEUE};
use crate::idempotency::HandleError;

use super::connection::{ConnectionError, ConnectionManager};
use super::transport::{BrokerChannel, Delivery, ExchangeSpec, QueueSpec, TransportError};

pub const CONSUME_DURATION: &str = "broker_consume_duration_ms";
pub const MESSAGES_CONSUMED: &str = "broker_messages_consumed";
pub const MESSAGE_PROCESSING_ERRORS: &str = "broker_message_processing_errors";
pub const MESSAGE_PARSING_ERRORS: &str = "broker_message_parsing_errors";
pub const CONSUMER_STATUS: &str = "broker_consumer_status";

const CATCH_ALL_BINDING: &str = "#";

#[derive(Debug, Error)]
pub enum ConsumeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("broker operation failed: {0}")]
    Transport(#[from] TransportError),
}

/// Callback invoked for every parsed message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, event: DomainEvent) -> Result<(), HandleError>;
}

#[async_trait]
impl<H> MessageHandler for Arc<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle_message(&self, event: DomainEvent) -> Result<(), HandleError> {
        (**self).handle_message(event).await
    }
}

/// Exchanges and queue a consumer declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTopology {
    pub exchange: ExchangeSpec,
    pub dead_letter_exchange: ExchangeSpec,
    pub queue: QueueSpec,
}

impl ConsumerTopology {
    /// Topic exchanges plus a durable queue that dead-letters into `dead_letter_exchange`.
    pub fn new(
        exchange: impl Into<String>,
        dead_letter_exchange: impl Into<String>,
        queue: impl Into<String>,
        message_ttl: Duration,
    ) -> Self {
        let dead_letter_exchange = ExchangeSpec::topic(dead_letter_exchange);
        let queue = QueueSpec::durable(queue)
            .with_dead_letter_exchange(dead_letter_exchange.name.clone())
            .with_message_ttl(message_ttl);

        Self {
            exchange: ExchangeSpec::topic(exchange),
            dead_letter_exchange,
            queue,
        }
    }
}

impl Default for ConsumerTopology {
    fn default() -> Self {
        Self::new(
            DEFAULT_EXCHANGE,
            DEFAULT_DEAD_LETTER_EXCHANGE,
            DEFAULT_QUEUE,
            DEFAULT_MESSAGE_TTL,
        )
    }
}

struct ActiveConsumer {
    /// Channel the current subscription lives on; replaced on resubscribe.
    channel: watch::Receiver<Arc<dyn BrokerChannel>>,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveConsumer {
    fn channel(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&*self.channel.borrow())
    }
}

type Subscription = (Arc<dyn BrokerChannel>, mpsc::Receiver<Delivery>);

pub struct EventConsumer {
    connection: ConnectionManager,
    topology: ConsumerTopology,
    consumer_tag: String,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsSink>,
    active: Mutex<Option<ActiveConsumer>>,
}

impl EventConsumer {
    pub fn new(
        connection: ConnectionManager,
        topology: ConsumerTopology,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let consumer_tag = format!("{}-consumer", topology.queue.name);
        Self {
            connection,
            topology,
            consumer_tag,
            handler,
            metrics,
            active: Mutex::new(None),
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn topology(&self) -> &ConsumerTopology {
        &self.topology
    }

    /// Declare the dead-letter exchange, the main exchange and the queue, then
    /// bind the queue once per key. No keys means a catch-all `#` binding.
    pub async fn initialize(&self, binding_keys: &[&str]) -> Result<(), ConsumeError> {
        let channel = self.connection.connect().await?;
        let topology = &self.topology;

        channel.assert_exchange(&topology.dead_letter_exchange).await?;
        channel.assert_exchange(&topology.exchange).await?;
        channel.assert_queue(&topology.queue).await?;

        let keys: Vec<&str> = if binding_keys.is_empty() {
            vec![CATCH_ALL_BINDING]
        } else {
            binding_keys.to_vec()
        };
        for key in &keys {
            channel
                .bind_queue(&topology.queue.name, &topology.exchange.name, key)
                .await?;
        }

        info!(
            queue = %topology.queue.name,
            exchange = %topology.exchange.name,
            binding_keys = ?keys,
            "event consumer initialized"
        );
        Ok(())
    }

    /// Start the consumer task.
    ///
    /// A no-op while the task is alive, including while it is resubscribing
    /// after a connection loss. A task that gave up is replaced.
    pub async fn start_consuming(&self) -> Result<(), ConsumeError> {
        let mut active = self.active.lock().await;

        if active.as_ref().is_some_and(|current| !current.task.is_finished()) {
            debug!(consumer_tag = %self.consumer_tag, "consumer already running");
            return Ok(());
        }
        active.take();

        let (channel, deliveries) =
            subscribe(&self.connection, &self.topology.queue.name, &self.consumer_tag).await?;
        let (channel_tx, channel_rx) = watch::channel(Arc::clone(&channel));
        let (stop_tx, stop_rx) = watch::channel(false);

        let supervisor = Supervisor {
            connection: self.connection.clone(),
            consumer_tag: self.consumer_tag.clone(),
            current_channel: channel_tx,
            stop: stop_rx,
            worker: ConsumerWorker {
                channel,
                handler: Arc::clone(&self.handler),
                metrics: Arc::clone(&self.metrics),
                queue: self.topology.queue.name.clone(),
            },
        };
        let task = tokio::spawn(supervisor.run(deliveries));
        *active = Some(ActiveConsumer {
            channel: channel_rx,
            stop: stop_tx,
            task,
        });

        self.metrics.record_gauge(CONSUMER_STATUS, 1.0, &[]);
        info!(
            queue = %self.topology.queue.name,
            consumer_tag = %self.consumer_tag,
            "started consuming"
        );
        Ok(())
    }

    /// Cancel the consumer and wait for the in-flight message to settle.
    pub async fn stop_consuming(&self) -> Result<(), ConsumeError> {
        let Some(current) = self.active.lock().await.take() else {
            return Ok(());
        };

        let _ = current.stop.send(true);
        let channel = current.channel();
        if channel.is_open() {
            if let Err(err) = channel.cancel(&self.consumer_tag).await {
                current.task.abort();
                self.metrics.record_gauge(CONSUMER_STATUS, 0.0, &[]);
                return Err(err.into());
            }
        }
        let _ = current.task.await;

        self.metrics.record_gauge(CONSUMER_STATUS, 0.0, &[]);
        info!(consumer_tag = %self.consumer_tag, "stopped consuming");
        Ok(())
    }

    pub async fn is_consuming(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .is_some_and(|c| !c.task.is_finished() && c.channel().is_open())
    }
}

async fn subscribe(
    connection: &ConnectionManager,
    queue: &str,
    consumer_tag: &str,
) -> Result<Subscription, ConsumeError> {
    let channel = connection.connect().await?;
    let deliveries = channel.consume(queue, consumer_tag).await?;
    Ok((channel, deliveries))
}

/// Owns the consumer task: runs the worker and resubscribes when the delivery
/// stream ends without a stop request.
struct Supervisor {
    connection: ConnectionManager,
    consumer_tag: String,
    current_channel: watch::Sender<Arc<dyn BrokerChannel>>,
    stop: watch::Receiver<bool>,
    worker: ConsumerWorker,
}

impl Supervisor {
    async fn run(mut self, mut deliveries: mpsc::Receiver<Delivery>) {
        loop {
            self.worker.run(&mut deliveries).await;
            if *self.stop.borrow() {
                break;
            }

            self.worker.metrics.record_gauge(CONSUMER_STATUS, 0.0, &[]);
            warn!(queue = %self.worker.queue, "consumer stream ended unexpectedly; resubscribing");

            let Some((channel, resumed)) = self.resubscribe().await else {
                break;
            };
            self.worker.metrics.record_gauge(CONSUMER_STATUS, 1.0, &[]);
            self.worker.channel = Arc::clone(&channel);
            self.current_channel.send_replace(channel);
            deliveries = resumed;
            info!(queue = %self.worker.queue, consumer_tag = %self.consumer_tag, "resumed consuming");
        }

        self.worker.metrics.record_gauge(CONSUMER_STATUS, 0.0, &[]);
        info!(queue = %self.worker.queue, "consumer task finished");
    }

    /// Try once per reconnect interval, up to the reconnect attempt cap.
    async fn resubscribe(&mut self) -> Option<Subscription> {
        let policy = self.connection.policy();

        for attempt in 1..=policy.max_attempts {
            tokio::select! {
                _ = tokio::time::sleep(policy.interval) => {}
                _ = self.stop.changed() => return None,
            }
            if *self.stop.borrow() {
                return None;
            }

            match subscribe(&self.connection, &self.worker.queue, &self.consumer_tag).await {
                Ok(subscription) => return Some(subscription),
                Err(err) => warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "resubscribe attempt failed"
                ),
            }
        }

        error!(
            queue = %self.worker.queue,
            max_attempts = policy.max_attempts,
            "giving up resubscribing; call start_consuming to try again"
        );
        None
    }
}

struct ConsumerWorker {
    channel: Arc<dyn BrokerChannel>,
    handler: Arc<dyn MessageHandler>,
    metrics: Arc<dyn MetricsSink>,
    queue: String,
}

impl ConsumerWorker {
    async fn run(&self, deliveries: &mut mpsc::Receiver<Delivery>) {
        while let Some(delivery) = deliveries.recv().await {
            self.process(delivery).await;
        }
        debug!(queue = %self.queue, "consumer stream ended");
    }

    async fn process(&self, delivery: Delivery) {
        let started = Instant::now();
        let tag = delivery.delivery_tag;

        let envelope = match EventEnvelope::from_slice(&delivery.body) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.metrics.increment_counter(MESSAGE_PARSING_ERRORS, 1, &[]);
                error!(
                    queue = %self.queue,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "unparseable message; dead-lettering"
                );
                self.nack(tag, false).await;
                return;
            }
        };

        let event = envelope.into_event();
        let event_id = event.event_id();
        let event_type = event.event_type().to_string();
        debug!(
            event_id = %event_id,
            event_type = %event_type,
            redelivered = delivery.redelivered,
            "received event"
        );

        // Own task so a panicking handler cannot take the consumer down with it.
        let handler = Arc::clone(&self.handler);
        let outcome = tokio::spawn(async move { handler.handle_message(event).await }).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match outcome {
            Ok(Ok(())) => {
                self.ack(tag).await;
                self.metrics.record_histogram(
                    CONSUME_DURATION,
                    elapsed_ms,
                    &[("event_type", event_type.as_str())],
                );
                self.metrics
                    .increment_counter(MESSAGES_CONSUMED, 1, &[("event_type", event_type.as_str())]);
            }
            Ok(Err(err)) => {
                let permanent = err.is_permanent();
                self.metrics.increment_counter(
                    MESSAGE_PROCESSING_ERRORS,
                    1,
                    &[
                        ("event_type", event_type.as_str()),
                        ("permanent", if permanent { "true" } else { "false" }),
                    ],
                );
                if permanent {
                    error!(event_id = %event_id, event_type = %event_type, error = %err, "permanent failure; dead-lettering");
                } else {
                    warn!(event_id = %event_id, event_type = %event_type, error = %err, "transient failure; requeueing");
                }
                self.nack(tag, !permanent).await;
            }
            Err(join_err) => {
                self.metrics.increment_counter(
                    MESSAGE_PROCESSING_ERRORS,
                    1,
                    &[("event_type", event_type.as_str()), ("permanent", "true")],
                );
                error!(event_id = %event_id, event_type = %event_type, error = %join_err, "handler panicked; dead-lettering");
                self.nack(tag, false).await;
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) {
        if let Err(err) = self.channel.ack(delivery_tag).await {
            warn!(delivery_tag, error = %err, "ack failed; broker will redeliver");
        }
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) {
        if let Err(err) = self.channel.nack(delivery_tag, requeue).await {
            warn!(delivery_tag, requeue, error = %err, "nack failed; broker will redeliver");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::connection::ReconnectPolicy;
    use crate::broker::in_memory::InMemoryBroker;
    use crate::broker::transport::{BrokerConnector, MessageProperties};
    use eventrelay_core::AggregateId;
    use eventrelay_events::HandlerError;
    use eventrelay_observability::InMemoryMetrics;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    const DLQ: &str = "test-dlq";

    #[derive(Clone, Copy)]
    enum Script {
        Succeed,
        Transient,
        Permanent,
        Panic,
    }

    struct ScriptedHandler {
        script: Script,
        seen: StdMutex<Vec<String>>,
    }

    impl ScriptedHandler {
        fn new(script: Script) -> Arc<Self> {
            Arc::new(Self {
                script,
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageHandler for ScriptedHandler {
        async fn handle_message(&self, event: DomainEvent) -> Result<(), HandleError> {
            self.seen.lock().unwrap().push(event.event_type().to_string());
            match self.script {
                Script::Succeed => Ok(()),
                Script::Transient => Err(HandleError::Handler(HandlerError::transient("db busy"))),
                Script::Permanent => Err(HandleError::Handler(HandlerError::permanent("bad data"))),
                Script::Panic => panic!("handler blew up"),
            }
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        metrics: Arc<InMemoryMetrics>,
        consumer: EventConsumer,
        channel: Arc<dyn BrokerChannel>,
    }

    async fn fixture(handler: Arc<ScriptedHandler>) -> Fixture {
        fixture_with(handler, ReconnectPolicy::default()).await
    }

    async fn fixture_with(handler: Arc<ScriptedHandler>, policy: ReconnectPolicy) -> Fixture {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let connection = ConnectionManager::new(Arc::new(broker.clone()), policy, metrics.clone());
        let consumer = EventConsumer::new(connection, ConsumerTopology::default(), handler, metrics.clone());
        consumer.initialize(&[]).await.unwrap();

        let channel = broker.connect().await.unwrap();
        channel.assert_queue(&QueueSpec::durable(DLQ)).await.unwrap();
        channel
            .bind_queue(DLQ, DEFAULT_DEAD_LETTER_EXCHANGE, "#")
            .await
            .unwrap();

        Fixture {
            broker,
            metrics,
            consumer,
            channel,
        }
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            interval: Duration::from_millis(10),
        }
    }

    async fn publish_on(channel: &dyn BrokerChannel, event_type: &str) {
        let event = DomainEvent::new(AggregateId::new(), event_type, json!({}));
        let body = EventEnvelope::from_event(&event).to_bytes().unwrap();
        channel
            .publish(DEFAULT_EXCHANGE, &event.routing_key(), &body, &MessageProperties::default())
            .await
            .unwrap();
    }

    async fn publish_event(f: &Fixture, event_type: &str) {
        publish_on(f.channel.as_ref(), event_type).await;
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn initialize_declares_topology_with_catch_all_binding() {
        let f = fixture(ScriptedHandler::new(Script::Succeed)).await;

        assert!(f.broker.exchange_exists(DEFAULT_EXCHANGE));
        assert!(f.broker.exchange_exists(DEFAULT_DEAD_LETTER_EXCHANGE));
        let spec = f.broker.queue_spec(DEFAULT_QUEUE).unwrap();
        assert_eq!(spec.dead_letter_exchange.as_deref(), Some(DEFAULT_DEAD_LETTER_EXCHANGE));
        assert_eq!(spec.message_ttl, Some(DEFAULT_MESSAGE_TTL));
        assert_eq!(
            f.broker.bindings_for(DEFAULT_QUEUE),
            vec![(DEFAULT_EXCHANGE.to_string(), "#".to_string())]
        );
    }

    #[tokio::test]
    async fn success_acks_in_delivery_order() {
        let handler = ScriptedHandler::new(Script::Succeed);
        let f = fixture(handler.clone()).await;
        publish_event(&f, "OrderCreated").await;
        publish_event(&f, "OrderShipped").await;
        publish_event(&f, "InvoicePaid").await;

        f.consumer.start_consuming().await.unwrap();
        settle().await;

        assert_eq!(handler.seen(), vec!["OrderCreated", "OrderShipped", "InvoicePaid"]);
        assert_eq!(f.broker.ready_count(DEFAULT_QUEUE), 0);
        assert_eq!(f.broker.unacked_count(DEFAULT_QUEUE), 0);
        assert_eq!(f.metrics.counter(MESSAGES_CONSUMED), 3);
        assert_eq!(f.metrics.gauge(CONSUMER_STATUS), Some(1.0));
    }

    #[tokio::test]
    async fn permanent_failure_is_dead_lettered() {
        let f = fixture(ScriptedHandler::new(Script::Permanent)).await;
        publish_event(&f, "OrderCreated").await;

        f.consumer.start_consuming().await.unwrap();
        settle().await;

        assert_eq!(f.broker.ready_count(DLQ), 1);
        assert_eq!(
            f.metrics.counter_with(MESSAGE_PROCESSING_ERRORS, &[("permanent", "true")]),
            1
        );
    }

    #[tokio::test]
    async fn transient_failure_is_requeued() {
        let handler = ScriptedHandler::new(Script::Transient);
        let f = fixture(handler.clone()).await;
        publish_event(&f, "OrderCreated").await;

        f.consumer.start_consuming().await.unwrap();
        settle().await;
        f.consumer.stop_consuming().await.unwrap();

        assert!(handler.seen().len() > 1);
        assert_eq!(f.broker.ready_count(DLQ), 0);
        assert_eq!(f.broker.ready_count(DEFAULT_QUEUE), 1);
        assert!(
            f.metrics
                .counter_with(MESSAGE_PROCESSING_ERRORS, &[("permanent", "false")])
                >= 1
        );
    }

    #[tokio::test]
    async fn malformed_body_is_dead_lettered_without_calling_handler() {
        let handler = ScriptedHandler::new(Script::Succeed);
        let f = fixture(handler.clone()).await;
        f.channel
            .publish(DEFAULT_EXCHANGE, "order.created", b"{not json", &MessageProperties::default())
            .await
            .unwrap();

        f.consumer.start_consuming().await.unwrap();
        settle().await;

        assert!(handler.seen().is_empty());
        assert_eq!(f.broker.ready_count(DLQ), 1);
        assert_eq!(f.metrics.counter(MESSAGE_PARSING_ERRORS), 1);
    }

    #[tokio::test]
    async fn handler_panic_is_contained() {
        let f = fixture(ScriptedHandler::new(Script::Panic)).await;
        publish_event(&f, "OrderCreated").await;
        publish_event(&f, "OrderShipped").await;

        f.consumer.start_consuming().await.unwrap();
        settle().await;

        assert_eq!(f.broker.ready_count(DLQ), 2);
        assert!(f.consumer.is_consuming().await);
    }

    #[tokio::test]
    async fn resubscribes_on_its_own_after_connection_loss() {
        let handler = ScriptedHandler::new(Script::Succeed);
        let f = fixture_with(handler.clone(), fast_policy(5)).await;
        f.consumer.start_consuming().await.unwrap();

        f.broker.simulate_connection_loss();
        let mut resumed = false;
        for _ in 0..200 {
            if f.consumer.is_consuming().await {
                resumed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(resumed, "consumer did not resubscribe");

        let producer = f.broker.connect().await.unwrap();
        publish_on(producer.as_ref(), "OrderCreated").await;
        settle().await;

        assert_eq!(handler.seen(), vec!["OrderCreated"]);
        assert_eq!(f.broker.unacked_count(DEFAULT_QUEUE), 0);
        assert_eq!(f.metrics.gauge_history(CONSUMER_STATUS), vec![1.0, 0.0, 1.0]);
    }

    #[tokio::test]
    async fn gives_up_after_the_reconnect_budget() {
        let f = fixture_with(ScriptedHandler::new(Script::Succeed), fast_policy(2)).await;
        f.consumer.start_consuming().await.unwrap();

        f.broker.fail_next_connects(1_000);
        f.broker.simulate_connection_loss();
        tokio::time::sleep(Duration::from_millis(150)).await;

        // The broker is back, but nobody is resubscribing any more.
        f.broker.fail_next_connects(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!f.consumer.is_consuming().await);
        assert_eq!(f.metrics.gauge(CONSUMER_STATUS), Some(0.0));

        f.consumer.start_consuming().await.unwrap();
        assert!(f.consumer.is_consuming().await);
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_is_safe_twice() {
        let f = fixture(ScriptedHandler::new(Script::Succeed)).await;

        f.consumer.start_consuming().await.unwrap();
        f.consumer.start_consuming().await.unwrap();
        assert!(f.consumer.is_consuming().await);

        f.consumer.stop_consuming().await.unwrap();
        f.consumer.stop_consuming().await.unwrap();
        assert!(!f.consumer.is_consuming().await);
        assert_eq!(f.metrics.gauge(CONSUMER_STATUS), Some(0.0));
    }
}
