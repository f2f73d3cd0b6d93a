//! In-memory topic broker for tests/dev.
//!
//! Mimics the parts of an AMQP broker the relay depends on:
//!
//! - topic / direct / fanout exchanges, plus the default `""` exchange that
//!   routes straight to the queue named by the routing key
//! - prefetch 1 per consumer, round-robin across consumers of a queue
//! - `nack(requeue = true)` puts the message back at the head, flagged `redelivered`
//! - `nack(requeue = false)` and TTL expiry route to the queue's dead-letter
//!   exchange with the original routing key
//! - closing or losing a channel requeues its unacknowledged deliveries
//!
//! TTL is checked when a message reaches the head of the queue (as RabbitMQ
//! does) or on [`InMemoryBroker::expire_messages`].
//!
//! Fault injection: [`simulate_connection_loss`](InMemoryBroker::simulate_connection_loss),
//! [`fail_next_connects`](InMemoryBroker::fail_next_connects) and
//! [`set_publish_blocked`](InMemoryBroker::set_publish_blocked).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use eventrelay_events::topic_matches;

use super::transport::{
    BrokerChannel, BrokerConnector, ChannelState, Delivery, ExchangeKind, ExchangeSpec,
    MessageProperties, QueueSpec, TransportError,
};

const CONSUMER_BUFFER: usize = 16;

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    properties: MessageProperties,
    redelivered: bool,
    enqueued_at: Instant,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            redelivered: self.redelivered,
            body: self.body.clone(),
            properties: self.properties.clone(),
        }
    }
}

#[derive(Debug)]
struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    sender: mpsc::Sender<Delivery>,
    in_flight: usize,
}

#[derive(Debug)]
struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    fn new(spec: QueueSpec) -> Self {
        Self {
            spec,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn is_expired(&self, message: &StoredMessage) -> bool {
        self.spec
            .message_ttl
            .is_some_and(|ttl| message.enqueued_at.elapsed() >= ttl)
    }

    /// Next consumer with a free prefetch slot, round-robin.
    fn idle_consumer(&mut self) -> Option<usize> {
        let n = self.consumers.len();
        let start = self.next_consumer % n.max(1);
        let idx = (0..n)
            .map(|offset| (start + offset) % n)
            .find(|&i| self.consumers[i].in_flight == 0)?;
        self.next_consumer = idx + 1;
        Some(idx)
    }
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    channel_id: u64,
    consumer_tag: String,
    message: StoredMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    key: String,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    bindings: Vec<Binding>,
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    channels: HashMap<u64, watch::Sender<ChannelState>>,
    next_channel_id: u64,
    next_delivery_tag: u64,
    failing_connects: u32,
    publish_blocked: bool,
    connect_count: u64,
}

impl BrokerState {
    fn ensure_open(&self, channel_id: u64) -> Result<(), TransportError> {
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed)
        }
    }

    /// Route a message to every matching queue; returns how many queues got a copy.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, TransportError> {
        let mut targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|spec| spec.kind)
                .ok_or_else(|| TransportError::NotFound(format!("exchange '{exchange}'")))?;
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.key, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        for queue in &targets {
            if let Some(state) = self.queues.get_mut(queue) {
                state.ready.push_back(message.clone());
            }
        }
        for queue in &targets {
            self.pump(queue);
        }

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable; dropped");
        }
        Ok(targets.len())
    }

    /// Hand ready messages to idle consumers until one side runs out.
    fn pump(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.consumers.retain(|c| !c.sender.is_closed());
            let Some(idx) = queue.idle_consumer() else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            if queue.is_expired(&message) {
                let spec = queue.spec.clone();
                self.dead_letter(&spec, message);
                continue;
            }

            self.next_delivery_tag += 1;
            let tag = self.next_delivery_tag;
            let consumer = &mut queue.consumers[idx];

            match consumer.sender.try_send(message.to_delivery(tag)) {
                Ok(()) => {
                    consumer.in_flight += 1;
                    self.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            channel_id: consumer.channel_id,
                            consumer_tag: consumer.tag.clone(),
                            message,
                        },
                    );
                }
                Err(_) => {
                    queue.consumers.remove(idx);
                    queue.ready.push_front(message);
                }
            }
        }
    }

    fn dead_letter(&mut self, spec: &QueueSpec, mut message: StoredMessage) {
        let Some(dlx) = spec.dead_letter_exchange.clone() else {
            debug!(queue = %spec.name, routing_key = %message.routing_key, "rejected message dropped");
            return;
        };

        message.exchange = dlx.clone();
        message.redelivered = false;
        message.enqueued_at = Instant::now();
        let routing_key = message.routing_key.clone();

        debug!(queue = %spec.name, dead_letter_exchange = %dlx, routing_key = %routing_key, "message dead-lettered");
        if let Err(err) = self.route(&dlx, &routing_key, message) {
            warn!(queue = %spec.name, error = %err, "dead-letter exchange missing; message dropped");
        }
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> Result<Unacked, TransportError> {
        let belongs_to_channel = self
            .unacked
            .get(&delivery_tag)
            .is_some_and(|u| u.channel_id == channel_id);
        if !belongs_to_channel {
            return Err(TransportError::Protocol(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        }

        let unacked = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| TransportError::Protocol(format!("unknown delivery tag {delivery_tag}")))?;

        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            if let Some(consumer) = queue
                .consumers
                .iter_mut()
                .find(|c| c.tag == unacked.consumer_tag && c.channel_id == channel_id)
            {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }
        }
        Ok(unacked)
    }

    fn requeue_front(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }

    fn close_channel(&mut self, channel_id: u64, reason: ChannelState) {
        if let Some(sender) = self.channels.remove(&channel_id) {
            sender.send_replace(reason);
        }

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.channel_id != channel_id);
        }

        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.channel_id == channel_id)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        let mut touched = Vec::new();
        for tag in tags.into_iter().rev() {
            if let Some(unacked) = self.unacked.remove(&tag) {
                touched.push(unacked.queue.clone());
                self.requeue_front(unacked);
            }
        }

        touched.sort();
        touched.dedup();
        for queue in touched {
            self.pump(&queue);
        }
    }
}

fn binding_matches(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic_matches(binding_key, routing_key),
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
    }
}

/// Shared in-memory broker. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every open channel as if the TCP connection dropped.
    pub fn simulate_connection_loss(&self) {
        let mut state = self.lock();
        let ids: Vec<u64> = state.channels.keys().copied().collect();
        for id in ids {
            state.close_channel(id, ChannelState::Failed("connection reset by broker".to_string()));
        }
        warn!("simulated broker connection loss");
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().failing_connects = n;
    }

    /// While blocked, publishes are still routed but report backpressure.
    pub fn set_publish_blocked(&self, blocked: bool) {
        self.lock().publish_blocked = blocked;
    }

    /// Successful connects so far.
    pub fn connect_count(&self) -> u64 {
        self.lock().connect_count
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    pub fn exchange_exists(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    pub fn queue_spec(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).map(|q| q.spec.clone())
    }

    pub fn bindings_for(&self, queue: &str) -> Vec<(String, String)> {
        self.lock()
            .bindings
            .iter()
            .filter(|b| b.queue == queue)
            .map(|b| (b.exchange.clone(), b.key.clone()))
            .collect()
    }

    /// Messages waiting in a queue (not delivered).
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed to consumers but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .unacked
            .values()
            .filter(|u| u.queue == queue)
            .count()
    }

    /// Snapshot of the ready messages of a queue, head first. Delivery tags are 0.
    pub fn ready_messages(&self, queue: &str) -> Vec<Delivery> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.to_delivery(0)).collect())
            .unwrap_or_default()
    }

    /// Dead-letter every expired message, wherever it sits in its queue.
    pub fn expire_messages(&self) {
        let mut state = self.lock();
        let names: Vec<String> = state.queues.keys().cloned().collect();

        for name in names {
            let Some(queue) = state.queues.get_mut(&name) else {
                continue;
            };
            let spec = queue.spec.clone();
            let (expired, live): (Vec<StoredMessage>, Vec<StoredMessage>) =
                queue.ready.drain(..).partition(|m| {
                    spec.message_ttl
                        .is_some_and(|ttl| m.enqueued_at.elapsed() >= ttl)
                });
            queue.ready = live.into();

            for message in expired {
                state.dead_letter(&spec, message);
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let (id, lifecycle) = {
            let mut state = self.lock();
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(TransportError::ConnectFailed(
                    "connection refused (simulated)".to_string(),
                ));
            }

            state.next_channel_id += 1;
            state.connect_count += 1;
            let id = state.next_channel_id;
            let (sender, receiver) = watch::channel(ChannelState::Open);
            state.channels.insert(id, sender);
            (id, receiver)
        };

        debug!(channel_id = id, "in-memory broker channel opened");
        Ok(Arc::new(InMemoryChannel {
            id,
            broker: self.clone(),
            lifecycle,
        }))
    }
}

/// Channel handle onto an [`InMemoryBroker`].
#[derive(Debug)]
pub struct InMemoryChannel {
    id: u64,
    broker: InMemoryBroker,
    lifecycle: watch::Receiver<ChannelState>,
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    fn lifecycle(&self) -> watch::Receiver<ChannelState> {
        self.lifecycle.clone()
    }

    async fn assert_exchange(&self, spec: &ExchangeSpec) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.kind != spec.kind || existing.durable != spec.durable => {
                Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED: exchange '{}' redeclared with different arguments",
                    spec.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn assert_queue(&self, spec: &QueueSpec) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        match state.queues.get(&spec.name) {
            Some(existing)
                if existing.spec.dead_letter_exchange != spec.dead_letter_exchange
                    || existing.spec.message_ttl != spec.message_ttl =>
            {
                Err(TransportError::Protocol(format!(
                    "PRECONDITION_FAILED: queue '{}' redeclared with different arguments",
                    spec.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(spec.name.clone(), QueueState::new(spec.clone()));
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        binding_key: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        if !state.exchanges.contains_key(exchange) {
            return Err(TransportError::NotFound(format!("exchange '{exchange}'")));
        }
        if !state.queues.contains_key(queue) {
            return Err(TransportError::NotFound(format!("queue '{queue}'")));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            key: binding_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &MessageProperties,
    ) -> Result<bool, TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            properties: properties.clone(),
            redelivered: false,
            enqueued_at: Instant::now(),
        };
        state.route(exchange, routing_key, message)?;
        Ok(!state.publish_blocked)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<mpsc::Receiver<Delivery>, TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let slots = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| TransportError::NotFound(format!("queue '{queue}'")))?;
        if slots.consumers.iter().any(|c| c.tag == consumer_tag) {
            return Err(TransportError::Protocol(format!(
                "NOT_ALLOWED: consumer tag '{consumer_tag}' already in use"
            )));
        }

        let (sender, receiver) = mpsc::channel(CONSUMER_BUFFER);
        slots.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel_id: self.id,
            sender,
            in_flight: 0,
        });
        state.pump(queue);

        Ok(receiver)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let unacked = state.settle(self.id, delivery_tag)?;
        state.pump(&unacked.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        let unacked = state.settle(self.id, delivery_tag)?;
        let queue = unacked.queue.clone();
        if requeue {
            state.requeue_front(unacked);
        } else if let Some(spec) = state.queues.get(&queue).map(|q| q.spec.clone()) {
            state.dead_letter(&spec, unacked.message);
        }
        state.pump(&queue);
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let mut state = self.broker.lock();
        state.ensure_open(self.id)?;

        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.tag == consumer_tag && c.channel_id == self.id));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.broker.lock().close_channel(self.id, ChannelState::Closed);
        Ok(())
    }
}
