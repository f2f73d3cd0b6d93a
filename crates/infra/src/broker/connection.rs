//! Broker connection lifecycle.
//!
//! [`ConnectionManager`] hands out the live channel and hides reconnects from
//! callers. Callers resolve the channel per operation via [`ConnectionManager::connect`]
//! instead of caching it.
//!
//! ## Single flight
//!
//! Attempts run under an async mutex. A caller that queued behind an in-flight
//! attempt receives that attempt's outcome instead of opening a second
//! connection.
//!
//! ## Reconnects
//!
//! When the channel fails or closes unexpectedly (or an attempt fails), a
//! reconnect is scheduled after `interval`, up to `max_attempts` in a row. A
//! successful connect resets the counter. Once the cap is hit the manager stays
//! disconnected until someone calls `connect()` again. A deliberate
//! [`close`](ConnectionManager::close) never triggers a reconnect.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use eventrelay_observability::MetricsSink;

use crate::config::{DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_RECONNECT_INTERVAL};

use super::transport::{BrokerChannel, BrokerConnector, ChannelState, TransportError};

pub const CONNECTION_STATUS: &str = "broker_connection_status";
pub const CONNECTION_FAILURES: &str = "broker_connection_failures";
pub const CONNECTION_ERRORS: &str = "broker_connection_errors";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("broker unavailable: {0}")]
    Unavailable(#[source] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

type Outcome = Result<Arc<dyn BrokerChannel>, ConnectionError>;

#[derive(Default)]
struct ConnState {
    channel: Option<Arc<dyn BrokerChannel>>,
    /// Bumped on every successful open and on close; stale watchers compare against it.
    generation: u64,
    last_outcome: Option<Outcome>,
}

impl ConnState {
    fn live_channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel.as_ref().filter(|c| c.is_open()).cloned()
    }
}

struct Inner {
    connector: Arc<dyn BrokerConnector>,
    policy: ReconnectPolicy,
    metrics: Arc<dyn MetricsSink>,
    state: Mutex<ConnState>,
    attempts_started: AtomicU64,
    reconnect_attempts: AtomicU32,
    reconnect_pending: AtomicBool,
    closing: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("policy", &self.inner.policy)
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        policy: ReconnectPolicy,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                metrics,
                state: Mutex::new(ConnState::default()),
                attempts_started: AtomicU64::new(0),
                reconnect_attempts: AtomicU32::new(0),
                reconnect_pending: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Return the live channel, opening one if needed.
    ///
    /// Calling this after [`close`](Self::close) re-arms automatic reconnects.
    pub async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, ConnectionError> {
        self.inner.closing.store(false, Ordering::SeqCst);
        self.establish().await
    }

    /// Consecutive reconnect attempts scheduled since the last successful connect.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.state.lock().await.live_channel().is_some()
    }

    /// Close the channel on purpose. No reconnect follows.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.inner.closing.store(true, Ordering::SeqCst);

        let channel = {
            let mut state = self.inner.state.lock().await;
            state.generation += 1;
            state.last_outcome = None;
            state.channel.take()
        };

        self.inner.metrics.record_gauge(CONNECTION_STATUS, 0.0, &[]);

        if let Some(channel) = channel {
            channel.close().await.map_err(ConnectionError::Unavailable)?;
        }
        info!("broker connection closed");
        Ok(())
    }

    async fn establish(&self) -> Outcome {
        let observed = self.inner.attempts_started.load(Ordering::SeqCst);
        let mut state = self.inner.state.lock().await;

        if let Some(channel) = state.live_channel() {
            return Ok(channel);
        }

        // Another caller finished an attempt while we waited on the lock.
        if self.inner.attempts_started.load(Ordering::SeqCst) != observed {
            if let Some(outcome) = state.last_outcome.clone() {
                return outcome;
            }
        }

        self.inner.attempts_started.fetch_add(1, Ordering::SeqCst);

        let outcome = match self.inner.connector.connect().await {
            Ok(channel) => {
                state.generation += 1;
                state.channel = Some(Arc::clone(&channel));
                self.inner.reconnect_attempts.store(0, Ordering::SeqCst);
                self.inner.metrics.record_gauge(CONNECTION_STATUS, 1.0, &[]);
                self.watch_channel(channel.lifecycle(), state.generation);
                info!("connected to broker");
                Ok(channel)
            }
            Err(err) => {
                state.channel = None;
                self.inner.metrics.record_gauge(CONNECTION_STATUS, 0.0, &[]);
                self.inner.metrics.increment_counter(CONNECTION_FAILURES, 1, &[]);
                error!(error = %err, "failed to connect to broker");
                Err(ConnectionError::Unavailable(err))
            }
        };

        state.last_outcome = Some(outcome.clone());
        drop(state);

        if outcome.is_err() {
            self.schedule_reconnect();
        }
        outcome
    }

    fn schedule_reconnect(&self) {
        let inner = &self.inner;
        if inner.closing.load(Ordering::SeqCst) {
            return;
        }

        let max_attempts = inner.policy.max_attempts;
        if inner.reconnect_attempts.load(Ordering::SeqCst) >= max_attempts {
            error!(max_attempts, "reconnect attempts exhausted; staying disconnected");
            return;
        }
        if inner.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }

        let attempt = inner.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let interval = inner.policy.interval;
        info!(
            attempt,
            max_attempts,
            interval_ms = interval.as_millis() as u64,
            "scheduling broker reconnect"
        );

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.reconnect_pending.store(false, Ordering::SeqCst);
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            let _ = ConnectionManager { inner }.establish().await;
        });
    }

    fn watch_channel(&self, mut lifecycle: watch::Receiver<ChannelState>, generation: u64) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            let down = loop {
                let current = lifecycle.borrow_and_update().clone();
                match current {
                    ChannelState::Open => {
                        if lifecycle.changed().await.is_err() {
                            let last = lifecycle.borrow().clone();
                            break match last {
                                ChannelState::Open => {
                                    ChannelState::Failed("channel dropped".to_string())
                                }
                                other => other,
                            };
                        }
                    }
                    other => break other,
                }
            };

            let Some(inner) = weak.upgrade() else {
                return;
            };
            ConnectionManager { inner }.on_channel_down(generation, down).await;
        });
    }

    async fn on_channel_down(&self, generation: u64, down: ChannelState) {
        {
            let mut state = self.inner.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.channel = None;
            state.last_outcome = None;
        }

        if self.inner.closing.load(Ordering::SeqCst) {
            return;
        }

        self.inner.metrics.record_gauge(CONNECTION_STATUS, 0.0, &[]);
        match &down {
            ChannelState::Failed(reason) => {
                self.inner.metrics.increment_counter(CONNECTION_ERRORS, 1, &[]);
                error!(reason = %reason, "broker channel error");
            }
            ChannelState::Closed => warn!("broker channel closed"),
            ChannelState::Open => {}
        }

        self.schedule_reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::in_memory::InMemoryBroker;
    use eventrelay_observability::InMemoryMetrics;

    fn manager(broker: &InMemoryBroker, metrics: &Arc<InMemoryMetrics>, policy: ReconnectPolicy) -> ConnectionManager {
        ConnectionManager::new(Arc::new(broker.clone()), policy, metrics.clone())
    }

    fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts,
            interval: Duration::from_millis(10),
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn reuses_the_open_channel() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = manager(&broker, &metrics, fast_policy(3));

        manager.connect().await.unwrap();
        manager.connect().await.unwrap();

        assert_eq!(broker.connect_count(), 1);
        assert!(manager.is_connected().await);
        assert_eq!(metrics.gauge(CONNECTION_STATUS), Some(1.0));
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_attempt() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = manager(&broker, &metrics, fast_policy(3));

        let results = futures_join(&manager, 8).await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(broker.connect_count(), 1);
    }

    async fn futures_join(manager: &ConnectionManager, n: usize) -> Vec<Outcome> {
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.connect().await })
            })
            .collect();
        let mut results = Vec::with_capacity(n);
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test]
    async fn reconnects_after_connection_loss() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = manager(&broker, &metrics, fast_policy(5));
        manager.connect().await.unwrap();

        broker.simulate_connection_loss();

        wait_until(|| broker.connect_count() == 2).await;
        assert!(manager.is_connected().await);
        assert_eq!(metrics.gauge_history(CONNECTION_STATUS), vec![1.0, 0.0, 1.0]);
        assert_eq!(metrics.counter(CONNECTION_ERRORS), 1);
        assert_eq!(manager.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn failed_connect_schedules_bounded_retries() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = manager(&broker, &metrics, fast_policy(2));
        broker.fail_next_connects(10);

        assert!(manager.connect().await.is_err());

        wait_until(|| metrics.counter(CONNECTION_FAILURES) == 3).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(metrics.counter(CONNECTION_FAILURES), 3);
        assert_eq!(manager.reconnect_attempts(), 2);
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn deliberate_close_does_not_reconnect() {
        let broker = InMemoryBroker::new();
        let metrics = Arc::new(InMemoryMetrics::new());
        let manager = manager(&broker, &metrics, fast_policy(3));
        manager.connect().await.unwrap();

        manager.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(broker.connect_count(), 1);
        assert!(!manager.is_connected().await);
        assert_eq!(metrics.gauge(CONNECTION_STATUS), Some(0.0));

        manager.connect().await.unwrap();
        assert_eq!(broker.connect_count(), 2);
    }
}
