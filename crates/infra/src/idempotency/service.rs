//! Idempotent event handling on top of the processed-event ledger.
//!
//! ## Flow per event
//!
//! 1. Lock the event id (in-process keyed mutex).
//! 2. A COMPLETED record short-circuits to success; the handler is not called.
//! 3. No registered handler fails with `HandlerNotFound` and writes nothing.
//! 4. A record that used up its retries (or failed permanently) fails with
//!    `RetriesExhausted` without calling the handler.
//! 5. The record is saved/updated as PROCESSING, envelope included.
//! 6. The handler runs; the record ends COMPLETED or FAILED. A failure that
//!    uses up the last retry also flags the record exhausted.
//!
//! Records left FAILED are picked up again by [`IdempotentEventHandlerService::retry_failed_events`],
//! which rebuilds each event from its stored envelope once its backoff has elapsed.
//! Permanent and exhausted records are never selected again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use eventrelay_core::EventId;
use eventrelay_events::{DomainEvent, HandlerError};
use eventrelay_observability::MetricsSink;

use crate::broker::MessageHandler;
use crate::processed_events::{
    ProcessedEventRecord, ProcessedEventStore, ProcessingStatus, RepositoryError,
};

use super::keyed_lock::KeyedLock;
use super::retry::RetryConfig;

pub const EVENT_PROCESSING_DURATION: &str = "event_processing_duration_ms";
pub const EVENT_ALREADY_PROCESSED: &str = "event_already_processed";
pub const EVENT_NO_HANDLER: &str = "event_no_handler";
pub const EVENT_PROCESSING_STARTED: &str = "event_processing_started";
pub const EVENT_PROCESSING_SUCCEEDED: &str = "event_processing_succeeded";
pub const EVENT_PROCESSING_FAILED: &str = "event_processing_failed";
pub const EVENT_PROCESSING_ERROR: &str = "event_processing_error";
pub const EVENT_RETRIES_EXHAUSTED: &str = "event_retries_exhausted";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    #[error("no handler registered for event type {0}")]
    HandlerNotFound(String),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error("event {event_id} given up after {attempts} failed attempts: {last_error}")]
    RetriesExhausted {
        event_id: EventId,
        attempts: u32,
        last_error: String,
    },

    #[error("processed-event store failure: {0}")]
    Repository(#[from] RepositoryError),
}

impl HandleError {
    /// Whether redelivering the same message can possibly succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            Self::HandlerNotFound(_) | Self::RetriesExhausted { .. } => true,
            Self::Handler(err) => err.is_permanent(),
            Self::Repository(_) => false,
        }
    }
}

/// Business logic reacting to one event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> EventHandler for Arc<H>
where
    H: EventHandler + ?Sized,
{
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

/// Adapts an async closure taking an owned event.
pub struct FnHandler<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        (self.0)(event.clone()).await
    }
}

#[derive(Clone)]
struct Registration {
    handler: Arc<dyn EventHandler>,
    retry: RetryConfig,
}

/// Outcome of one [`IdempotentEventHandlerService::retry_failed_events`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    /// FAILED records returned by the store.
    pub selected: usize,
    /// Records re-dispatched to their handler.
    pub retried: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Records left alone: no handler, exhausted, permanent, backoff pending or no envelope.
    pub skipped: usize,
}

pub struct IdempotentEventHandlerService {
    store: Arc<dyn ProcessedEventStore>,
    handlers: RwLock<HashMap<String, Registration>>,
    locks: KeyedLock<EventId>,
    metrics: Arc<dyn MetricsSink>,
}

impl std::fmt::Debug for IdempotentEventHandlerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdempotentEventHandlerService")
            .field("event_types", &self.registered_event_types())
            .finish()
    }
}

impl IdempotentEventHandlerService {
    pub fn new(store: Arc<dyn ProcessedEventStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            handlers: RwLock::new(HashMap::new()),
            locks: KeyedLock::new(),
            metrics,
        }
    }

    /// Register with the default [`RetryConfig`]. A later registration for the
    /// same event type replaces this one.
    pub fn register_handler<H>(&self, event_type: impl Into<String>, handler: H)
    where
        H: EventHandler + 'static,
    {
        self.register_handler_with_retry(event_type, handler, RetryConfig::default());
    }

    pub fn register_handler_with_retry<H>(
        &self,
        event_type: impl Into<String>,
        handler: H,
        retry: RetryConfig,
    ) where
        H: EventHandler + 'static,
    {
        let event_type = event_type.into();
        debug!(event_type = %event_type, max_retries = retry.max_retries, "registering event handler");
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                event_type,
                Registration {
                    handler: Arc::new(handler),
                    retry,
                },
            );
    }

    pub fn has_handler(&self, event_type: &str) -> bool {
        self.registration(event_type).is_some()
    }

    pub fn registered_event_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    fn registration(&self, event_type: &str) -> Option<Registration> {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_type)
            .cloned()
    }

    /// Handle `event` at most once to completion, keyed by its event id.
    pub async fn handle_event(&self, event: &DomainEvent) -> Result<(), HandleError> {
        let started = Instant::now();
        let result = {
            let _guard = self.locks.lock(event.event_id()).await;
            self.process(event).await
        };

        let outcome = match &result {
            Ok(()) => "ok",
            Err(err) if err.is_permanent() => "permanent_error",
            Err(_) => "error",
        };
        self.metrics.record_histogram(
            EVENT_PROCESSING_DURATION,
            started.elapsed().as_secs_f64() * 1000.0,
            &[("event_type", event.event_type()), ("outcome", outcome)],
        );
        result
    }

    /// Caller holds the lock for `event`'s id.
    async fn process(&self, event: &DomainEvent) -> Result<(), HandleError> {
        let event_id = event.event_id();
        let event_type = event.event_type();
        let tags = [("event_type", event_type)];

        let existing = self
            .store
            .find(event_id)
            .await
            .map_err(|e| self.repository_failure(event, e))?;

        if existing.as_ref().is_some_and(ProcessedEventRecord::is_completed) {
            info!(event_id = %event_id, event_type, "event already processed; skipping");
            self.metrics.increment_counter(EVENT_ALREADY_PROCESSED, 1, &tags);
            return Ok(());
        }

        let Some(registration) = self.registration(event_type) else {
            warn!(event_id = %event_id, event_type, "no handler registered for event type");
            self.metrics.increment_counter(EVENT_NO_HANDLER, 1, &tags);
            return Err(HandleError::HandlerNotFound(event_type.to_string()));
        };

        let mut record = match existing {
            Some(mut record) => {
                if record.is_permanent() || registration.retry.is_exhausted(record.retry_count) {
                    warn!(
                        event_id = %event_id,
                        event_type,
                        attempts = record.retry_count,
                        "event already exhausted its retries; not invoking handler"
                    );
                    self.metrics.increment_counter(EVENT_RETRIES_EXHAUSTED, 1, &tags);
                    if record.is_retry_candidate() {
                        record.mark_exhausted();
                        if let Err(err) = self.store.update(&record).await {
                            warn!(event_id = %event_id, error = %err, "could not flag record as exhausted");
                        }
                    }
                    return Err(HandleError::RetriesExhausted {
                        event_id,
                        attempts: record.retry_count,
                        last_error: record.error.unwrap_or_default(),
                    });
                }
                record.mark_processing(event);
                self.store
                    .update(&record)
                    .await
                    .map_err(|e| self.repository_failure(event, e))?;
                record
            }
            None => {
                let record = ProcessedEventRecord::processing(event);
                self.store
                    .save(&record)
                    .await
                    .map_err(|e| self.repository_failure(event, e))?;
                record
            }
        };

        info!(event_id = %event_id, event_type, attempt = record.retry_count + 1, "processing event");
        self.metrics.increment_counter(EVENT_PROCESSING_STARTED, 1, &tags);

        match registration.handler.handle(event).await {
            Ok(()) => {
                record.mark_completed();
                self.store
                    .update(&record)
                    .await
                    .map_err(|e| self.repository_failure(event, e))?;
                info!(event_id = %event_id, event_type, "event processed");
                self.metrics.increment_counter(EVENT_PROCESSING_SUCCEEDED, 1, &tags);
                Ok(())
            }
            Err(err) => {
                record.mark_failed(err.message(), err.is_permanent());
                let exhausted =
                    !err.is_permanent() && registration.retry.is_exhausted(record.retry_count);
                if exhausted {
                    record.mark_exhausted();
                }
                self.store
                    .update(&record)
                    .await
                    .map_err(|e| self.repository_failure(event, e))?;
                error!(
                    event_id = %event_id,
                    event_type,
                    attempt = record.retry_count,
                    permanent = err.is_permanent(),
                    error = %err,
                    "event handler failed"
                );
                self.metrics.increment_counter(EVENT_PROCESSING_FAILED, 1, &tags);

                if exhausted {
                    self.metrics.increment_counter(EVENT_RETRIES_EXHAUSTED, 1, &tags);
                    return Err(HandleError::RetriesExhausted {
                        event_id,
                        attempts: record.retry_count,
                        last_error: err.message().to_string(),
                    });
                }
                Err(HandleError::Handler(err))
            }
        }
    }

    fn repository_failure(&self, event: &DomainEvent, err: RepositoryError) -> HandleError {
        error!(
            event_id = %event.event_id(),
            event_type = event.event_type(),
            error = %err,
            "processed-event store failure"
        );
        self.metrics
            .increment_counter(EVENT_PROCESSING_ERROR, 1, &[("event_type", event.event_type())]);
        HandleError::Repository(err)
    }

    /// Re-dispatch FAILED events whose backoff has elapsed, oldest first.
    pub async fn retry_failed_events(&self, limit: usize) -> Result<RetryReport, HandleError> {
        let candidates = self.store.find_failed_for_retry(limit).await?;
        let mut report = RetryReport {
            selected: candidates.len(),
            ..RetryReport::default()
        };

        for candidate in candidates {
            let event_id = candidate.event_id;
            let event_type = candidate.event_type.as_str();

            let Some(registration) = self.registration(event_type) else {
                warn!(event_id = %event_id, event_type, "no handler registered; cannot retry");
                report.skipped += 1;
                continue;
            };
            if candidate.is_permanent() || registration.retry.is_exhausted(candidate.retry_count) {
                debug!(event_id = %event_id, event_type, attempts = candidate.retry_count, "not retrying");
                self.retire(event_id).await;
                report.skipped += 1;
                continue;
            }
            let backoff = registration
                .retry
                .delay_for_attempt(candidate.retry_count.saturating_sub(1));
            let waited = (Utc::now() - candidate.processed_at)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if waited < backoff {
                debug!(event_id = %event_id, event_type, ?backoff, "backoff pending");
                report.skipped += 1;
                continue;
            }
            let Some(envelope) = candidate.envelope.clone() else {
                warn!(event_id = %event_id, event_type, "record has no stored envelope; cannot retry");
                report.skipped += 1;
                continue;
            };
            let event = envelope.into_event();

            let _guard = self.locks.lock(event_id).await;

            // Another worker or a redelivery may have moved it on meanwhile.
            let mut current = match self.store.find(event_id).await {
                Ok(Some(record)) if record.status == ProcessingStatus::Failed => record,
                Ok(_) => {
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(event_id = %event_id, error = %err, "could not reload record for retry");
                    report.failed += 1;
                    continue;
                }
            };
            current.mark_retrying();
            if let Err(err) = self.store.update(&current).await {
                warn!(event_id = %event_id, error = %err, "could not mark record as retrying");
                report.failed += 1;
                continue;
            }

            report.retried += 1;
            info!(event_id = %event_id, event_type, attempt = current.retry_count + 1, "retrying failed event");
            match self.process(&event).await {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    debug!(event_id = %event_id, error = %err, "retry failed");
                    report.failed += 1;
                }
            }
        }

        if report.selected > 0 {
            info!(
                selected = report.selected,
                retried = report.retried,
                succeeded = report.succeeded,
                failed = report.failed,
                skipped = report.skipped,
                "retry pass finished"
            );
        }
        Ok(report)
    }

    /// Flag a FAILED record that reached its bound so later passes skip it in the store.
    async fn retire(&self, event_id: EventId) {
        let _guard = self.locks.lock(event_id).await;
        match self.store.find(event_id).await {
            Ok(Some(mut record)) if record.is_retry_candidate() => {
                record.mark_exhausted();
                if let Err(err) = self.store.update(&record).await {
                    warn!(event_id = %event_id, error = %err, "could not flag record as exhausted");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(event_id = %event_id, error = %err, "could not reload record to retire it"),
        }
    }
}

#[async_trait]
impl MessageHandler for IdempotentEventHandlerService {
    async fn handle_message(&self, event: DomainEvent) -> Result<(), HandleError> {
        self.handle_event(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processed_events::InMemoryProcessedEventStore;
    use eventrelay_core::AggregateId;
    use eventrelay_observability::InMemoryMetrics;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails its first `failures` calls, then succeeds.
    struct Flaky {
        calls: AtomicU32,
        failures: u32,
        permanent: bool,
    }

    impl Flaky {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures,
                permanent: false,
            })
        }

        fn permanent() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures: u32::MAX,
                permanent: true,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl EventHandler for Flaky {
        async fn handle(&self, _event: &DomainEvent) -> Result<(), HandlerError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                if self.permanent {
                    return Err(HandlerError::permanent("unknown customer"));
                }
                return Err(HandlerError::transient("db busy"));
            }
            Ok(())
        }
    }

    struct Fixture {
        store: Arc<InMemoryProcessedEventStore>,
        metrics: Arc<InMemoryMetrics>,
        service: IdempotentEventHandlerService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryProcessedEventStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let service = IdempotentEventHandlerService::new(store.clone(), metrics.clone());
        Fixture {
            store,
            metrics,
            service,
        }
    }

    fn order_created() -> DomainEvent {
        DomainEvent::new(AggregateId::new(), "OrderCreated", json!({ "total": 12 }))
    }

    #[tokio::test]
    async fn completed_event_is_not_handled_twice() {
        let f = fixture();
        let handler = Flaky::new(0);
        f.service.register_handler("OrderCreated", handler.clone());
        let event = order_created();

        f.service.handle_event(&event).await.unwrap();
        f.service.handle_event(&event).await.unwrap();

        assert_eq!(handler.calls(), 1);
        let record = f.store.find(event.event_id()).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Completed);
        assert_eq!(f.metrics.counter(EVENT_ALREADY_PROCESSED), 1);
        assert_eq!(f.metrics.histogram_count(EVENT_PROCESSING_DURATION), 2);
    }

    #[tokio::test]
    async fn missing_handler_writes_nothing() {
        let f = fixture();
        let event = order_created();

        let err = f.service.handle_event(&event).await.unwrap_err();

        assert_eq!(err, HandleError::HandlerNotFound("OrderCreated".to_string()));
        assert!(err.is_permanent());
        assert!(f.store.is_empty());
        assert_eq!(f.metrics.counter(EVENT_NO_HANDLER), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_recorded_and_retryable() {
        let f = fixture();
        f.service.register_handler("OrderCreated", Flaky::new(1));
        let event = order_created();

        let err = f.service.handle_event(&event).await.unwrap_err();

        assert_eq!(err, HandleError::Handler(HandlerError::transient("db busy")));
        assert!(!err.is_permanent());
        let record = f.store.find(event.event_id()).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert_eq!(record.retry_count, 1);
        assert_eq!(record.error.as_deref(), Some("db busy"));
        assert_eq!(record.envelope.map(|e| e.into_event()), Some(event.clone()));

        // Redelivery succeeds and completes the same record.
        f.service.handle_event(&event).await.unwrap();
        let record = f.store.find(event.event_id()).await.unwrap().unwrap();
        assert!(record.is_completed());
        assert_eq!(record.retry_count, 1);
    }

    #[tokio::test]
    async fn permanent_failure_is_flagged_and_never_rerun() {
        let f = fixture();
        let handler = Flaky::permanent();
        f.service.register_handler("OrderCreated", handler.clone());
        let event = order_created();

        let err = f.service.handle_event(&event).await.unwrap_err();
        assert!(err.is_permanent());

        let record = f.store.find(event.event_id()).await.unwrap().unwrap();
        assert!(record.is_permanent());

        let err = f.service.handle_event(&event).await.unwrap_err();
        assert!(matches!(err, HandleError::RetriesExhausted { attempts: 1, .. }));
        assert_eq!(handler.calls(), 1);

        let report = f.service.retry_failed_events(10).await.unwrap();
        assert_eq!(report, RetryReport::default());
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn last_allowed_failure_reports_exhaustion() {
        let f = fixture();
        let handler = Flaky::new(u32::MAX);
        f.service
            .register_handler_with_retry("OrderCreated", handler.clone(), RetryConfig::immediate(2));
        let event = order_created();

        let first = f.service.handle_event(&event).await.unwrap_err();
        let second = f.service.handle_event(&event).await.unwrap_err();
        let third = f.service.handle_event(&event).await.unwrap_err();

        assert!(matches!(first, HandleError::Handler(_)));
        assert_eq!(
            second,
            HandleError::RetriesExhausted {
                event_id: event.event_id(),
                attempts: 2,
                last_error: "db busy".to_string(),
            }
        );
        assert!(matches!(third, HandleError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(handler.calls(), 2);

        let record = f.store.find(event.event_id()).await.unwrap().unwrap();
        assert!(record.is_exhausted());
        assert!(!record.is_retry_candidate());
    }

    #[tokio::test]
    async fn dead_failures_do_not_starve_newer_retryable_ones() {
        let f = fixture();
        let bad = Flaky::permanent();
        let good = Flaky::new(1);
        f.service.register_handler("CustomerMerged", bad.clone());
        f.service
            .register_handler_with_retry("OrderCreated", good.clone(), RetryConfig::immediate(3));

        for _ in 0..10 {
            let event = DomainEvent::new(AggregateId::new(), "CustomerMerged", json!({}));
            let _ = f.service.handle_event(&event).await;
        }
        let event = order_created();
        let _ = f.service.handle_event(&event).await;
        assert_eq!(f.store.records_with_status(ProcessingStatus::Failed).len(), 11);

        let report = f.service.retry_failed_events(10).await.unwrap();

        assert_eq!(
            report,
            RetryReport {
                selected: 1,
                retried: 1,
                succeeded: 1,
                failed: 0,
                skipped: 0,
            }
        );
        assert_eq!(good.calls(), 2);
        assert_eq!(bad.calls(), 10);
        assert!(f.store.find(event.event_id()).await.unwrap().unwrap().is_completed());
    }

    #[tokio::test]
    async fn retry_pass_retires_records_past_a_lowered_bound() {
        let f = fixture();
        let handler = Flaky::new(u32::MAX);
        f.service
            .register_handler_with_retry("OrderCreated", handler.clone(), RetryConfig::immediate(3));
        let event = order_created();
        let _ = f.service.handle_event(&event).await;

        f.service
            .register_handler_with_retry("OrderCreated", handler.clone(), RetryConfig::immediate(1));
        let first = f.service.retry_failed_events(10).await.unwrap();
        let second = f.service.retry_failed_events(10).await.unwrap();

        assert_eq!(first.selected, 1);
        assert_eq!(first.skipped, 1);
        assert_eq!(second, RetryReport::default());
        assert_eq!(handler.calls(), 1);
        let record = f.store.find(event.event_id()).await.unwrap().unwrap();
        assert_eq!(record.status, ProcessingStatus::Failed);
        assert!(record.is_exhausted());
    }

    #[tokio::test]
    async fn retry_pass_rebuilds_event_from_envelope() {
        let f = fixture();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let calls = Arc::new(AtomicU32::new(0));
        {
            let seen = Arc::clone(&seen);
            let calls = Arc::clone(&calls);
            f.service.register_handler_with_retry(
                "OrderCreated",
                handler_fn(move |event: DomainEvent| {
                    let seen = Arc::clone(&seen);
                    let calls = Arc::clone(&calls);
                    async move {
                        seen.lock().unwrap().push(event);
                        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err(HandlerError::transient("db busy"))
                        } else {
                            Ok(())
                        }
                    }
                }),
                RetryConfig::immediate(3),
            );
        }
        let event = order_created();
        let _ = f.service.handle_event(&event).await;

        let report = f.service.retry_failed_events(10).await.unwrap();

        assert_eq!(
            report,
            RetryReport {
                selected: 1,
                retried: 1,
                succeeded: 1,
                failed: 0,
                skipped: 0,
            }
        );
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], event);
        assert!(f.store.find(event.event_id()).await.unwrap().unwrap().is_completed());
    }

    #[tokio::test]
    async fn retry_pass_respects_backoff() {
        let f = fixture();
        let handler = Flaky::new(1);
        f.service.register_handler_with_retry(
            "OrderCreated",
            handler.clone(),
            RetryConfig {
                initial_delay: Duration::from_secs(3600),
                ..RetryConfig::default()
            },
        );
        let event = order_created();
        let _ = f.service.handle_event(&event).await;

        let report = f.service.retry_failed_events(10).await.unwrap();

        assert_eq!(report.selected, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.retried, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_deliveries_of_one_event_run_the_handler_once() {
        let f = fixture();
        let handler = Flaky::new(0);
        f.service.register_handler("OrderCreated", handler.clone());
        let service = Arc::new(f.service);
        let event = order_created();

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let service = Arc::clone(&service);
            let event = event.clone();
            tasks.push(tokio::spawn(async move { service.handle_event(&event).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(handler.calls(), 1);
        assert_eq!(f.metrics.counter(EVENT_ALREADY_PROCESSED), 4);
    }

    #[tokio::test]
    async fn registration_is_last_wins() {
        let f = fixture();
        let first = Flaky::new(0);
        let second = Flaky::new(0);
        f.service.register_handler("OrderCreated", first.clone());
        f.service.register_handler("OrderCreated", second.clone());

        f.service.handle_event(&order_created()).await.unwrap();

        assert_eq!(first.calls(), 0);
        assert_eq!(second.calls(), 1);
        assert_eq!(f.service.registered_event_types(), vec!["OrderCreated".to_string()]);
    }
}
