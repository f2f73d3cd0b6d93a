use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use thiserror::Error;

use eventrelay_core::EventId;
use eventrelay_events::{DomainEvent, EventEnvelope};

const PERMANENT_FLAG: &str = "permanent";
const EXHAUSTED_FLAG: &str = "exhausted";

/// Lifecycle of one event id in the ledger.
///
/// ```text
/// (no record) -> PROCESSING -> COMPLETED
///                           -> FAILED -> RETRYING -> PROCESSING ...
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Retrying => "RETRYING",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = RepositoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PROCESSING" => Ok(Self::Processing),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "RETRYING" => Ok(Self::Retrying),
            other => Err(RepositoryError::Serialization(format!(
                "unknown processing status: {other}"
            ))),
        }
    }
}

/// Ledger entry keyed by the producer-assigned event id.
///
/// The envelope is kept so a failed event can be rebuilt for a retry without
/// going back to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedEventRecord {
    pub event_id: EventId,
    pub event_type: String,
    pub status: ProcessingStatus,
    /// Time of the last state change.
    pub processed_at: DateTime<Utc>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub metadata: Option<JsonValue>,
    pub envelope: Option<EventEnvelope>,
}

impl ProcessedEventRecord {
    /// Fresh record for an event about to be handled.
    pub fn processing(event: &DomainEvent) -> Self {
        Self {
            event_id: event.event_id(),
            event_type: event.event_type().to_string(),
            status: ProcessingStatus::Processing,
            processed_at: Utc::now(),
            retry_count: 0,
            error: None,
            metadata: None,
            envelope: Some(EventEnvelope::from_event(event)),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == ProcessingStatus::Completed
    }

    /// Set when the handler classified its failure as permanent.
    pub fn is_permanent(&self) -> bool {
        self.flag(PERMANENT_FLAG)
    }

    /// Set once the failure count reached the handler's retry bound.
    pub fn is_exhausted(&self) -> bool {
        self.flag(EXHAUSTED_FLAG)
    }

    /// FAILED and neither permanent nor exhausted.
    pub fn is_retry_candidate(&self) -> bool {
        self.status == ProcessingStatus::Failed && !self.is_permanent() && !self.is_exhausted()
    }

    pub fn mark_processing(&mut self, event: &DomainEvent) {
        self.status = ProcessingStatus::Processing;
        self.processed_at = Utc::now();
        self.envelope = Some(EventEnvelope::from_event(event));
    }

    pub fn mark_completed(&mut self) {
        self.status = ProcessingStatus::Completed;
        self.processed_at = Utc::now();
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>, permanent: bool) {
        self.status = ProcessingStatus::Failed;
        self.processed_at = Utc::now();
        self.error = Some(error.into());
        self.retry_count = self.retry_count.saturating_add(1);
        if permanent {
            self.set_flag(PERMANENT_FLAG);
        }
    }

    /// Take the record out of the retry candidates for good.
    pub fn mark_exhausted(&mut self) {
        self.set_flag(EXHAUSTED_FLAG);
    }

    pub fn mark_retrying(&mut self) {
        self.status = ProcessingStatus::Retrying;
        self.processed_at = Utc::now();
    }

    fn flag(&self, name: &str) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get(name))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    }

    fn set_flag(&mut self, name: &str) {
        let mut metadata = match self.metadata.take() {
            Some(JsonValue::Object(map)) => JsonValue::Object(map),
            _ => json!({}),
        };
        metadata[name] = JsonValue::Bool(true);
        self.metadata = Some(metadata);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("record already exists for event {0}")]
    Duplicate(EventId),

    #[error("no record for event {0}")]
    NotFound(EventId),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("record (de)serialization failed: {0}")]
    Serialization(String),
}

/// Durable ledger of handled events.
///
/// Implementations must make `save` fail with [`RepositoryError::Duplicate`] when
/// a record for the id already exists, and `update` fail with
/// [`RepositoryError::NotFound`] when none does.
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    async fn save(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError>;

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEventRecord>, RepositoryError>;

    async fn update(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError>;

    /// Retry candidates (see [`ProcessedEventRecord::is_retry_candidate`]),
    /// least recently touched first. Permanent and exhausted records never
    /// come back, so they cannot crowd out newer failures.
    async fn find_failed_for_retry(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessedEventRecord>, RepositoryError>;
}

#[async_trait]
impl<S> ProcessedEventStore for Arc<S>
where
    S: ProcessedEventStore + ?Sized,
{
    async fn save(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError> {
        (**self).save(record).await
    }

    async fn find(&self, event_id: EventId) -> Result<Option<ProcessedEventRecord>, RepositoryError> {
        (**self).find(event_id).await
    }

    async fn update(&self, record: &ProcessedEventRecord) -> Result<(), RepositoryError> {
        (**self).update(record).await
    }

    async fn find_failed_for_retry(
        &self,
        limit: usize,
    ) -> Result<Vec<ProcessedEventRecord>, RepositoryError> {
        (**self).find_failed_for_retry(limit).await
    }
}
