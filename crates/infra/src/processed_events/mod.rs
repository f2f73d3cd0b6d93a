//! Processed-event ledger.
//!
//! Records which event ids a consumer has handled, with their status, failure
//! count and the envelope needed to replay them. This is what makes handling
//! idempotent across redeliveries and restarts.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryProcessedEventStore;
pub use postgres::PostgresProcessedEventStore;
pub use r#trait::{ProcessedEventRecord, ProcessedEventStore, ProcessingStatus, RepositoryError};
