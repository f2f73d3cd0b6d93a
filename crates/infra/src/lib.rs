//! Infrastructure layer: broker plumbing, processed-event ledger, idempotent
//! handling, config and background workers.

pub mod broker;
pub mod config;
pub mod idempotency;
pub mod processed_events;
pub mod workers;

pub use config::RelayConfig;
