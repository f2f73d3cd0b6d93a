//! `eventrelay-core`: identity and aggregate building blocks shared by the relay crates.
//!
//! This crate stays free of IO and async concerns.

pub mod aggregate;
pub mod error;
pub mod id;

pub use aggregate::{AggregateRoot, EventBuffer};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, EventId};
