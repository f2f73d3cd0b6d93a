//! Exactly-once-in-effect event handling over at-least-once delivery.

pub mod keyed_lock;
pub mod retry;
pub mod service;

pub use keyed_lock::{KeyedLock, KeyedLockGuard};
pub use retry::RetryConfig;
pub use service::{
    EventHandler, FnHandler, HandleError, IdempotentEventHandlerService, RetryReport, handler_fn,
};
