//! Tracing and metrics setup shared by every relay component.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Metrics sink and its implementations.
pub mod metrics;

pub use metrics::{InMemoryMetrics, MetricsSink, NoopMetrics, TracingMetrics};
