//! Metrics sink abstraction.
//!
//! Components take an `Arc<dyn MetricsSink>` and never talk to an exporter
//! directly. Tags are passed as borrowed `(key, value)` pairs so call sites stay
//! allocation-free when the sink discards them.
//!
//! - [`TracingMetrics`] emits every sample as a `tracing` event on target `metrics`.
//! - [`InMemoryMetrics`] keeps samples for assertions in tests.
//! - [`NoopMetrics`] drops everything.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub type Tags<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, value: u64, tags: Tags<'_>);

    fn record_histogram(&self, name: &str, value: f64, tags: Tags<'_>);

    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>);
}

impl<S> MetricsSink for Arc<S>
where
    S: MetricsSink + ?Sized,
{
    fn increment_counter(&self, name: &str, value: u64, tags: Tags<'_>) {
        (**self).increment_counter(name, value, tags)
    }

    fn record_histogram(&self, name: &str, value: f64, tags: Tags<'_>) {
        (**self).record_histogram(name, value, tags)
    }

    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        (**self).record_gauge(name, value, tags)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _value: u64, _tags: Tags<'_>) {}

    fn record_histogram(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}

    fn record_gauge(&self, _name: &str, _value: f64, _tags: Tags<'_>) {}
}

/// Writes samples to the log pipeline; pair with a `metrics=debug` filter.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_counter(&self, name: &str, value: u64, tags: Tags<'_>) {
        tracing::debug!(target: "metrics", kind = "counter", metric = name, value, tags = %format_tags(tags));
    }

    fn record_histogram(&self, name: &str, value: f64, tags: Tags<'_>) {
        tracing::debug!(target: "metrics", kind = "histogram", metric = name, value, tags = %format_tags(tags));
    }

    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        tracing::debug!(target: "metrics", kind = "gauge", metric = name, value, tags = %format_tags(tags));
    }
}

fn format_tags(tags: Tags<'_>) -> String {
    let mut pairs: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(",")
}

#[derive(Debug, Clone, PartialEq)]
struct Sample {
    name: String,
    tags: Vec<(String, String)>,
    value: f64,
}

impl Sample {
    fn new(name: &str, value: f64, tags: Tags<'_>) -> Self {
        Self {
            name: name.to_string(),
            tags: tags
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            value,
        }
    }

    fn has_tags(&self, wanted: Tags<'_>) -> bool {
        wanted
            .iter()
            .all(|(k, v)| self.tags.iter().any(|(tk, tv)| tk == k && tv == v))
    }
}

#[derive(Debug, Default)]
struct Recorded {
    counters: Vec<Sample>,
    histograms: Vec<Sample>,
    gauges: Vec<Sample>,
}

/// Records every sample in memory.
///
/// Query helpers filter by name and a subset of tags; a sample matches when it
/// carries every requested tag (extra tags are ignored).
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    recorded: Mutex<Recorded>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sum of all increments for `name`.
    pub fn counter(&self, name: &str) -> u64 {
        self.counter_with(name, &[])
    }

    pub fn counter_with(&self, name: &str, tags: Tags<'_>) -> u64 {
        let recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded
            .counters
            .iter()
            .filter(|s| s.name == name && s.has_tags(tags))
            .map(|s| s.value as u64)
            .sum()
    }

    /// Number of observations recorded for a histogram.
    pub fn histogram_count(&self, name: &str) -> usize {
        let recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded.histograms.iter().filter(|s| s.name == name).count()
    }

    /// Latest value of a gauge, if it was ever set.
    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauge_history(name).last().copied()
    }

    /// Every value a gauge took, oldest first.
    pub fn gauge_history(&self, name: &str) -> Vec<f64> {
        let recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded
            .gauges
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.value)
            .collect()
    }

    pub fn reset(&self) {
        *self.recorded.lock().unwrap_or_else(PoisonError::into_inner) = Recorded::default();
    }

    /// Counter totals keyed by name, for debugging test failures.
    pub fn counter_totals(&self) -> HashMap<String, u64> {
        let recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        let mut totals = HashMap::new();
        for sample in &recorded.counters {
            *totals.entry(sample.name.clone()).or_insert(0) += sample.value as u64;
        }
        totals
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, value: u64, tags: Tags<'_>) {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded.counters.push(Sample::new(name, value as f64, tags));
    }

    fn record_histogram(&self, name: &str, value: f64, tags: Tags<'_>) {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded.histograms.push(Sample::new(name, value, tags));
    }

    fn record_gauge(&self, name: &str, value: f64, tags: Tags<'_>) {
        let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
        recorded.gauges.push(Sample::new(name, value, tags));
    }
}
