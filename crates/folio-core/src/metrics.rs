//! Fire-and-forget metrics sink.
//!
//! The engine reports node start/finish and unit outcomes through a
//! [`MetricsSink`]. Recording never fails and never blocks the workflow;
//! with [`NoopMetrics`] the engine behaves identically.

use serde_json::Value;

/// Destination for workflow metric events.
pub trait MetricsSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Record a named event with structured fields.
    fn record(&self, event: &str, fields: Value);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn name(&self) -> &str {
        "noop"
    }

    fn record(&self, _event: &str, _fields: Value) {}
}

/// Emits every event as a `tracing` record on the `folio::metrics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn name(&self) -> &str {
        "tracing"
    }

    fn record(&self, event: &str, fields: Value) {
        tracing::info!(target: "folio::metrics", metric = event, fields = %fields, "metric");
    }
}
