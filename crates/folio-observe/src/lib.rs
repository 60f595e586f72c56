//! Observability setup for Folio: structured logging and optional
//! OpenTelemetry trace export.

pub mod tracing_setup;
