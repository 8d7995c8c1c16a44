//! Observability setup for reportflow: tracing subscriber installation and
//! optional OpenTelemetry span export.

pub mod tracing_setup;
