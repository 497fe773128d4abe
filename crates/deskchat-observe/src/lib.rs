//! Observability for deskchat: tracing subscriber setup and optional
//! OpenTelemetry export.

pub mod tracing_setup;
