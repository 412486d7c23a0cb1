/// Observability module for metrics and structured logging
pub mod metrics;
pub mod tracing_setup;
