//! Observability: structured logging and pool metrics

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, parse_level, LogFormat};
pub use metrics::{ConnectionMetrics, MetricsCollector, MetricsSnapshot, PublishMetrics};

// Span macros for structured logging
pub use logging::{connection_span, lifecycle_span, publish_span};
