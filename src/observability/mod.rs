//! Observability for the ingest service
//!
//! Structured logging and process-wide metrics counters. The counters are
//! exposed over HTTP by [`crate::http`].

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{metrics, MetricsCollector, MetricsSnapshot};

pub use logging::{publish_span, request_span};
