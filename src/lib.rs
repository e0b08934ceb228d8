//! Energy metering ingest API
//!
//! Accepts batches of meter readings over HTTP and forwards each batch,
//! at-least-once, to a durable RabbitMQ topic exchange.
//!
//! # Overview
//!
//! - [`transport::amqp`] - reliable publisher with confirms, reconnects and backoff
//! - [`service`] - validation and envelope construction
//! - [`http`] - warp routes for ingest, health and metrics
//! - [`config`] - TOML plus environment configuration
//! - [`observability`] - structured logging and metrics
//!
//! # Quick Start
//!
//! ```rust
//! use meter_ingest::protocol::{IngestRequest, MeterReading};
//!
//! let request: IngestRequest = serde_json::from_str(
//!     r#"{"PM": [{"date": "2024-05-01T10:00:00Z", "data": "231.4", "name": "feeder-7"}]}"#,
//! )
//! .unwrap();
//! assert!(request.validate().is_ok());
//!
//! let fingerprint = meter_ingest::fingerprint::generate("203.0.113.9", "gateway/1.2");
//! assert_eq!(fingerprint.len(), 64);
//! # let _ = MeterReading { date: String::new(), data: String::new(), name: String::new() };
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod fingerprint;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod service;
pub mod testing;
pub mod transport;

pub use config::{ConfigError, IngestConfig};
pub use context::{CallContext, CancelReason};
pub use error::{IngestError, IngestResult};
pub use service::{EnvelopePublisher, IngestService};
pub use transport::amqp::{AmqpError, Publisher, PublisherSettings};
