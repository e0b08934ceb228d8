//! Meter reading ingestion
//!
//! Validates a request, wraps it in an [`IngestMessage`] envelope and hands it
//! to the reliable publisher.

use crate::context::CallContext;
use crate::error::IngestResult;
use crate::fingerprint;
use crate::observability::publish_span;
use crate::protocol::messages::{ClientMetadata, IngestMessage, IngestRequest};
use crate::transport::amqp::{AmqpError, Publisher};
use crate::transport::Broker;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{error, info, Instrument};
use uuid::Uuid;

/// Sink for ingest envelopes
#[async_trait]
pub trait EnvelopePublisher: Send + Sync {
    async fn publish_envelope(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        message: &IngestMessage,
    ) -> Result<(), AmqpError>;

    fn is_healthy(&self) -> bool;
}

#[async_trait]
impl<B: Broker> EnvelopePublisher for Publisher<B> {
    async fn publish_envelope(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        message: &IngestMessage,
    ) -> Result<(), AmqpError> {
        self.publish(ctx, routing_key, message).await
    }

    fn is_healthy(&self) -> bool {
        Publisher::is_healthy(self)
    }
}

/// Ingest pipeline shared by all HTTP handlers
#[derive(Clone)]
pub struct IngestService {
    publisher: Arc<dyn EnvelopePublisher>,
    routing_key: String,
}

impl IngestService {
    pub fn new(publisher: Arc<dyn EnvelopePublisher>, routing_key: impl Into<String>) -> Self {
        Self {
            publisher,
            routing_key: routing_key.into(),
        }
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn is_publisher_healthy(&self) -> bool {
        self.publisher.is_healthy()
    }

    /// Validate and publish a reading, returning the generated request id
    pub async fn process_reading(
        &self,
        ctx: &CallContext,
        request: IngestRequest,
        metadata: ClientMetadata,
    ) -> IngestResult<String> {
        request.validate()?;

        let request_id = Uuid::new_v4().to_string();
        let client_fingerprint = fingerprint::generate(&metadata.ip_address, &metadata.user_agent);
        let readings_count = request.pm.len();

        let message = IngestMessage {
            request_id: request_id.clone(),
            client_fingerprint: client_fingerprint.clone(),
            ip_address: metadata.ip_address,
            user_agent: metadata.user_agent,
            received_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            payload: request,
        };

        let span = publish_span!(request_id = %request_id, routing_key = %self.routing_key);
        let published = self
            .publisher
            .publish_envelope(ctx, &self.routing_key, &message)
            .instrument(span)
            .await;

        if let Err(e) = published {
            error!(request_id = %request_id, error = %e, "Failed to publish message");
            return Err(e.into());
        }

        info!(
            request_id = %request_id,
            client_fingerprint = %client_fingerprint,
            readings_count,
            has_auth_header = metadata.has_auth_header,
            "Meter reading ingested successfully"
        );
        Ok(request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::protocol::messages::{MeterReading, ValidationError};
    use crate::testing::mocks::{MockBroker, PublishOutcome};
    use crate::transport::amqp::{PublisherSettings, RetryPolicy};
    use std::time::Duration;

    fn request() -> IngestRequest {
        IngestRequest {
            pm: vec![MeterReading {
                date: "2024-05-01T10:00:00Z".to_string(),
                data: "231.4".to_string(),
                name: "feeder-7".to_string(),
            }],
        }
    }

    fn metadata() -> ClientMetadata {
        ClientMetadata {
            ip_address: "203.0.113.9".to_string(),
            user_agent: "gateway/1.2".to_string(),
            has_auth_header: false,
        }
    }

    async fn service(broker: &MockBroker) -> IngestService {
        let settings = PublisherSettings {
            exchange: "ingest".to_string(),
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
            confirm_timeout: Duration::from_secs(1),
        };
        let publisher = Publisher::connect(broker.clone(), settings).await.unwrap();
        IngestService::new(Arc::new(publisher), "meter.reading.ingested")
    }

    #[tokio::test]
    async fn test_publishes_envelope_with_metadata() {
        let broker = MockBroker::new();
        let service = service(&broker).await;

        let request_id = service
            .process_reading(&CallContext::new(), request(), metadata())
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "meter.reading.ingested");

        let envelope: IngestMessage = serde_json::from_slice(&published[0].body).unwrap();
        assert_eq!(envelope.request_id, request_id);
        assert!(Uuid::parse_str(&envelope.request_id).is_ok());
        assert_eq!(
            envelope.client_fingerprint,
            fingerprint::generate("203.0.113.9", "gateway/1.2")
        );
        assert_eq!(envelope.ip_address, "203.0.113.9");
        assert_eq!(envelope.payload, request());
        assert!(envelope.received_at.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&envelope.received_at).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_published() {
        let broker = MockBroker::new();
        let service = service(&broker).await;

        let result = service
            .process_reading(&CallContext::new(), IngestRequest { pm: vec![] }, metadata())
            .await;

        assert!(matches!(
            result,
            Err(IngestError::Validation(ValidationError::EmptyReadings))
        ));
        assert!(broker.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_failure_surfaces_as_publish_error() {
        let broker = MockBroker::new();
        broker.set_default_outcome(PublishOutcome::Nack);
        let service = service(&broker).await;

        let result = service
            .process_reading(&CallContext::new(), request(), metadata())
            .await;

        assert!(matches!(result, Err(IngestError::Publish(AmqpError::Exhausted { .. }))));
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn test_each_request_gets_a_fresh_id() {
        let broker = MockBroker::new();
        let service = service(&broker).await;
        let ctx = CallContext::new();

        let first = service.process_reading(&ctx, request(), metadata()).await.unwrap();
        let second = service.process_reading(&ctx, request(), metadata()).await.unwrap();

        assert_ne!(first, second);
        assert!(service.is_publisher_healthy());
    }
}
