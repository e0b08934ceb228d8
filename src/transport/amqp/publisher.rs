//! Reliable publisher facade
//!
//! The only surface callers use: serialize a message, publish it with confirmations
//! and retries, close at shutdown.

use super::connection::{ConnectionManager, ConnectionState};
use super::error::AmqpError;
use super::retry::{RetryCoordinator, RetryPolicy};
use crate::context::CallContext;
use crate::transport::Broker;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Publisher tuning supplied by the configuration layer
#[derive(Debug, Clone, PartialEq)]
pub struct PublisherSettings {
    pub exchange: String,
    pub retry: RetryPolicy,
    pub confirm_timeout: Duration,
}

impl Default for PublisherSettings {
    fn default() -> Self {
        Self {
            exchange: "energy-metering.ingest.exchange".to_string(),
            retry: RetryPolicy::default(),
            confirm_timeout: Duration::from_secs(5),
        }
    }
}

/// At-least-once publisher with broker confirmations
pub struct Publisher<B: Broker> {
    connections: Arc<ConnectionManager<B>>,
    retry: RetryCoordinator<B>,
    policy: RetryPolicy,
    closed: AtomicBool,
}

impl<B: Broker> Publisher<B> {
    /// Create a publisher that connects lazily on first publish
    pub fn new(broker: B, settings: PublisherSettings) -> Self {
        let connections = Arc::new(ConnectionManager::new(broker, settings.exchange));
        let retry = RetryCoordinator::new(connections.clone(), settings.confirm_timeout);
        Self {
            connections,
            retry,
            policy: settings.retry,
            closed: AtomicBool::new(false),
        }
    }

    /// Create a publisher and establish the broker link up front
    pub async fn connect(broker: B, settings: PublisherSettings) -> Result<Self, AmqpError> {
        Self::connect_within(broker, settings, &CallContext::new()).await
    }

    /// [`connect`](Self::connect) bounded by `ctx`; a cancelled connect leaves no open handles
    pub async fn connect_within(
        broker: B,
        settings: PublisherSettings,
        ctx: &CallContext,
    ) -> Result<Self, AmqpError> {
        let publisher = Self::new(broker, settings);
        publisher.connections.connect_within(ctx).await?;
        Ok(publisher)
    }

    pub fn exchange(&self) -> &str {
        self.connections.exchange()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connections.state()
    }

    pub fn is_healthy(&self) -> bool {
        !self.is_closed() && self.connections.is_healthy()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Serialize `message` as JSON and publish it to `routing_key`
    pub async fn publish<T>(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        message: &T,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        if self.is_closed() {
            return Err(AmqpError::Closed);
        }
        let body = serde_json::to_vec(message).map_err(AmqpError::Serialization)?;
        self.publish_bytes(ctx, routing_key, &body).await
    }

    /// Publish an already serialized body
    pub async fn publish_bytes(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        if self.is_closed() {
            return Err(AmqpError::Closed);
        }
        self.retry
            .publish_with_retry(ctx, routing_key, body, &self.policy)
            .await
    }

    /// Release the broker connection; the second call reports `AlreadyClosed`
    pub async fn close(&self) -> Result<(), AmqpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(AmqpError::AlreadyClosed);
        }
        info!(exchange = %self.exchange(), "Closing publisher");
        self.connections.close().await
    }
}
