//! Transport layer for broker communication
//!
//! This module provides the broker abstraction used by the reliable publisher
//! and the AMQP 0-9-1 implementation built on top of it.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

pub mod amqp;

/// Boxed error type used at the broker seam
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future resolving to the broker's confirmation for a single publish
pub type PendingConfirm = Pin<Box<dyn Future<Output = Result<Confirmation, BoxError>> + Send>>;

/// Broker acknowledgment for one published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// AMQP delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient = 1,
    Persistent = 2,
}

/// A message ready to be handed to a broker channel
#[derive(Debug, Clone)]
pub struct OutgoingMessage<'a> {
    pub exchange: &'a str,
    pub routing_key: &'a str,
    pub body: &'a [u8],
    pub content_type: &'static str,
    pub delivery_mode: DeliveryMode,
    pub timestamp: DateTime<Utc>,
}

impl<'a> OutgoingMessage<'a> {
    /// Persistent JSON message stamped with the current time
    pub fn persistent_json(exchange: &'a str, routing_key: &'a str, body: &'a [u8]) -> Self {
        Self {
            exchange,
            routing_key,
            body,
            content_type: "application/json",
            delivery_mode: DeliveryMode::Persistent,
            timestamp: Utc::now(),
        }
    }
}

/// Dialer for broker connections
///
/// Implemented over `lapin` in production and by a scripted broker in tests.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Establish a new connection to the broker
    async fn dial(&self) -> Result<Self::Connection, BoxError>;
}

/// A live broker connection
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Whether the underlying connection is still open
    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Self::Channel, BoxError>;

    async fn close(&self) -> Result<(), BoxError>;
}

/// A communication channel multiplexed over a broker connection
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Put the channel into publisher confirm mode
    async fn enable_confirms(&self) -> Result<(), BoxError>;

    /// Declare a durable topic exchange
    async fn declare_exchange(&self, name: &str) -> Result<(), BoxError>;

    /// Submit a message, returning a future for its confirmation
    async fn publish(&self, message: &OutgoingMessage<'_>) -> Result<PendingConfirm, BoxError>;

    async fn close(&self) -> Result<(), BoxError>;
}
