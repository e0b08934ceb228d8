//! AMQP 0-9-1 broker implementation over `lapin`

use super::error::AmqpError;
use crate::transport::{
    BoxError, Broker, BrokerChannel, BrokerConnection, Confirmation, OutgoingMessage,
    PendingConfirm,
};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::PublisherConfirm;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::debug;
use url::Url;

const REPLY_SUCCESS: u16 = 200;

/// Dialer for a RabbitMQ-compatible broker
#[derive(Debug, Clone)]
pub struct LapinBroker {
    url: String,
    connection_name: String,
}

impl LapinBroker {
    /// Validate the broker URL; `amqps://` URLs are dialed over TLS
    pub fn new(url: &str, connection_name: &str) -> Result<Self, AmqpError> {
        validate_broker_url(url)?;
        Ok(Self {
            url: url.to_string(),
            connection_name: connection_name.to_string(),
        })
    }
}

/// Reject URLs that are not `amqp://` or `amqps://` with a host
pub fn validate_broker_url(url: &str) -> Result<(), AmqpError> {
    let parsed = Url::parse(url).map_err(|_| AmqpError::InvalidBrokerUrl(redact_url(url)))?;
    match parsed.scheme() {
        "amqp" | "amqps" if parsed.host_str().is_some_and(|h| !h.is_empty()) => Ok(()),
        _ => Err(AmqpError::InvalidBrokerUrl(redact_url(url))),
    }
}

/// Mask the password component of a broker URL for logging
pub fn redact_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        Ok(parsed) => parsed.to_string(),
        Err(_) => "<unparseable>".to_string(),
    }
}

#[async_trait]
impl Broker for LapinBroker {
    type Connection = LapinConnection;

    async fn dial(&self) -> Result<Self::Connection, BoxError> {
        let properties =
            ConnectionProperties::default().with_connection_name(self.connection_name.clone().into());
        let connection = Connection::connect(&self.url, properties).await?;
        debug!(url = %redact_url(&self.url), "Dialed broker");
        Ok(LapinConnection { inner: connection })
    }
}

pub struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    type Channel = LapinChannel;

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> Result<Self::Channel, BoxError> {
        let channel = self.inner.create_channel().await?;
        Ok(LapinChannel { inner: channel })
    }

    async fn close(&self) -> Result<(), BoxError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn enable_confirms(&self) -> Result<(), BoxError> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BoxError> {
        let options = ExchangeDeclareOptions {
            durable: true,
            ..Default::default()
        };
        self.inner
            .exchange_declare(name, ExchangeKind::Topic, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage<'_>) -> Result<PendingConfirm, BoxError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(message.delivery_mode as u8)
            .with_content_type(message.content_type.into())
            .with_timestamp(message.timestamp.timestamp().max(0) as u64);

        let confirm = self
            .inner
            .basic_publish(
                message.exchange,
                message.routing_key,
                BasicPublishOptions::default(),
                message.body,
                properties,
            )
            .await?;

        Ok(Box::pin(await_confirmation(confirm)))
    }

    async fn close(&self) -> Result<(), BoxError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(REPLY_SUCCESS, "OK").await?;
        Ok(())
    }
}

async fn await_confirmation(confirm: PublisherConfirm) -> Result<Confirmation, BoxError> {
    let confirmation = confirm.await?;
    if confirmation.is_ack() {
        Ok(Confirmation::Ack)
    } else if confirmation.is_nack() {
        Ok(Confirmation::Nack)
    } else {
        Err("confirm mode not active on channel".into())
    }
}
