//! Error taxonomy for the AMQP publisher

use crate::context::CancelReason;
use crate::transport::BoxError;
use std::time::Duration;
use thiserror::Error;

/// AMQP transport errors
#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("Connection failed: {0}")]
    Connection(#[source] BoxError),
    #[error("Failed to enable confirm mode: {0}")]
    ConfirmMode(#[source] BoxError),
    #[error("Not connected: no open channel")]
    NotConnected,
    #[error("Publish failed: {0}")]
    Publish(#[source] BoxError),
    #[error("Publish not acknowledged by broker")]
    Nack,
    #[error("Confirmation timeout after {0:?}")]
    Timeout(Duration),
    #[error("Publish cancelled: {0}")]
    Cancelled(CancelReason),
    #[error("Failed to serialize message: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("Failed to publish after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<AmqpError>,
    },
    #[error("Publisher is closed")]
    Closed,
    #[error("Publisher already closed")]
    AlreadyClosed,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
}

impl AmqpError {
    /// Whether the retry loop may try again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AmqpError::Connection(_)
                | AmqpError::ConfirmMode(_)
                | AmqpError::NotConnected
                | AmqpError::Publish(_)
                | AmqpError::Nack
                | AmqpError::Timeout(_)
        )
    }

    /// Errors that mean the current link can no longer be trusted
    pub fn breaks_link(&self) -> bool {
        matches!(
            self,
            AmqpError::Connection(_)
                | AmqpError::ConfirmMode(_)
                | AmqpError::NotConnected
                | AmqpError::Publish(_)
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AmqpError::Cancelled(_))
    }

    /// Attempt count for exhausted retries
    pub fn attempts(&self) -> Option<u32> {
        match self {
            AmqpError::Exhausted { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// Innermost failure for exhausted retries
    pub fn last_cause(&self) -> Option<&AmqpError> {
        match self {
            AmqpError::Exhausted { last, .. } => Some(last),
            _ => None,
        }
    }
}
