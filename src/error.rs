//! Error types for the ingest service
//!
//! Maps service failures to HTTP status codes and response bodies.

use crate::protocol::messages::ValidationError;
use crate::transport::amqp::AmqpError;
use serde_json::{json, Value};
use thiserror::Error;
use warp::http::StatusCode;

const MAX_DETAILS_LEN: usize = 500;

/// Failures while ingesting a meter reading
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Invalid request payload: {details}")]
    InvalidPayload { details: String },

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to publish message: {0}")]
    Publish(#[from] AmqpError),
}

impl IngestError {
    /// Create invalid payload error
    pub fn invalid_payload<S: Into<String>>(details: S) -> Self {
        Self::InvalidPayload {
            details: details.into(),
        }
    }

    /// Caller mistakes are 400, broker trouble is 503
    pub fn status_code(&self) -> StatusCode {
        match self {
            IngestError::InvalidPayload { .. } | IngestError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            IngestError::Publish(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// JSON body returned to the client
    ///
    /// Publish failures never expose broker details.
    pub fn to_response_body(&self) -> Value {
        match self {
            IngestError::InvalidPayload { details } => json!({
                "error": "Invalid request payload",
                "details": truncate_details(details),
            }),
            IngestError::Validation(e) => json!({
                "error": "Invalid request payload",
                "details": e.to_string(),
            }),
            IngestError::Publish(_) => json!({
                "error": "Failed to process reading",
                "message": "Service temporarily unavailable",
            }),
        }
    }
}

/// Bound the size of parser messages echoed back to clients
fn truncate_details(details: &str) -> String {
    if details.len() <= MAX_DETAILS_LEN {
        return details.to_string();
    }
    let suffix = "...[truncated]";
    let mut end = MAX_DETAILS_LEN - suffix.len();
    while !details.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{suffix}", &details[..end])
}

/// Result type for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;
