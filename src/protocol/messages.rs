//! Wire types for meter reading ingestion
//!
//! [`IngestRequest`] is what clients POST; [`IngestMessage`] is the envelope
//! published to the broker for downstream consumers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single meter reading as sent by the device gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MeterReading {
    pub date: String,
    pub data: String,
    pub name: String,
}

/// Incoming request payload
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestRequest {
    #[serde(rename = "PM")]
    pub pm: Vec<MeterReading>,
}

/// Field presence failures, reported with the offending reading's index
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("PM array cannot be empty")]
    EmptyReadings,
    #[error("PM[{index}].{field} cannot be empty")]
    EmptyField { index: usize, field: &'static str },
}

impl IngestRequest {
    /// Check that there is at least one reading and no reading has an empty field
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pm.is_empty() {
            return Err(ValidationError::EmptyReadings);
        }

        for (index, reading) in self.pm.iter().enumerate() {
            let fields = [
                ("date", &reading.date),
                ("data", &reading.data),
                ("name", &reading.name),
            ];
            for (field, value) in fields {
                if value.is_empty() {
                    return Err(ValidationError::EmptyField { index, field });
                }
            }
        }
        Ok(())
    }
}

/// Client information captured from the HTTP request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMetadata {
    pub ip_address: String,
    pub user_agent: String,
    pub has_auth_header: bool,
}

/// Envelope published to the ingest exchange
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestMessage {
    pub request_id: String,
    pub client_fingerprint: String,
    pub ip_address: String,
    pub user_agent: String,
    /// RFC 3339, UTC, second precision
    pub received_at: String,
    pub payload: IngestRequest,
}
