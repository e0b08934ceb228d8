//! Request handlers for the ingest API

use super::ApiState;
use crate::context::CallContext;
use crate::error::IngestError;
use crate::observability::metrics::metrics;
use crate::observability::request_span;
use crate::protocol::messages::{ClientMetadata, IngestRequest};
use bytes::Bytes;
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn, Instrument};
use warp::http::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use warp::http::StatusCode;
use warp::reply::{self, Json, WithStatus};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// GET /health and GET /{service}/health
pub async fn health(state: Arc<ApiState>) -> Result<Json, Infallible> {
    Ok(reply::json(&json!({
        "status": "healthy",
        "service": state.service_name,
    })))
}

/// GET /metrics
pub async fn metrics_snapshot() -> Result<Json, Infallible> {
    Ok(reply::json(&metrics().get_metrics()))
}

/// POST /{service}/api/v1/meter/readings
pub async fn ingest_reading(
    body: Bytes,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    state: Arc<ApiState>,
) -> Result<WithStatus<Json>, Infallible> {
    let started = Instant::now();
    metrics().request_received();

    let metadata = client_metadata(&headers, remote);
    let span = request_span!(client_ip = %metadata.ip_address);

    let request: IngestRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let error = IngestError::invalid_payload(e.to_string());
            span.in_scope(|| {
                warn!(client_ip = %metadata.ip_address, error = %e, "Invalid request payload")
            });
            metrics().request_rejected();
            return Ok(error_reply(&error));
        }
    };

    let ctx = CallContext::new().with_timeout(state.request_timeout);
    let client_ip = metadata.ip_address.clone();
    let outcome = state
        .service
        .process_reading(&ctx, request, metadata)
        .instrument(span)
        .await;

    match outcome {
        Ok(request_id) => {
            metrics().request_accepted(started.elapsed());
            Ok(reply::with_status(
                reply::json(&json!({
                    "status": "accepted",
                    "message": "Meter reading ingested successfully",
                    "request_id": request_id,
                })),
                StatusCode::ACCEPTED,
            ))
        }
        Err(e) if e.is_client_error() => {
            warn!(client_ip = %client_ip, error = %e, "Rejected meter reading");
            metrics().request_rejected();
            Ok(error_reply(&e))
        }
        Err(e) => {
            error!(client_ip = %client_ip, error = %e, "Failed to process reading");
            metrics().request_failed(started.elapsed());
            Ok(error_reply(&e))
        }
    }
}

fn error_reply(error: &IngestError) -> WithStatus<Json> {
    reply::with_status(reply::json(&error.to_response_body()), error.status_code())
}

/// Metadata about the caller, as seen through any proxies
pub fn client_metadata(headers: &HeaderMap, remote: Option<SocketAddr>) -> ClientMetadata {
    ClientMetadata {
        ip_address: client_ip(headers, remote),
        user_agent: header_str(headers, USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
        has_auth_header: headers
            .get(AUTHORIZATION)
            .is_some_and(|value| !value.is_empty()),
    }
}

/// First `X-Forwarded-For` entry, then `X-Real-IP`, then the socket peer
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    let forwarded = header_str(headers, X_FORWARDED_FOR)
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    let real_ip = header_str(headers, X_REAL_IP)
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    remote.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
