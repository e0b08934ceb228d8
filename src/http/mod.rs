//! HTTP API for meter reading ingestion
//!
//! Routes:
//!
//! - `GET /health` and `GET /{service}/health` - liveness for probes
//! - `GET /metrics` - metrics snapshot
//! - `POST /{service}/api/v1/meter/readings` - ingest a batch of readings

pub mod handlers;
pub mod server;

pub use server::{HttpServer, ServerError};

use crate::service::IngestService;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use warp::Filter;

/// Upper bound on a readings request body
const MAX_BODY_BYTES: u64 = 1024 * 1024;

/// Shared state handed to every handler
pub struct ApiState {
    pub service: IngestService,
    pub service_name: String,
    pub request_timeout: Duration,
}

impl ApiState {
    pub fn new(
        service: IngestService,
        service_name: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            service,
            service_name: service_name.into(),
            request_timeout,
        }
    }
}

fn with_state(
    state: Arc<ApiState>,
) -> impl Filter<Extract = (Arc<ApiState>,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// All API routes with request logging
pub fn routes(
    state: Arc<ApiState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let service_name = state.service_name.clone();

    let health_root = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::health);

    let health_prefixed = warp::path(service_name.clone())
        .and(warp::path("health"))
        .and(warp::path::end())
        .and(warp::get())
        .and(with_state(state.clone()))
        .and_then(handlers::health);

    let metrics = warp::path("metrics")
        .and(warp::path::end())
        .and(warp::get())
        .and_then(handlers::metrics_snapshot);

    let readings = warp::path(service_name)
        .and(warp::path!("api" / "v1" / "meter" / "readings"))
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(warp::header::headers_cloned())
        .and(warp::addr::remote())
        .and(with_state(state))
        .and_then(handlers::ingest_reading);

    health_root
        .or(health_prefixed)
        .or(metrics)
        .or(readings)
        .with(warp::log::custom(|request| {
            info!(
                method = %request.method(),
                path = %request.path(),
                status = request.status().as_u16(),
                latency_ms = request.elapsed().as_millis() as u64,
                "HTTP request"
            );
        }))
}
