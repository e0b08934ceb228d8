//! Supervised HTTP server task

use super::{routes, ApiState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind HTTP listener: {0}")]
    Bind(#[from] warp::Error),
    #[error("HTTP server did not drain within {0:?}")]
    ShutdownTimeout(Duration),
    #[error("HTTP server task failed: {0}")]
    Task(#[from] JoinError),
}

/// Running HTTP server owned by the process lifecycle
pub struct HttpServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
    exited: bool,
}

impl HttpServer {
    /// Bind `addr` and serve the API on a spawned task
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(state: Arc<ApiState>, addr: SocketAddr) -> Result<Self, ServerError> {
        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();

        let (local_addr, server) = warp::serve(routes(state))
            .try_bind_with_graceful_shutdown(addr, async move { signal.cancelled().await })?;

        let handle = tokio::spawn(server);
        info!(%local_addr, "HTTP server listening");

        Ok(Self {
            local_addr,
            shutdown,
            handle,
            exited: false,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when the serving task exits without being asked to
    ///
    /// Cancel safe; once this resolves, [`shutdown`](Self::shutdown) returns immediately.
    pub async fn stopped(&mut self) -> Result<(), ServerError> {
        if self.exited {
            return Ok(());
        }
        let result = (&mut self.handle).await;
        self.exited = true;
        result.map_err(ServerError::Task)
    }

    /// Stop accepting connections and wait up to `timeout` for in-flight requests
    pub async fn shutdown(mut self, timeout: Duration) -> Result<(), ServerError> {
        self.shutdown.cancel();
        if self.exited {
            return Ok(());
        }

        match tokio::time::timeout(timeout, &mut self.handle).await {
            Ok(Ok(())) => {
                info!("HTTP server stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(ServerError::Task(e)),
            Err(_) => {
                warn!(?timeout, "HTTP server did not drain in time, aborting");
                self.handle.abort();
                Err(ServerError::ShutdownTimeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::IngestService;
    use crate::testing::mocks::MockBroker;
    use crate::transport::amqp::{Publisher, PublisherSettings};

    fn state() -> Arc<ApiState> {
        let publisher = Publisher::new(MockBroker::new(), PublisherSettings::default());
        let service = IngestService::new(Arc::new(publisher), "meter.reading.ingested");
        Arc::new(ApiState::new(service, "ingest", Duration::from_secs(5)))
    }

    #[tokio::test]
    async fn test_running_server_is_not_stopped_until_shutdown() {
        let mut server = HttpServer::start(state(), "127.0.0.1:0".parse().unwrap()).unwrap();
        assert_ne!(server.local_addr().port(), 0);

        let still_running = tokio::time::timeout(Duration::from_millis(50), server.stopped()).await;
        assert!(still_running.is_err());

        server.shutdown(Duration::from_secs(5)).await.unwrap();
    }
}
