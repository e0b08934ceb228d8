//! Retry coordination with bounded exponential backoff

use super::confirm::ConfirmationTracker;
use super::connection::ConnectionManager;
use super::error::AmqpError;
use crate::context::CallContext;
use crate::observability::metrics::metrics;
use crate::transport::Broker;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Attempt budget and backoff shape for one publish
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Upper bound for any single backoff delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(5000),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based): `base * 2^(attempt-1)`, capped
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Drives publish attempts, repairing the connection between them
pub struct RetryCoordinator<B: Broker> {
    connections: Arc<ConnectionManager<B>>,
    tracker: ConfirmationTracker<B>,
}

impl<B: Broker> RetryCoordinator<B> {
    pub fn new(connections: Arc<ConnectionManager<B>>, confirm_timeout: Duration) -> Self {
        let tracker = ConfirmationTracker::new(connections.clone(), confirm_timeout);
        Self {
            connections,
            tracker,
        }
    }

    /// Publish with up to `policy.max_attempts` attempts
    ///
    /// Cancellation and non-retryable errors end the loop immediately; every other
    /// failure is retried after the backoff delay until the budget is spent.
    pub async fn publish_with_retry(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        body: &[u8],
        policy: &RetryPolicy,
    ) -> Result<(), AmqpError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if let Some(reason) = ctx.check() {
                metrics().record_cancellation();
                return Err(AmqpError::Cancelled(reason));
            }
            metrics().record_publish_attempt();

            match self.attempt(ctx, routing_key, body).await {
                Ok(()) => {
                    metrics().record_message_published();
                    debug!(routing_key, attempt, "Message published successfully");
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => {
                    metrics().record_cancellation();
                    warn!(routing_key, attempt, error = %e, "Publish cancelled by caller");
                    return Err(e);
                }
                Err(e) if !e.is_retryable() => {
                    warn!(routing_key, attempt, error = %e, "Publish failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        routing_key,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Publish attempt failed"
                    );
                    last_error = Some(e);
                }
            }

            if attempt < max_attempts {
                let delay = policy.backoff_delay(attempt);
                tokio::select! {
                    reason = ctx.done() => {
                        metrics().record_cancellation();
                        return Err(AmqpError::Cancelled(reason));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        metrics().record_publish_exhausted();
        let last = last_error.unwrap_or(AmqpError::NotConnected);
        error!(routing_key, attempts = max_attempts, error = %last, "Publish retries exhausted");
        Err(AmqpError::Exhausted {
            attempts: max_attempts,
            last: Box::new(last),
        })
    }

    async fn attempt(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        if !self.connections.is_healthy() {
            warn!(state = ?self.connections.state(), "Connection unhealthy, attempting reconnect");
            self.connections.reconnect(ctx).await?;
        }
        self.tracker.publish_and_confirm(ctx, routing_key, body).await
    }
}
