//! Publish-and-confirm cycle against the live channel

use super::connection::ConnectionManager;
use super::error::AmqpError;
use crate::context::CallContext;
use crate::observability::metrics::metrics;
use crate::transport::{Broker, BrokerChannel, Confirmation, OutgoingMessage, PendingConfirm};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Performs one publish and waits for the broker's verdict
pub struct ConfirmationTracker<B: Broker> {
    connections: Arc<ConnectionManager<B>>,
    confirm_timeout: Duration,
}

impl<B: Broker> ConfirmationTracker<B> {
    pub fn new(connections: Arc<ConnectionManager<B>>, confirm_timeout: Duration) -> Self {
        Self {
            connections,
            confirm_timeout,
        }
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Publish `body` and race its confirmation against cancellation and the timeout
    ///
    /// Publish+confirm pairs on one channel are serialized through the channel's
    /// confirmation slot, so a confirmation is only ever observed by the call that
    /// sent the message.
    pub async fn publish_and_confirm(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let snapshot = self.connections.snapshot().ok_or(AmqpError::NotConnected)?;
        let generation = snapshot.generation();

        let _in_flight = tokio::select! {
            guard = snapshot.confirms.acquire() => guard,
            reason = ctx.done() => return Err(AmqpError::Cancelled(reason)),
        };

        let message =
            OutgoingMessage::persistent_json(self.connections.exchange(), routing_key, body);

        let submitted = tokio::select! {
            submitted = snapshot.channel.publish(&message) => submitted,
            reason = ctx.done() => return Err(AmqpError::Cancelled(reason)),
        };
        let outcome = match submitted {
            Ok(pending) => self.await_confirmation(ctx, routing_key, generation, pending).await,
            Err(e) => Err(AmqpError::Publish(e)),
        };
        if let Err(e) = &outcome {
            if e.breaks_link() {
                self.connections.mark_broken(generation, e.to_string());
            }
        }
        outcome
    }

    async fn await_confirmation(
        &self,
        ctx: &CallContext,
        routing_key: &str,
        generation: u64,
        pending: PendingConfirm,
    ) -> Result<(), AmqpError> {
        tokio::select! {
            biased;

            confirmation = pending => match confirmation {
                Ok(Confirmation::Ack) => {
                    debug!(routing_key, generation, "Broker acknowledged publish");
                    Ok(())
                }
                Ok(Confirmation::Nack) => {
                    metrics().record_nack();
                    Err(AmqpError::Nack)
                }
                Err(e) => Err(AmqpError::Publish(format!("confirmation lost: {e}").into())),
            },
            reason = ctx.done() => Err(AmqpError::Cancelled(reason)),
            _ = tokio::time::sleep(self.confirm_timeout) => {
                metrics().record_confirm_timeout();
                Err(AmqpError::Timeout(self.confirm_timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelReason;
    use crate::testing::mocks::{MockBroker, PublishOutcome};
    use crate::transport::DeliveryMode;
    use tokio::time::Instant;

    async fn connected_tracker(broker: &MockBroker, timeout: Duration) -> ConfirmationTracker<MockBroker> {
        let manager = Arc::new(ConnectionManager::new(broker.clone(), "ingest"));
        manager.connect().await.unwrap();
        ConfirmationTracker::new(manager, timeout)
    }

    #[tokio::test]
    async fn test_ack_is_success_with_persistent_json_properties() {
        let broker = MockBroker::new();
        let tracker = connected_tracker(&broker, Duration::from_secs(5)).await;

        tracker
            .publish_and_confirm(&CallContext::new(), "meter.reading.ingested", b"{}")
            .await
            .unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].exchange, "ingest");
        assert_eq!(published[0].routing_key, "meter.reading.ingested");
        assert_eq!(published[0].content_type, "application/json");
        assert_eq!(published[0].delivery_mode, DeliveryMode::Persistent);
        assert_eq!(published[0].body, b"{}".to_vec());
    }

    #[tokio::test]
    async fn test_nack_is_nack_error() {
        let broker = MockBroker::new();
        broker.script([PublishOutcome::Nack]);
        let tracker = connected_tracker(&broker, Duration::from_secs(5)).await;

        let result = tracker
            .publish_and_confirm(&CallContext::new(), "key", b"{}")
            .await;

        assert!(matches!(result, Err(AmqpError::Nack)));
        assert!(tracker.connections.is_healthy(), "nack must not break the link");
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_broker_times_out() {
        let broker = MockBroker::new();
        broker.script([PublishOutcome::Silent]);
        let tracker = connected_tracker(&broker, Duration::from_secs(5)).await;

        let started = Instant::now();
        let result = tracker
            .publish_and_confirm(&CallContext::new(), "key", b"{}")
            .await;

        assert!(matches!(result, Err(AmqpError::Timeout(d)) if d == Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert!(tracker.connections.is_healthy(), "timeout keeps the link");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_preempts_confirmation_wait() {
        let broker = MockBroker::new();
        broker.script([PublishOutcome::Silent]);
        let tracker = connected_tracker(&broker, Duration::from_secs(5)).await;
        let ctx = CallContext::new();

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result = tracker.publish_and_confirm(&ctx, "key", b"{}").await;

        assert!(matches!(
            result,
            Err(AmqpError::Cancelled(CancelReason::Cancelled))
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_send_failure_marks_link_broken() {
        let broker = MockBroker::new();
        broker.script([PublishOutcome::SendError]);
        let tracker = connected_tracker(&broker, Duration::from_secs(5)).await;

        let result = tracker
            .publish_and_confirm(&CallContext::new(), "key", b"{}")
            .await;

        assert!(matches!(result, Err(AmqpError::Publish(_))));
        assert!(!tracker.connections.is_healthy());
    }

    #[tokio::test]
    async fn test_lost_confirmation_marks_link_broken() {
        let broker = MockBroker::new();
        broker.script([PublishOutcome::ConfirmLost]);
        let tracker = connected_tracker(&broker, Duration::from_secs(5)).await;

        let result = tracker
            .publish_and_confirm(&CallContext::new(), "key", b"{}")
            .await;

        assert!(matches!(result, Err(AmqpError::Publish(_))));
        assert!(!tracker.connections.is_healthy());
    }

    #[tokio::test]
    async fn test_without_connection_is_not_connected() {
        let manager = Arc::new(ConnectionManager::new(MockBroker::new(), "ingest"));
        let tracker = ConfirmationTracker::new(manager, Duration::from_secs(5));

        let result = tracker
            .publish_and_confirm(&CallContext::new(), "key", b"{}")
            .await;

        assert!(matches!(result, Err(AmqpError::NotConnected)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_publishes_are_single_flight() {
        let broker = MockBroker::new();
        broker.script([
            PublishOutcome::AckAfter(Duration::from_millis(30)),
            PublishOutcome::AckAfter(Duration::from_millis(30)),
            PublishOutcome::AckAfter(Duration::from_millis(30)),
        ]);
        let tracker = Arc::new(connected_tracker(&broker, Duration::from_secs(5)).await);

        let mut handles = Vec::new();
        for i in 0..3 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                let body = format!("{{\"n\":{i}}}");
                tracker
                    .publish_and_confirm(&CallContext::new(), "key", body.as_bytes())
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(broker.published().len(), 3);
        assert_eq!(broker.max_in_flight(), 1);
    }
}
