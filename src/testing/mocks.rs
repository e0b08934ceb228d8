//! Mock broker for testing
//!
//! [`MockBroker`] implements the broker seam entirely in memory. Publish outcomes
//! are scripted per call, and dial, channel and confirm-mode failures can be
//! injected so reconnect and retry paths run without a real RabbitMQ.

use crate::transport::{
    BoxError, Broker, BrokerChannel, BrokerConnection, Confirmation, DeliveryMode,
    OutgoingMessage, PendingConfirm,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// What the mock broker does with the next published message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Confirm immediately with an ack
    Ack,
    /// Confirm immediately with a nack
    Nack,
    /// Never confirm
    Silent,
    /// Fail the send itself, as a dropped socket would
    SendError,
    /// Accept the message, then lose the confirmation stream
    ConfirmLost,
    /// Ack after the given delay
    AckAfter(Duration),
}

/// A message the mock broker accepted
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
struct Handle {
    broken: AtomicBool,
    closed: AtomicBool,
}

impl Handle {
    fn is_open(&self) -> bool {
        !self.broken.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    dial_count: usize,
    confirm_selects: usize,
    declared_exchanges: Vec<String>,
    failing_dials: usize,
    failing_channel_opens: usize,
    failing_confirm_selects: usize,
    channel_open_delay: Option<Duration>,
    connections: Vec<Arc<Handle>>,
    channels: Vec<Arc<Handle>>,
    script: VecDeque<PublishOutcome>,
    default_outcome: Option<PublishOutcome>,
    published: Vec<PublishedMessage>,
    publish_times: Vec<Instant>,
    in_flight: usize,
    max_in_flight: usize,
}

/// In-memory broker whose clones share one state
#[derive(Debug, Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue outcomes for the next publishes; unscripted publishes use the default
    pub fn script(&self, outcomes: impl IntoIterator<Item = PublishOutcome>) {
        self.lock().script.extend(outcomes);
    }

    /// Outcome for publishes once the script runs out (ack unless set)
    pub fn set_default_outcome(&self, outcome: PublishOutcome) {
        self.lock().default_outcome = Some(outcome);
    }

    pub fn fail_next_dials(&self, count: usize) {
        self.lock().failing_dials = count;
    }

    pub fn fail_next_channel_opens(&self, count: usize) {
        self.lock().failing_channel_opens = count;
    }

    pub fn fail_next_confirm_selects(&self, count: usize) {
        self.lock().failing_confirm_selects = count;
    }

    /// Make every channel open take `delay`, as a slow broker handshake would
    pub fn delay_channel_opens(&self, delay: Duration) {
        self.lock().channel_open_delay = Some(delay);
    }

    /// Drop every live connection and channel, as a broker restart would
    pub fn break_connections(&self) {
        let state = self.lock();
        for handle in state.connections.iter().chain(state.channels.iter()) {
            handle.broken.store(true, Ordering::SeqCst);
        }
    }

    pub fn dial_count(&self) -> usize {
        self.lock().dial_count
    }

    pub fn confirm_selects(&self) -> usize {
        self.lock().confirm_selects
    }

    pub fn declared_exchanges(&self) -> Vec<String> {
        self.lock().declared_exchanges.clone()
    }

    /// Connections handed out and not yet closed by the client
    pub fn open_connections(&self) -> usize {
        count_unclosed(&self.lock().connections)
    }

    /// Channels handed out and not yet closed by the client
    pub fn open_channels(&self) -> usize {
        count_unclosed(&self.lock().channels)
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Instants at which the broker accepted each published message
    pub fn publish_times(&self) -> Vec<Instant> {
        self.lock().publish_times.clone()
    }

    /// Highest number of messages ever awaiting confirmation at once
    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }
}

fn count_unclosed(handles: &[Arc<Handle>]) -> usize {
    handles
        .iter()
        .filter(|handle| !handle.closed.load(Ordering::SeqCst))
        .count()
}

/// Decrements the in-flight gauge when the confirmation future is dropped
struct InFlight {
    state: Arc<Mutex<BrokerState>>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

#[async_trait]
impl Broker for MockBroker {
    type Connection = MockConnection;

    async fn dial(&self) -> Result<Self::Connection, BoxError> {
        let mut state = self.lock();
        state.dial_count += 1;
        if state.failing_dials > 0 {
            state.failing_dials -= 1;
            return Err("connection refused".into());
        }
        let handle = Arc::new(Handle::default());
        state.connections.push(handle.clone());
        Ok(MockConnection {
            broker: self.clone(),
            handle,
        })
    }
}

pub struct MockConnection {
    broker: MockBroker,
    handle: Arc<Handle>,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    type Channel = MockChannel;

    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn open_channel(&self) -> Result<Self::Channel, BoxError> {
        if !self.is_open() {
            return Err("connection is closed".into());
        }
        let delay = self.broker.lock().channel_open_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.broker.lock();
        if state.failing_channel_opens > 0 {
            state.failing_channel_opens -= 1;
            return Err("channel open refused".into());
        }
        let handle = Arc::new(Handle::default());
        state.channels.push(handle.clone());
        Ok(MockChannel {
            broker: self.broker.clone(),
            handle,
        })
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockChannel {
    broker: MockBroker,
    handle: Arc<Handle>,
}

#[async_trait]
impl BrokerChannel for MockChannel {
    fn is_open(&self) -> bool {
        self.handle.is_open()
    }

    async fn enable_confirms(&self) -> Result<(), BoxError> {
        let mut state = self.broker.lock();
        state.confirm_selects += 1;
        if state.failing_confirm_selects > 0 {
            state.failing_confirm_selects -= 1;
            return Err("confirm.select rejected".into());
        }
        Ok(())
    }

    async fn declare_exchange(&self, name: &str) -> Result<(), BoxError> {
        self.broker.lock().declared_exchanges.push(name.to_string());
        Ok(())
    }

    async fn publish(&self, message: &OutgoingMessage<'_>) -> Result<PendingConfirm, BoxError> {
        if !self.is_open() {
            return Err("channel is closed".into());
        }

        let outcome = {
            let mut state = self.broker.lock();
            let outcome = match state.script.pop_front() {
                Some(outcome) => outcome,
                None => state.default_outcome.unwrap_or(PublishOutcome::Ack),
            };
            if outcome == PublishOutcome::SendError {
                return Err("broken pipe".into());
            }

            state.published.push(PublishedMessage {
                exchange: message.exchange.to_string(),
                routing_key: message.routing_key.to_string(),
                content_type: message.content_type.to_string(),
                delivery_mode: message.delivery_mode,
                body: message.body.to_vec(),
            });
            state.publish_times.push(Instant::now());
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            outcome
        };

        let in_flight = InFlight {
            state: self.broker.state.clone(),
        };
        Ok(Box::pin(resolve(outcome, in_flight)))
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.handle.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn resolve(outcome: PublishOutcome, _in_flight: InFlight) -> Result<Confirmation, BoxError> {
    match outcome {
        PublishOutcome::Ack | PublishOutcome::SendError => Ok(Confirmation::Ack),
        PublishOutcome::Nack => Ok(Confirmation::Nack),
        PublishOutcome::Silent => std::future::pending().await,
        PublishOutcome::ConfirmLost => Err("confirmation stream closed".into()),
        PublishOutcome::AckAfter(delay) => {
            tokio::time::sleep(delay).await;
            Ok(Confirmation::Ack)
        }
    }
}
