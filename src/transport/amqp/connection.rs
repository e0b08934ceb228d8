//! Connection management for the AMQP publisher
//!
//! The [`ConnectionManager`] exclusively owns the single broker connection and its
//! channel. The pair is swapped as a whole under one lock, which is never held
//! across network I/O. Callers only ever see a [`ChannelSnapshot`].

use super::error::AmqpError;
use crate::context::CallContext;
use crate::observability::metrics::metrics;
use crate::transport::{Broker, BrokerChannel, BrokerConnection};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::MutexGuard as AsyncMutexGuard;
use tracing::{debug, info, warn};

/// Channel type produced by a broker's connections
pub type ChannelOf<B> = <<B as Broker>::Connection as BrokerConnection>::Channel;

/// Connection state as seen by the publisher
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// No link established yet, or torn down for a reconnect
    Disconnected,
    /// Link open with confirm mode enabled
    Connected,
    /// A publish or channel failure was observed on the live link
    Broken(String),
    /// Closed at shutdown, no further connects
    Closed,
}

/// Single-slot confirmation conduit for one channel lifetime
///
/// Holding the slot grants the right to have exactly one publish awaiting its
/// confirmation on the channel.
#[derive(Debug)]
pub struct ConfirmSlot {
    generation: u64,
    in_flight: tokio::sync::Mutex<()>,
}

impl ConfirmSlot {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    /// Generation of the channel this slot belongs to
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait for the slot to become free
    pub async fn acquire(&self) -> AsyncMutexGuard<'_, ()> {
        self.in_flight.lock().await
    }
}

/// Handles needed for one publish attempt, copied out under the lock
pub struct ChannelSnapshot<B: Broker> {
    pub channel: Arc<ChannelOf<B>>,
    pub confirms: Arc<ConfirmSlot>,
}

impl<B: Broker> ChannelSnapshot<B> {
    pub fn generation(&self) -> u64 {
        self.confirms.generation()
    }
}

struct Link<B: Broker> {
    connection: Arc<B::Connection>,
    channel: Arc<ChannelOf<B>>,
    confirms: Arc<ConfirmSlot>,
}

impl<B: Broker> Link<B> {
    fn generation(&self) -> u64 {
        self.confirms.generation()
    }

    /// Close channel then connection, logging rather than returning failures
    async fn teardown(self) {
        let generation = self.generation();
        if let Err(e) = self.channel.close().await {
            debug!(generation, error = %e, "Ignoring channel close error during teardown");
        }
        if let Err(e) = self.connection.close().await {
            debug!(generation, error = %e, "Ignoring connection close error during teardown");
        }
    }
}

struct Slot<B: Broker> {
    link: Option<Link<B>>,
    state: ConnectionState,
}

/// Owner of the broker connection/channel pair
pub struct ConnectionManager<B: Broker> {
    broker: B,
    exchange: String,
    slot: Mutex<Slot<B>>,
    connect_gate: tokio::sync::Mutex<()>,
    generations: AtomicU64,
}

impl<B: Broker> ConnectionManager<B> {
    pub fn new(broker: B, exchange: impl Into<String>) -> Self {
        Self {
            broker,
            exchange: exchange.into(),
            slot: Mutex::new(Slot {
                link: None,
                state: ConnectionState::Disconnected,
            }),
            connect_gate: tokio::sync::Mutex::new(()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot<B>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_slot().state.clone()
    }

    /// Generation of the live link, if any
    pub fn generation(&self) -> Option<u64> {
        self.lock_slot().link.as_ref().map(Link::generation)
    }

    /// True iff the connection is open, a channel exists and no failure was recorded
    pub fn is_healthy(&self) -> bool {
        let slot = self.lock_slot();
        slot.state == ConnectionState::Connected
            && slot
                .link
                .as_ref()
                .is_some_and(|link| link.connection.is_open() && link.channel.is_open())
    }

    /// Copy out the live channel and its confirmation slot
    pub fn snapshot(&self) -> Option<ChannelSnapshot<B>> {
        let slot = self.lock_slot();
        if slot.state != ConnectionState::Connected {
            return None;
        }
        slot.link.as_ref().map(|link| ChannelSnapshot {
            channel: link.channel.clone(),
            confirms: link.confirms.clone(),
        })
    }

    /// Record a failure observed on the link of the given generation
    ///
    /// Stale generations are ignored so a late failure from a replaced link
    /// cannot mark its successor broken.
    pub fn mark_broken(&self, generation: u64, reason: impl Into<String>) {
        let mut slot = self.lock_slot();
        let current = slot.link.as_ref().map(Link::generation);
        if current == Some(generation) && slot.state == ConnectionState::Connected {
            let reason = reason.into();
            warn!(generation, reason = %reason, "Broker link marked broken");
            slot.state = ConnectionState::Broken(reason);
            metrics().set_broker_connected(false);
        }
    }

    /// Tear down any existing link and establish a fresh one
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.connect_within(&CallContext::new()).await
    }

    /// [`connect`](Self::connect) bounded by the caller's context
    pub async fn connect_within(&self, ctx: &CallContext) -> Result<(), AmqpError> {
        let _gate = tokio::select! {
            gate = self.connect_gate.lock() => gate,
            reason = ctx.done() => return Err(AmqpError::Cancelled(reason)),
        };
        self.connect_locked(ctx).await
    }

    /// Reconnect unless a concurrent caller already repaired the link
    ///
    /// Cancellation may interrupt the dial or the channel setup; handles acquired
    /// up to that point are closed before the cancellation is returned.
    pub async fn reconnect(&self, ctx: &CallContext) -> Result<(), AmqpError> {
        let _gate = tokio::select! {
            gate = self.connect_gate.lock() => gate,
            reason = ctx.done() => return Err(AmqpError::Cancelled(reason)),
        };
        if self.is_healthy() {
            debug!("Link already repaired by a concurrent caller");
            return Ok(());
        }
        warn!(exchange = %self.exchange, "Attempting to reconnect to broker");
        metrics().record_reconnect_attempt();
        self.connect_locked(ctx).await
    }

    async fn connect_locked(&self, ctx: &CallContext) -> Result<(), AmqpError> {
        let previous = {
            let mut slot = self.lock_slot();
            if slot.state == ConnectionState::Closed {
                return Err(AmqpError::Closed);
            }
            slot.state = ConnectionState::Disconnected;
            slot.link.take()
        };
        metrics().set_broker_connected(false);

        if let Some(old) = previous {
            old.teardown().await;
        }

        let link = self.establish(ctx).await.map_err(|e| {
            if !e.is_cancelled() {
                metrics().record_connection_failure();
            }
            e
        })?;
        let generation = link.generation();

        let rejected = {
            let mut slot = self.lock_slot();
            if slot.state == ConnectionState::Closed {
                Some(link)
            } else {
                slot.link = Some(link);
                slot.state = ConnectionState::Connected;
                None
            }
        };
        if let Some(link) = rejected {
            link.teardown().await;
            return Err(AmqpError::Closed);
        }

        metrics().record_connection_established();
        metrics().set_broker_connected(true);
        info!(exchange = %self.exchange, generation, "Broker publisher connected");
        Ok(())
    }

    /// Dial, open a channel, enable confirms and declare the exchange
    ///
    /// Nothing acquired here outlives a failure or a cancellation.
    async fn establish(&self, ctx: &CallContext) -> Result<Link<B>, AmqpError> {
        let connection = tokio::select! {
            dialed = self.broker.dial() => dialed.map_err(AmqpError::Connection)?,
            reason = ctx.done() => return Err(AmqpError::Cancelled(reason)),
        };

        let channel = match self.prepare_channel(&connection, ctx).await {
            Ok(channel) => channel,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Ignoring connection close error after failed setup");
                }
                return Err(e);
            }
        };

        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Link {
            connection: Arc::new(connection),
            channel: Arc::new(channel),
            confirms: Arc::new(ConfirmSlot::new(generation)),
        })
    }

    async fn prepare_channel(
        &self,
        connection: &B::Connection,
        ctx: &CallContext,
    ) -> Result<ChannelOf<B>, AmqpError> {
        let channel = tokio::select! {
            opened = connection.open_channel() => opened.map_err(AmqpError::Connection)?,
            reason = ctx.done() => return Err(AmqpError::Cancelled(reason)),
        };

        let configured = tokio::select! {
            configured = self.configure_channel(&channel) => configured,
            reason = ctx.done() => Err(AmqpError::Cancelled(reason)),
        };
        if let Err(e) = configured {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Ignoring channel close error after failed setup");
            }
            return Err(e);
        }
        Ok(channel)
    }

    async fn configure_channel(&self, channel: &ChannelOf<B>) -> Result<(), AmqpError> {
        channel
            .enable_confirms()
            .await
            .map_err(AmqpError::ConfirmMode)?;
        channel
            .declare_exchange(&self.exchange)
            .await
            .map_err(AmqpError::Connection)
    }

    /// Close channel then connection; a no-op when nothing is live
    pub async fn close(&self) -> Result<(), AmqpError> {
        let link = {
            let mut slot = self.lock_slot();
            slot.state = ConnectionState::Closed;
            slot.link.take()
        };
        metrics().set_broker_connected(false);

        let Some(link) = link else {
            debug!("Connection manager already closed");
            return Ok(());
        };

        if let Err(e) = link.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        link.connection.close().await.map_err(|e| {
            warn!(error = %e, "Failed to close connection");
            AmqpError::Connection(e)
        })?;

        info!(exchange = %self.exchange, "Broker publisher closed");
        Ok(())
    }
}
