//! fileshelf Bus - message bus abstraction
//!
//! Nodes exchange write commands and snapshot-sync messages over named
//! exchanges. Two delivery modes exist:
//!
//! - `subscribe`: every subscriber receives its own copy of each message.
//! - `consume_exclusive`: a durable work queue bound to the exchange, held
//!   by a single consumer at a time. Unacknowledged deliveries are
//!   redelivered.

pub mod loopback;
#[cfg(feature = "nats")]
pub mod nats;

use async_trait::async_trait;
use bytes::Bytes;
use fileshelf_common::config::{BusBackend, BusConfig};
use fileshelf_common::{Error, Result};
use futures::stream::{BoxStream, StreamExt};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

pub use loopback::LoopbackBus;
#[cfg(feature = "nats")]
pub use nats::NatsBus;

/// A message on an exchange
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Ties a published command to its completion
    pub correlation_id: Uuid,
    pub payload: Bytes,
}

impl Message {
    /// New message with a fresh correlation id
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(correlation_id: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            payload: payload.into(),
        }
    }
}

type Redeliver = Box<dyn FnOnce(Message) + Send>;

/// A received message awaiting acknowledgment
///
/// Dropping a delivery from the work queue without calling [`Delivery::ack`]
/// hands it back to the queue.
pub struct Delivery {
    message: Message,
    redeliver: Option<Redeliver>,
}

impl Delivery {
    /// A delivery that needs no acknowledgment (broadcast copies)
    #[must_use]
    pub fn new(message: Message) -> Self {
        Self {
            message,
            redeliver: None,
        }
    }

    /// A delivery that is redelivered through `redeliver` unless acked
    #[must_use]
    pub fn with_redelivery(message: Message, redeliver: impl FnOnce(Message) + Send + 'static) -> Self {
        Self {
            message,
            redeliver: Some(Box::new(redeliver)),
        }
    }

    #[must_use]
    pub fn message(&self) -> &Message {
        &self.message
    }

    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.message.correlation_id
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.message.payload
    }

    /// Acknowledge; the message will not be delivered again
    pub fn ack(&mut self) {
        self.redeliver = None;
    }

    #[must_use]
    pub fn is_acked(&self) -> bool {
        self.redeliver.is_none()
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("correlation_id", &self.message.correlation_id)
            .field("len", &self.message.payload.len())
            .field("acked", &self.is_acked())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(redeliver) = self.redeliver.take() {
            redeliver(self.message.clone());
        }
    }
}

/// Stream of deliveries from one subscription or queue claim
///
/// Dropping it unsubscribes (or releases the queue claim).
pub struct Subscription {
    stream: BoxStream<'static, Delivery>,
    _guard: Option<Box<dyn Send>>,
}

impl Subscription {
    #[must_use]
    pub fn new(stream: BoxStream<'static, Delivery>) -> Self {
        Self {
            stream,
            _guard: None,
        }
    }

    /// Keep `guard` alive for as long as the subscription
    #[must_use]
    pub fn with_guard(mut self, guard: impl Send + 'static) -> Self {
        self._guard = Some(Box::new(guard));
        self
    }

    /// Next delivery, or `None` once the bus side is gone
    pub async fn next(&mut self) -> Option<Delivery> {
        self.stream.next().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

/// Shared message bus
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Bus name for logging
    fn name(&self) -> &str;

    /// Publish to every subscriber of `exchange` and to its work queue
    ///
    /// Returns the message's correlation id.
    async fn publish(&self, exchange: &str, message: Message) -> Result<Uuid>;

    /// Receive a copy of every message published to `exchange`
    async fn subscribe(&self, exchange: &str) -> Result<Subscription>;

    /// Claim the durable work queue of `exchange`
    ///
    /// Fails with [`Error::Bus`] while another consumer holds the claim.
    async fn consume_exclusive(&self, exchange: &str) -> Result<Subscription>;
}

/// Build the bus selected by `config`
pub async fn connect(config: &BusConfig) -> Result<Arc<dyn MessageBus>> {
    match &config.backend {
        BusBackend::Loopback => Ok(Arc::new(LoopbackBus::new())),
        #[cfg(feature = "nats")]
        BusBackend::Nats { url } => Ok(Arc::new(NatsBus::connect(url, &config.exchange).await?)),
        #[cfg(not(feature = "nats"))]
        BusBackend::Nats { url } => Err(Error::Configuration(format!(
            "bus backend nats ({url}) requires the `nats` feature"
        ))),
    }
}
