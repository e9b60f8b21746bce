//! NATS-backed message bus
//!
//! Exchanges map to subjects. Exclusive consumption uses a queue group, so
//! NATS delivers each message to one member only. Core NATS has no
//! acknowledgments; acking a delivery is a no-op.

use crate::{Delivery, Message, MessageBus, Subscription};
use async_nats::{Client, ConnectOptions, HeaderMap, HeaderValue};
use async_trait::async_trait;
use fileshelf_common::{Error, Result};
use futures::StreamExt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// Header carrying the correlation id
pub const CORRELATION_HEADER: &str = "Fileshelf-Correlation-Id";

/// NATS client wrapper
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
    queue_group: String,
}

impl NatsBus {
    /// Connect to `url`; `group` names the work queue group
    pub async fn connect(url: &str, group: &str) -> Result<Self> {
        info!(url, "connecting to NATS");
        let client = ConnectOptions::new()
            .name("fileshelf")
            .connection_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| Error::bus(format!("failed to connect to {url}: {e}")))?;
        info!(url, "connected to NATS");

        Ok(Self {
            client,
            queue_group: format!("{group}.work"),
        })
    }

    fn decode(message: async_nats::Message) -> Delivery {
        let correlation_id = message
            .headers
            .as_ref()
            .and_then(|h| h.get(CORRELATION_HEADER))
            .and_then(|v| Uuid::parse_str(v.as_str()).ok())
            .unwrap_or_else(|| {
                warn!(subject = %message.subject, "message without correlation id");
                Uuid::nil()
            });
        Delivery::new(Message::with_correlation_id(correlation_id, message.payload))
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    fn name(&self) -> &str {
        "nats"
    }

    async fn publish(&self, exchange: &str, message: Message) -> Result<Uuid> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&message.correlation_id.to_string())
            .map_err(|e| Error::bus(format!("invalid header: {e}")))?;
        headers.insert(CORRELATION_HEADER, value);

        self.client
            .publish_with_headers(exchange.to_string(), headers, message.payload)
            .await
            .map_err(|e| Error::bus(format!("publish to {exchange} failed: {e}")))?;
        Ok(message.correlation_id)
    }

    async fn subscribe(&self, exchange: &str) -> Result<Subscription> {
        let subscriber = self
            .client
            .subscribe(exchange.to_string())
            .await
            .map_err(|e| Error::bus(format!("subscribe to {exchange} failed: {e}")))?;
        Ok(Subscription::new(subscriber.map(Self::decode).boxed()))
    }

    async fn consume_exclusive(&self, exchange: &str) -> Result<Subscription> {
        let subscriber = self
            .client
            .queue_subscribe(exchange.to_string(), self.queue_group.clone())
            .await
            .map_err(|e| Error::bus(format!("queue subscribe to {exchange} failed: {e}")))?;
        Ok(Subscription::new(subscriber.map(Self::decode).boxed()))
    }
}
