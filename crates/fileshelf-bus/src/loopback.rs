//! In-process message bus
//!
//! Every clone of a [`LoopbackBus`] shares the same exchanges, so several
//! nodes inside one process (tests, single-binary deployments) see each
//! other's messages.

use crate::{Delivery, Message, MessageBus, Subscription};
use async_trait::async_trait;
use fileshelf_common::{Error, Result};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, trace};
use uuid::Uuid;

/// Durable queue bound to one exchange
struct WorkQueue {
    tx: mpsc::UnboundedSender<Message>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    /// Unacked deliveries, served before anything still queued
    redelivered: Mutex<VecDeque<Message>>,
    wake: Notify,
    claimed: AtomicBool,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            redelivered: Mutex::new(VecDeque::new()),
            wake: Notify::new(),
            claimed: AtomicBool::new(false),
        }
    }

    fn redeliver(&self, message: Message) {
        self.redelivered.lock().push_back(message);
        self.wake.notify_one();
    }

    async fn next_message(&self) -> Option<Message> {
        let mut rx = self.rx.lock().await;
        loop {
            if let Some(message) = self.redelivered.lock().pop_front() {
                return Some(message);
            }
            tokio::select! {
                message = rx.recv() => return message,
                () = self.wake.notified() => {}
            }
        }
    }
}

/// Releases the exclusive claim when the subscription is dropped
struct ClaimGuard {
    queue: Arc<WorkQueue>,
    exchange: String,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        self.queue.claimed.store(false, Ordering::Release);
        debug!(exchange = %self.exchange, "released work queue claim");
    }
}

#[derive(Default)]
struct Exchange {
    subscribers: Vec<mpsc::UnboundedSender<Delivery>>,
    /// Declared by the first exclusive consumer
    queue: Option<Arc<WorkQueue>>,
}

/// In-process bus with fan-out subscriptions and exclusive work queues
#[derive(Clone, Default)]
pub struct LoopbackBus {
    exchanges: Arc<Mutex<HashMap<String, Exchange>>>,
}

impl LoopbackBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageBus for LoopbackBus {
    fn name(&self) -> &str {
        "loopback"
    }

    async fn publish(&self, exchange: &str, message: Message) -> Result<Uuid> {
        let correlation_id = message.correlation_id;
        let mut exchanges = self.exchanges.lock();
        let Some(entry) = exchanges.get_mut(exchange) else {
            trace!(exchange, %correlation_id, "no consumers, message dropped");
            return Ok(correlation_id);
        };

        entry
            .subscribers
            .retain(|tx| tx.send(Delivery::new(message.clone())).is_ok());

        if let Some(queue) = &entry.queue {
            queue
                .tx
                .send(message)
                .map_err(|_| Error::bus(format!("work queue for {exchange} is closed")))?;
        }

        trace!(
            exchange,
            %correlation_id,
            subscribers = entry.subscribers.len(),
            queued = entry.queue.is_some(),
            "published"
        );
        Ok(correlation_id)
    }

    async fn subscribe(&self, exchange: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.exchanges
            .lock()
            .entry(exchange.to_string())
            .or_default()
            .subscribers
            .push(tx);
        debug!(exchange, "subscribed");

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|delivery| (delivery, rx))
        });
        Ok(Subscription::new(stream.boxed()))
    }

    async fn consume_exclusive(&self, exchange: &str) -> Result<Subscription> {
        let queue = {
            let mut exchanges = self.exchanges.lock();
            let entry = exchanges.entry(exchange.to_string()).or_default();
            entry
                .queue
                .get_or_insert_with(|| {
                    debug!(exchange, "declared work queue");
                    Arc::new(WorkQueue::new())
                })
                .clone()
        };

        if queue.claimed.swap(true, Ordering::AcqRel) {
            return Err(Error::bus(format!(
                "work queue for {exchange} is already claimed by another consumer"
            )));
        }
        debug!(exchange, "claimed work queue");

        let stream = stream::unfold(queue.clone(), |queue| async move {
            let message = queue.next_message().await?;
            let requeue = queue.clone();
            let delivery = Delivery::with_redelivery(message, move |m| requeue.redeliver(m));
            Some((delivery, queue))
        });

        Ok(Subscription::new(stream.boxed()).with_guard(ClaimGuard {
            queue,
            exchange: exchange.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let bus = LoopbackBus::new();
        let mut a = bus.subscribe("files").await.unwrap();
        let mut b = bus.subscribe("files").await.unwrap();

        let id = bus.publish("files", Message::new(&b"hello"[..])).await.unwrap();

        for sub in [&mut a, &mut b] {
            let delivery = sub.next().await.unwrap();
            assert_eq!(delivery.correlation_id(), id);
            assert_eq!(delivery.payload().as_ref(), b"hello");
        }
    }

    #[tokio::test]
    async fn test_exchanges_are_isolated() {
        let bus = LoopbackBus::new();
        let mut sub = bus.subscribe("files").await.unwrap();
        bus.publish("other", Message::new(&b"x"[..])).await.unwrap();
        assert!(timeout(WAIT, sub.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_clones_share_exchanges() {
        let bus = LoopbackBus::new();
        let other_node = bus.clone();
        let mut sub = bus.subscribe("files").await.unwrap();
        other_node.publish("files", Message::new(&b"x"[..])).await.unwrap();
        assert!(sub.next().await.is_some());
    }

    #[tokio::test]
    async fn test_exclusive_claim_is_single() {
        let bus = LoopbackBus::new();
        let first = bus.consume_exclusive("files").await.unwrap();
        let err = bus.consume_exclusive("files").await.unwrap_err();
        assert!(matches!(err, Error::Bus(_)));

        drop(first);
        assert!(bus.consume_exclusive("files").await.is_ok());
    }

    #[tokio::test]
    async fn test_queue_keeps_messages_between_claims() {
        let bus = LoopbackBus::new();
        drop(bus.consume_exclusive("files").await.unwrap());

        let id = bus.publish("files", Message::new(&b"x"[..])).await.unwrap();

        let mut queue = bus.consume_exclusive("files").await.unwrap();
        let mut delivery = queue.next().await.unwrap();
        assert_eq!(delivery.correlation_id(), id);
        delivery.ack();
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_requeued() {
        let bus = LoopbackBus::new();
        let mut queue = bus.consume_exclusive("files").await.unwrap();
        let id = bus.publish("files", Message::new(&b"x"[..])).await.unwrap();

        drop(queue.next().await.unwrap());

        let mut again = queue.next().await.unwrap();
        assert_eq!(again.correlation_id(), id);
        again.ack();
        drop(again);
        assert!(timeout(WAIT, queue.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_unacked_delivery_keeps_its_place() {
        let bus = LoopbackBus::new();
        let mut queue = bus.consume_exclusive("files").await.unwrap();
        let first = bus.publish("files", Message::new(&b"1"[..])).await.unwrap();
        let second = bus.publish("files", Message::new(&b"2"[..])).await.unwrap();

        drop(queue.next().await.unwrap());

        for expected in [first, second] {
            let mut delivery = queue.next().await.unwrap();
            assert_eq!(delivery.correlation_id(), expected);
            delivery.ack();
        }
    }

    #[tokio::test]
    async fn test_redelivery_wakes_waiting_consumer() {
        let bus = LoopbackBus::new();
        let mut queue = bus.consume_exclusive("files").await.unwrap();
        let id = bus.publish("files", Message::new(&b"x"[..])).await.unwrap();
        let delivery = queue.next().await.unwrap();

        let waiting = tokio::spawn(async move { queue.next().await.map(|d| d.correlation_id()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(delivery);

        let redelivered = timeout(WAIT, waiting).await.unwrap().unwrap();
        assert_eq!(redelivered, Some(id));
    }

    #[tokio::test]
    async fn test_queue_and_subscribers_both_receive() {
        let bus = LoopbackBus::new();
        let mut queue = bus.consume_exclusive("files").await.unwrap();
        let mut sub = bus.subscribe("files").await.unwrap();

        bus.publish("files", Message::new(&b"x"[..])).await.unwrap();

        queue.next().await.unwrap().ack();
        assert!(sub.next().await.is_some());
    }

    #[tokio::test]
    async fn test_publish_without_queue_is_not_retained() {
        let bus = LoopbackBus::new();
        bus.publish("files", Message::new(&b"lost"[..])).await.unwrap();

        let mut queue = bus.consume_exclusive("files").await.unwrap();
        assert!(timeout(WAIT, queue.next()).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let bus = LoopbackBus::new();
        drop(bus.subscribe("files").await.unwrap());
        bus.publish("files", Message::new(&b"x"[..])).await.unwrap();
        assert!(bus.exchanges.lock()["files"].subscribers.is_empty());
    }
}
