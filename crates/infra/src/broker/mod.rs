//! Broker Adapter: durable job queue with at-least-once delivery.
//!
//! Messages carry a job id and an attempt hint, never document content. A
//! delivery stays unacknowledged until the worker calls [`Broker::ack`] or
//! [`Broker::nack`]; anything left unacknowledged by a crashed consumer is
//! handed to another consumer later.
//!
//! Implementations:
//! - [`InMemoryBroker`] for tests/dev, with hooks to simulate crashes and
//!   connection loss
//! - `RedisStreamsBroker` (feature `redis`), backed by a Redis Streams
//!   consumer group

mod backoff;
mod in_memory;
#[cfg(feature = "redis")]
mod redis_streams;

use async_trait::async_trait;
use tokio::sync::mpsc;

use docflow_core::JobId;

pub use backoff::{retry_with_backoff, Backoff};
pub use in_memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisStreamsConfig};

/// Broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("broker connection error: {0}")]
    Connection(String),
    #[error("message codec error: {0}")]
    Codec(String),
    #[error("broker adapter is closed")]
    Closed,
}

/// What goes on the wire: a job id and the attempt count it was queued at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueuedMessage {
    pub job_id: JobId,
    /// `attempt_count` when the message was published. Informational only:
    /// a requeued delivery carries the original value, and workers always
    /// go by the job record.
    pub attempt_hint: u32,
}

impl QueuedMessage {
    pub fn new(job_id: JobId, attempt_hint: u32) -> Self {
        Self { job_id, attempt_hint }
    }
}

/// Broker-assigned id of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckToken(pub String);

/// Identifies one delivery for `ack`/`nack`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    tag: String,
    message: QueuedMessage,
}

impl DeliveryHandle {
    pub(crate) fn new(tag: impl Into<String>, message: QueuedMessage) -> Self {
        Self {
            tag: tag.into(),
            message,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn message(&self) -> QueuedMessage {
        self.message
    }
}

/// One instance of the broker handing a message to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: QueuedMessage,
    pub handle: DeliveryHandle,
    /// The broker has handed this message out before.
    pub redelivered: bool,
}

/// Stream of deliveries for one consumer.
///
/// Ends (`next` returns `None`) when the adapter is closed or the
/// subscription was lost; callers re-`consume` to resubscribe.
///
/// Nothing is prefetched: the adapter takes a message off the queue only
/// once `next` has been called, so a busy consumer never sits on work an
/// idle one could take.
#[derive(Debug)]
pub struct Deliveries {
    rx: mpsc::Receiver<Delivery>,
    demand: mpsc::Sender<()>,
    asked: bool,
}

impl Deliveries {
    /// Cancel-safe: a `next` dropped mid-wait leaves its request standing
    /// for the following call.
    pub async fn next(&mut self) -> Option<Delivery> {
        if !self.asked {
            // A full or closed demand channel means a request is already
            // pending or the adapter is gone; `recv` settles both.
            let _ = self.demand.try_send(());
            self.asked = true;
        }
        let delivery = self.rx.recv().await;
        self.asked = false;
        delivery
    }
}

/// Adapter side of a [`Deliveries`] stream.
#[derive(Debug)]
pub(crate) struct DeliverySink {
    tx: mpsc::Sender<Delivery>,
    demand: mpsc::Receiver<()>,
}

impl DeliverySink {
    /// Wait for the consumer to ask for a delivery. `false` once it is gone.
    pub(crate) async fn wanted(&mut self) -> bool {
        self.demand.recv().await.is_some()
    }

    /// Hand over a requested delivery. Gives it back if the consumer is gone.
    pub(crate) fn send(&self, delivery: Delivery) -> Result<(), Delivery> {
        self.tx.try_send(delivery).map_err(|e| e.into_inner())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the consumer has dropped its stream.
    pub(crate) async fn closed(&self) {
        self.tx.closed().await
    }
}

/// A connected [`DeliverySink`]/[`Deliveries`] pair.
pub(crate) fn delivery_channel() -> (DeliverySink, Deliveries) {
    let (tx, rx) = mpsc::channel(1);
    let (demand_tx, demand_rx) = mpsc::channel(1);
    (
        DeliverySink { tx, demand: demand_rx },
        Deliveries {
            rx,
            demand: demand_tx,
            asked: false,
        },
    )
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Durably enqueue a message.
    async fn publish(&self, message: QueuedMessage) -> Result<AckToken, BrokerError>;

    /// Subscribe `consumer` to the queue.
    async fn consume(&self, consumer: &str) -> Result<Deliveries, BrokerError>;

    /// Done with this delivery; never hand it out again.
    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), BrokerError>;

    /// Give the delivery back. `requeue = false` moves it to the dead-letter queue.
    async fn nack(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), BrokerError>;

    /// Stop all subscriptions and release connections. Idempotent.
    async fn close(&self);
}
