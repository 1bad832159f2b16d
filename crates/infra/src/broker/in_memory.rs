//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{
    delivery_channel, AckToken, Broker, BrokerError, Deliveries, Delivery, DeliveryHandle, DeliverySink, QueuedMessage,
};

#[derive(Debug)]
struct Ready {
    tag: u64,
    message: QueuedMessage,
    redelivered: bool,
}

#[derive(Debug)]
struct InFlight {
    message: QueuedMessage,
    consumer: String,
    subscription: u64,
}

#[derive(Debug, Default)]
struct State {
    ready: VecDeque<Ready>,
    in_flight: HashMap<String, InFlight>,
    dead_letters: Vec<QueuedMessage>,
    /// Live subscriptions and the consumer each belongs to.
    subscriptions: HashMap<u64, String>,
    next_subscription: u64,
    next_tag: u64,
    published: u64,
    closed: bool,
    failing_publishes: u32,
}

impl State {
    fn enqueue(&mut self, message: QueuedMessage, redelivered: bool) -> u64 {
        self.next_tag += 1;
        let tag = self.next_tag;
        self.ready.push_back(Ready {
            tag,
            message,
            redelivered,
        });
        tag
    }

    /// Return unacknowledged deliveries to the head of the queue.
    fn redeliver(&mut self, filter: impl Fn(&InFlight) -> bool) -> usize {
        let tags: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, f)| filter(f))
            .map(|(tag, _)| tag.clone())
            .collect();

        for tag in &tags {
            if let Some(flight) = self.in_flight.remove(tag) {
                self.next_tag += 1;
                let next = self.next_tag;
                self.ready.push_front(Ready {
                    tag: next,
                    message: flight.message,
                    redelivered: true,
                });
            }
        }
        tags.len()
    }
}

/// Process-local queue with the same delivery contract as the real adapters.
///
/// Unacknowledged deliveries are tracked per subscription. When a
/// subscription ends (its [`Deliveries`] dropped, the consumer crashed or
/// the connection interrupted) whatever it still held goes back to the
/// queue. Tests use [`InMemoryBroker::crash_consumer`] and
/// [`InMemoryBroker::interrupt`] to simulate failures.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    changes: watch::Sender<u64>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
        }
    }

    fn wake(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Make the next `n` publishes fail with `BrokerError::Publish`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.state.lock().unwrap().failing_publishes = n;
    }

    /// Simulate `consumer` dying before acking: its subscriptions end and
    /// its deliveries go back to the queue.
    pub fn crash_consumer(&self, consumer: &str) -> usize {
        let n = {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.retain(|_, name| name != consumer);
            state.redeliver(|f| f.consumer == consumer)
        };
        warn!(consumer, redelivered = n, "consumer crashed");
        self.wake();
        n
    }

    /// Simulate a lost connection: every subscription ends and every
    /// unacknowledged delivery is queued again.
    pub fn interrupt(&self) -> usize {
        let n = {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.clear();
            state.redeliver(|_| true)
        };
        warn!(redelivered = n, "broker connection interrupted");
        self.wake();
        n
    }

    pub fn ready_len(&self) -> usize {
        self.state.lock().unwrap().ready.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.state.lock().unwrap().in_flight.len()
    }

    pub fn published_count(&self) -> u64 {
        self.state.lock().unwrap().published
    }

    pub fn dead_letters(&self) -> Vec<QueuedMessage> {
        self.state.lock().unwrap().dead_letters.clone()
    }

    /// Take the next delivery for `subscription`, if one is ready and the
    /// subscription is still live. `Err` ends the subscription.
    fn take(&self, subscription: u64) -> Result<Option<Delivery>, ()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(());
        }
        let Some(consumer) = state.subscriptions.get(&subscription).cloned() else {
            return Err(());
        };
        let Some(ready) = state.ready.pop_front() else {
            return Ok(None);
        };

        let tag = format!("mem-{}", ready.tag);
        state.in_flight.insert(
            tag.clone(),
            InFlight {
                message: ready.message,
                consumer,
                subscription,
            },
        );
        Ok(Some(Delivery {
            message: ready.message,
            handle: DeliveryHandle::new(tag, ready.message),
            redelivered: ready.redelivered,
        }))
    }

    /// Forget `subscription` and requeue everything it had not settled.
    fn end_subscription(&self, subscription: u64) -> usize {
        let n = {
            let mut state = self.state.lock().unwrap();
            state.subscriptions.remove(&subscription);
            state.redeliver(|f| f.subscription == subscription)
        };
        if n > 0 {
            self.wake();
        }
        n
    }

    async fn pump(&self, subscription: u64, mut sink: DeliverySink, mut changes: watch::Receiver<u64>) {
        while sink.wanted().await {
            let delivery = loop {
                if sink.is_closed() {
                    return;
                }
                changes.borrow_and_update();
                match self.take(subscription) {
                    Ok(Some(delivery)) => break delivery,
                    Ok(None) => {
                        tokio::select! {
                            changed = changes.changed() => if changed.is_err() { return },
                            _ = sink.closed() => return,
                        }
                    }
                    Err(()) => return,
                }
            };
            // A delivery the consumer never saw is requeued with the subscription.
            if sink.send(delivery).is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: QueuedMessage) -> Result<AckToken, BrokerError> {
        let tag = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            if state.failing_publishes > 0 {
                state.failing_publishes -= 1;
                return Err(BrokerError::Publish("simulated publish failure".to_string()));
            }
            state.published += 1;
            state.enqueue(message, false)
        };
        self.wake();
        Ok(AckToken(format!("mem-{tag}")))
    }

    async fn consume(&self, consumer: &str) -> Result<Deliveries, BrokerError> {
        let subscription = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.next_subscription += 1;
            let id = state.next_subscription;
            state.subscriptions.insert(id, consumer.to_string());
            id
        };

        let (sink, deliveries) = delivery_channel();
        let broker = self.clone();
        let consumer = consumer.to_string();
        let changes = self.changes.subscribe();

        tokio::spawn(async move {
            broker.pump(subscription, sink, changes).await;
            let requeued = broker.end_subscription(subscription);
            debug!(consumer = %consumer, subscription, requeued, "subscription ended");
        });

        Ok(deliveries)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        // Acking a delivery that was already redelivered elsewhere is a no-op.
        self.state.lock().unwrap().in_flight.remove(handle.tag());
        Ok(())
    }

    async fn nack(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), BrokerError> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(BrokerError::Closed);
            }
            state.in_flight.remove(handle.tag());
            if requeue {
                state.enqueue(handle.message(), true);
            } else {
                state.dead_letters.push(handle.message());
            }
        }
        self.wake();
        Ok(())
    }

    async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            state.subscriptions.clear();
            // Unsettled deliveries survive for whoever opens the queue next.
            state.redeliver(|_| true);
        }
        self.wake();
    }
}
