//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Stream**: `docflow:jobs`, one entry per queued message (`job_id`, `attempt`)
//! - **Consumer group**: `docflow-workers`; each worker is a named consumer
//! - **Redelivery**: entries left unacknowledged longer than the visibility
//!   timeout are taken over with `XCLAIM` by whichever consumer reads next
//! - **Dead-letter stream**: `docflow:jobs:dlq`, fed by `nack(requeue = false)`
//!   and by entries that cannot be decoded
//!
//! Each subscription owns its connection (a blocking `XREADGROUP` would stall
//! a shared multiplexed connection) and reconnects with exponential backoff.
//! Publishes, acks and nacks share one cached multiplexed connection that is
//! dropped and re-established after any error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use docflow_core::{JobId, RetryPolicy};

use super::{
    delivery_channel, retry_with_backoff, AckToken, Backoff, Broker, BrokerError, Deliveries, Delivery,
    DeliveryHandle, DeliverySink, QueuedMessage,
};

/// Default stream key for job messages
const DEFAULT_STREAM_KEY: &str = "docflow:jobs";

/// Default consumer group
const DEFAULT_GROUP: &str = "docflow-workers";

/// Default idle time before an unacknowledged entry is reclaimed
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    pub url: String,
    pub stream_key: String,
    pub dlq_key: String,
    pub group: String,
    pub visibility_timeout: Duration,
    /// How long one `XREADGROUP` blocks waiting for new entries.
    pub block: Duration,
    /// Reconnect and publish retry curve.
    pub reconnect: RetryPolicy,
}

impl RedisStreamsConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            dlq_key: format!("{DEFAULT_STREAM_KEY}:dlq"),
            group: DEFAULT_GROUP.to_string(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            block: Duration::from_secs(2),
            reconnect: RetryPolicy::exponential(5, Duration::from_millis(200), Duration::from_secs(30)),
        }
    }

    pub fn with_stream(mut self, stream_key: impl Into<String>) -> Self {
        self.stream_key = stream_key.into();
        self.dlq_key = format!("{}:dlq", self.stream_key);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

#[derive(Debug)]
struct Shared {
    client: redis::Client,
    config: RedisStreamsConfig,
    commands: Mutex<Option<MultiplexedConnection>>,
    closed: watch::Sender<bool>,
}

/// One owned adapter instance per process (or per test); no globals.
#[derive(Debug, Clone)]
pub struct RedisStreamsBroker {
    shared: Arc<Shared>,
}

impl RedisStreamsBroker {
    /// Connect and make sure the stream and consumer group exist.
    #[instrument(skip(config), fields(stream_key = %config.stream_key, group = %config.group), err)]
    pub async fn open(config: RedisStreamsConfig) -> Result<Self, BrokerError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| BrokerError::Connection(e.to_string()))?;
        let (closed, _) = watch::channel(false);

        let broker = Self {
            shared: Arc::new(Shared {
                client,
                config,
                commands: Mutex::new(None),
                closed,
            }),
        };

        let mut conn = broker.shared.connection().await?;
        broker.shared.ensure_group(&mut conn).await?;
        info!("redis streams broker ready");
        Ok(broker)
    }

    pub fn config(&self) -> &RedisStreamsConfig {
        &self.shared.config
    }
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    async fn connect(&self) -> Result<MultiplexedConnection, BrokerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }

    /// Cached command connection, opened on first use.
    async fn connection(&self) -> Result<MultiplexedConnection, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let mut cached = self.commands.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connect().await?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_connection(&self) {
        self.commands.lock().await.take();
    }

    /// Ensure the consumer group exists (idempotent).
    async fn ensure_group(&self, conn: &mut MultiplexedConnection) -> Result<(), BrokerError> {
        // MKSTREAM creates the stream if needed; "0" lets the group see entries
        // published before it existed.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BrokerError::Connection(format!("XGROUP CREATE failed: {}", e))),
        }
    }

    async fn xadd(&self, message: QueuedMessage) -> Result<AckToken, BrokerError> {
        let mut conn = self.connection().await?;
        let id: redis::RedisResult<String> = redis::cmd("XADD")
            .arg(&self.config.stream_key)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("attempt")
            .arg(message.attempt_hint.to_string())
            .query_async(&mut conn)
            .await;

        match id {
            Ok(id) => Ok(AckToken(id)),
            Err(e) => {
                self.reset_connection().await;
                Err(BrokerError::Publish(format!("XADD failed: {}", e)))
            }
        }
    }

    /// Next entry for `consumer`: a reclaimed idle entry first, then a new one.
    async fn read_next(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        if let Some(delivery) = self.reclaim_idle(conn, consumer).await? {
            return Ok(Some(delivery));
        }
        self.read_new(conn, consumer).await
    }

    /// Take over one entry some consumer left unacknowledged past the visibility timeout.
    async fn reclaim_idle(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let min_idle_ms = self.config.visibility_timeout.as_millis() as u64;

        // XPENDING <key> <group> IDLE <ms> - + 1 -> [[id, owner, idle_ms, deliveries]]
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Connection(format!("XPENDING failed: {}", e)))?;

        let Some((id, previous_owner, _, deliveries)) = pending.into_iter().next() else {
            return Ok(None);
        };

        // Another consumer may win the same XCLAIM; the loser gets nothing back.
        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(&self.config.stream_key)
            .arg(&self.config.group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg(&id)
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Connection(format!("XCLAIM failed: {}", e)))?;

        for entry in claimed {
            if let Some(delivery) = self.decode_or_quarantine(conn, entry, true).await? {
                warn!(
                    message_id = %id,
                    previous_owner = %previous_owner,
                    deliveries,
                    "reclaimed idle delivery"
                );
                return Ok(Some(delivery));
            }
        }
        Ok(None)
    }

    /// Read one new entry (blocking up to the configured time).
    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        consumer: &str,
    ) -> Result<Option<Delivery>, BrokerError> {
        let reply: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.group)
            .arg(consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.config.stream_key)
            .arg(">")
            .query_async(conn)
            .await
            .map_err(|e| BrokerError::Connection(format!("XREADGROUP failed: {}", e)))?;

        // Reply: nil on timeout, else [[stream_key, [entry, ...]]]
        let streams = match reply {
            redis::Value::Nil => return Ok(None),
            redis::Value::Bulk(streams) => streams,
            other => return Err(BrokerError::Codec(format!("unexpected XREADGROUP reply: {:?}", other))),
        };

        for stream in streams {
            let redis::Value::Bulk(mut parts) = stream else {
                continue;
            };
            if parts.len() < 2 {
                continue;
            }
            let redis::Value::Bulk(entries) = parts.swap_remove(1) else {
                continue;
            };
            for entry in entries {
                if let Some(delivery) = self.decode_or_quarantine(conn, entry, false).await? {
                    return Ok(Some(delivery));
                }
            }
        }
        Ok(None)
    }

    /// Decode an entry; undecodable entries are moved to the DLQ so they
    /// cannot wedge the group.
    async fn decode_or_quarantine(
        &self,
        conn: &mut MultiplexedConnection,
        entry: redis::Value,
        redelivered: bool,
    ) -> Result<Option<Delivery>, BrokerError> {
        match parse_stream_entry(entry) {
            Ok((id, message)) => Ok(Some(Delivery {
                message,
                handle: DeliveryHandle::new(id, message),
                redelivered,
            })),
            Err((Some(id), e)) => {
                error!(message_id = %id, error = %e, "undecodable stream entry, dead-lettering");
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("XACK")
                    .arg(&self.config.stream_key)
                    .arg(&self.config.group)
                    .arg(&id)
                    .ignore()
                    .cmd("XADD")
                    .arg(&self.config.dlq_key)
                    .arg("*")
                    .arg("original_message_id")
                    .arg(&id)
                    .arg("reason")
                    .arg(e.to_string())
                    .ignore()
                    .query_async(conn)
                    .await
                    .map_err(|e| BrokerError::Connection(format!("DLQ quarantine failed: {}", e)))?;
                Ok(None)
            }
            Err((None, e)) => Err(e),
        }
    }

    /// Subscription loop: (re)connect, read, forward; until closed or the
    /// receiver goes away.
    async fn run_consumer(self: Arc<Self>, consumer: String, mut sink: DeliverySink) {
        let mut closed = self.closed.subscribe();
        let mut backoff = Backoff::new(self.config.reconnect.clone());
        // A request from the consumer survives reconnects.
        let mut owed = false;

        'connect: loop {
            if *closed.borrow() || sink.is_closed() {
                break;
            }

            let mut conn = match self.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(consumer = %consumer, attempt = backoff.attempts(), delay_ms = delay.as_millis() as u64, error = %e, "broker reconnect failed");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'connect,
                        _ = closed.changed() => break 'connect,
                    }
                }
            };
            if let Err(e) = self.ensure_group(&mut conn).await {
                warn!(consumer = %consumer, error = %e, "consumer group setup failed");
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue 'connect,
                    _ = closed.changed() => break 'connect,
                }
            }
            if backoff.attempts() > 0 {
                info!(consumer = %consumer, "broker subscription re-established");
            }
            backoff.reset();

            loop {
                // Read only on request: an entry read here is pending on this
                // consumer until acked, so nothing is read for a busy worker.
                if !owed {
                    let wanted = tokio::select! {
                        wanted = sink.wanted() => wanted,
                        _ = closed.changed() => break 'connect,
                    };
                    if !wanted {
                        break 'connect;
                    }
                    owed = true;
                }
                if sink.is_closed() {
                    break 'connect;
                }

                let next = tokio::select! {
                    next = self.read_next(&mut conn, &consumer) => next,
                    _ = closed.changed() => break 'connect,
                };
                match next {
                    Ok(Some(delivery)) => {
                        debug!(consumer = %consumer, job_id = %delivery.message.job_id, "delivery received");
                        owed = false;
                        if sink.send(delivery).is_err() {
                            // The entry stays pending and is reclaimed after the visibility timeout.
                            break 'connect;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(consumer = %consumer, error = %e, "broker connection lost, reconnecting");
                        continue 'connect;
                    }
                }
            }
        }
        debug!(consumer = %consumer, "subscription ended");
    }
}

#[async_trait]
impl Broker for RedisStreamsBroker {
    #[instrument(skip(self), fields(job_id = %message.job_id), err)]
    async fn publish(&self, message: QueuedMessage) -> Result<AckToken, BrokerError> {
        let shared = &self.shared;
        retry_with_backoff(&shared.config.reconnect, "publish", move || async move {
            match shared.xadd(message).await {
                Err(BrokerError::Connection(e)) => Err(BrokerError::Publish(e)),
                other => other,
            }
        })
        .await
    }

    async fn consume(&self, consumer: &str) -> Result<Deliveries, BrokerError> {
        if self.shared.is_closed() {
            return Err(BrokerError::Closed);
        }
        let (sink, deliveries) = delivery_channel();
        tokio::spawn(self.shared.clone().run_consumer(consumer.to_string(), sink));
        Ok(deliveries)
    }

    #[instrument(skip(self, handle), fields(message_id = %handle.tag()), err)]
    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), BrokerError> {
        let mut conn = self.shared.connection().await?;
        let acked: redis::RedisResult<u64> = redis::cmd("XACK")
            .arg(&self.shared.config.stream_key)
            .arg(&self.shared.config.group)
            .arg(handle.tag())
            .query_async(&mut conn)
            .await;

        if let Err(e) = acked {
            self.shared.reset_connection().await;
            return Err(BrokerError::Connection(format!("XACK failed: {}", e)));
        }
        Ok(())
    }

    /// Acknowledge the entry and append a fresh one (to the stream or the DLQ)
    /// in one `MULTI`, so the message is never both lost and acked.
    #[instrument(skip(self, handle), fields(message_id = %handle.tag()), err)]
    async fn nack(&self, handle: &DeliveryHandle, requeue: bool) -> Result<(), BrokerError> {
        let config = &self.shared.config;
        let message = handle.message();
        let target = if requeue { &config.stream_key } else { &config.dlq_key };

        let mut conn = self.shared.connection().await?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XACK")
            .arg(&config.stream_key)
            .arg(&config.group)
            .arg(handle.tag())
            .ignore()
            .cmd("XADD")
            .arg(target)
            .arg("*")
            .arg("job_id")
            .arg(message.job_id.to_string())
            .arg("attempt")
            .arg(message.attempt_hint.to_string());
        if !requeue {
            pipe.arg("original_message_id").arg(handle.tag());
        }
        pipe.ignore();

        let result: redis::RedisResult<()> = pipe.query_async(&mut conn).await;
        if let Err(e) = result {
            self.shared.reset_connection().await;
            return Err(BrokerError::Connection(format!("nack failed: {}", e)));
        }
        Ok(())
    }

    async fn close(&self) {
        self.shared.closed.send_replace(true);
        self.shared.reset_connection().await;
        info!("redis streams broker closed");
    }
}

/// Parse `[id, [field, value, ...]]`. On failure, returns the id when it
/// could be read so the caller can quarantine the entry.
fn parse_stream_entry(entry: redis::Value) -> Result<(String, QueuedMessage), (Option<String>, BrokerError)> {
    let codec = |msg: &str| BrokerError::Codec(msg.to_string());

    let redis::Value::Bulk(mut parts) = entry else {
        return Err((None, codec("invalid entry format")));
    };
    if parts.len() < 2 {
        return Err((None, codec("entry too short")));
    }
    let fields = parts.swap_remove(1);
    let id = match &parts[0] {
        redis::Value::Data(data) => String::from_utf8_lossy(data).into_owned(),
        _ => return Err((None, codec("invalid message id format"))),
    };

    let redis::Value::Bulk(fields) = fields else {
        return Err((Some(id), codec("invalid fields format")));
    };
    let mut map = HashMap::new();
    for chunk in fields.chunks(2) {
        if let [redis::Value::Data(key), redis::Value::Data(value)] = chunk {
            map.insert(
                String::from_utf8_lossy(key).into_owned(),
                String::from_utf8_lossy(value).into_owned(),
            );
        }
    }

    let job_id = match map.get("job_id").map(|s| s.parse::<JobId>()) {
        Some(Ok(job_id)) => job_id,
        Some(Err(e)) => return Err((Some(id), BrokerError::Codec(format!("invalid job_id: {}", e)))),
        None => return Err((Some(id), codec("missing job_id field"))),
    };
    let attempt_hint = map.get("attempt").and_then(|s| s.parse::<u32>().ok()).unwrap_or(0);

    Ok((id, QueuedMessage::new(job_id, attempt_hint)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_a_well_formed_entry() {
        let job_id = JobId::new();
        let entry = redis::Value::Bulk(vec![
            data("1700000000000-0"),
            redis::Value::Bulk(vec![data("job_id"), data(&job_id.to_string()), data("attempt"), data("2")]),
        ]);

        let (id, message) = parse_stream_entry(entry).unwrap();
        assert_eq!(id, "1700000000000-0");
        assert_eq!(message, QueuedMessage::new(job_id, 2));
    }

    #[test]
    fn bad_job_id_keeps_the_entry_id_for_quarantine() {
        let entry = redis::Value::Bulk(vec![
            data("1-0"),
            redis::Value::Bulk(vec![data("job_id"), data("not-a-uuid")]),
        ]);

        let (id, err) = parse_stream_entry(entry).unwrap_err();
        assert_eq!(id.as_deref(), Some("1-0"));
        assert!(matches!(err, BrokerError::Codec(_)));
    }

    #[test]
    fn missing_attempt_defaults_to_zero() {
        let job_id = JobId::new();
        let entry = redis::Value::Bulk(vec![
            data("2-0"),
            redis::Value::Bulk(vec![data("job_id"), data(&job_id.to_string())]),
        ]);
        assert_eq!(parse_stream_entry(entry).unwrap().1.attempt_hint, 0);
    }

    /// Live broker round trip; run with `RUN_EXTERNAL_TESTS=1 REDIS_URL=...`.
    #[tokio::test]
    async fn live_publish_consume_ack() {
        if std::env::var("RUN_EXTERNAL_TESTS").ok().as_deref() != Some("1") {
            return;
        }
        let Ok(url) = std::env::var("REDIS_URL") else { return };

        let stream = format!("docflow:test:{}", uuid::Uuid::now_v7());
        let broker = RedisStreamsBroker::open(RedisStreamsConfig::new(url).with_stream(stream))
            .await
            .unwrap();

        let message = QueuedMessage::new(JobId::new(), 0);
        broker.publish(message).await.unwrap();

        let mut deliveries = broker.consume("test-consumer").await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(5), deliveries.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery.message, message);
        broker.ack(&delivery.handle).await.unwrap();
        broker.close().await;
    }
}
