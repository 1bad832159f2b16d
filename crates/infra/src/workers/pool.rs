use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use docflow_core::RetryPolicy;

use super::worker::Worker;
use crate::blob::{BlobResolver, BlobStore};
use crate::broker::Broker;
use crate::extraction::ExtractionClient;
use crate::jobs::JobStore;
use crate::notifier::Notifier;

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers; bounds concurrent engine calls.
    pub workers: usize,
    /// Attempt budget and requeue backoff for transient failures.
    pub retry: RetryPolicy,
    /// Deadline for one extraction call.
    pub extraction_timeout: Duration,
    /// A `Running` job untouched for this long is presumed abandoned.
    /// Workers renew their claim every third of this while a job runs.
    pub claim_lease: Duration,
    /// Pause before giving back a delivery that could not be processed yet
    /// (job still `Pending`, store unavailable).
    pub requeue_delay: Duration,
    /// Backoff between resubscribe attempts after a lost subscription.
    pub resubscribe: RetryPolicy,
    /// Prefix for consumer names and logs.
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetryPolicy::default(),
            extraction_timeout: Duration::from_secs(60),
            claim_lease: Duration::from_secs(300),
            requeue_delay: Duration::from_secs(1),
            resubscribe: RetryPolicy::exponential(u32::MAX, Duration::from_millis(100), Duration::from_secs(30)),
            name: "worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Renewal period for a held claim.
    pub(super) fn renew_every(&self) -> Duration {
        (self.claim_lease / 3).max(MIN_RENEW_INTERVAL)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_extraction_timeout(mut self, timeout: Duration) -> Self {
        self.extraction_timeout = timeout;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn with_resubscribe(mut self, policy: RetryPolicy) -> Self {
        self.resubscribe = policy;
        self
    }
}

/// Pool runtime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub deliveries: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    /// Duplicate or stale deliveries dropped without processing.
    pub discarded: u64,
    pub in_flight: usize,
}

pub(crate) type SharedStats = Arc<Mutex<PoolStats>>;

pub(crate) fn update_stats(stats: &SharedStats, f: impl FnOnce(&mut PoolStats)) {
    f(&mut stats.lock().unwrap_or_else(PoisonError::into_inner));
}

/// Collaborators every worker needs.
#[derive(Clone)]
pub struct WorkerPool {
    pub(super) store: Arc<dyn JobStore>,
    pub(super) broker: Arc<dyn Broker>,
    pub(super) blobs: Arc<dyn BlobStore>,
    pub(super) resolver: BlobResolver,
    pub(super) extraction: ExtractionClient,
    pub(super) notifier: Notifier,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        blobs: Arc<dyn BlobStore>,
        resolver: BlobResolver,
        extraction: ExtractionClient,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            broker,
            blobs,
            resolver,
            extraction,
            notifier,
        }
    }

    /// Start `config.workers` workers on the current runtime.
    pub fn spawn(self, config: WorkerPoolConfig) -> WorkerPoolHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort_tx, abort_rx) = watch::channel(false);
        let stats: SharedStats = Arc::new(Mutex::new(PoolStats::default()));
        let config = Arc::new(config);
        if config.claim_lease <= config.extraction_timeout {
            warn!(
                pool = %config.name,
                lease_ms = config.claim_lease.as_millis() as u64,
                timeout_ms = config.extraction_timeout.as_millis() as u64,
                "claim lease does not outlast one extraction; only renewals keep claims alive"
            );
        }

        let mut workers = JoinSet::new();
        for i in 0..config.workers.max(1) {
            let worker = Worker::new(
                format!("{}-{}", config.name, i),
                self.clone(),
                config.clone(),
                stats.clone(),
                shutdown_rx.clone(),
                abort_rx.clone(),
            );
            workers.spawn(worker.run());
        }
        info!(pool = %config.name, workers = config.workers.max(1), "worker pool started");

        WorkerPoolHandle {
            name: config.name.clone(),
            shutdown: shutdown_tx,
            abort: abort_tx,
            workers,
            broker: self.broker,
            stats,
        }
    }
}

/// Handle to observe and stop a running pool.
pub struct WorkerPoolHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    abort: watch::Sender<bool>,
    workers: JoinSet<()>,
    broker: Arc<dyn Broker>,
    stats: SharedStats,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Stop taking deliveries and wait up to `grace` for in-flight jobs.
    ///
    /// Jobs still running at the deadline have their extraction cancelled,
    /// their claim released back to `Queued` and their delivery requeued.
    /// The broker is closed last.
    pub async fn shutdown(mut self, grace: Duration) {
        info!(pool = %self.name, grace_ms = grace.as_millis() as u64, "worker pool shutting down");
        let _ = self.shutdown.send(true);

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = workers.join_next().await {
                log_join(joined);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(pool = %self.name, in_flight = self.stats().in_flight, "grace period elapsed, aborting in-flight jobs");
            let _ = self.abort.send(true);
            while let Some(joined) = self.workers.join_next().await {
                log_join(joined);
            }
        }

        self.broker.close().await;
        info!(pool = %self.name, stats = ?self.stats(), "worker pool stopped");
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "worker task failed");
    }
}
