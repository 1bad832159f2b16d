//! Infrastructure wiring: picks in-memory or external adapters from
//! [`Settings`] and assembles the job service and worker pool over them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use docflow_infra::blob::{BlobResolver, BlobStore, FsBlobStore, InMemoryBlobStore};
use docflow_infra::broker::{Broker, InMemoryBroker, RedisStreamsBroker, RedisStreamsConfig};
use docflow_infra::config::Settings;
use docflow_infra::extraction::{
    ExtractionClient, ExtractionEngine, ExtractionLimits, OpenAiConfig, OpenAiEngine,
};
use docflow_infra::jobs::{InMemoryJobStore, JobService, JobStore, PostgresJobStore};
use docflow_infra::notifier::{Notifier, WebhookSender};
use docflow_infra::workers::{WorkerPool, WorkerPoolConfig};

const DB_MAX_CONNECTIONS: u32 = 10;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);
const NOTIFY_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Everything the binary runs: the submission side and the worker side,
/// sharing one store, broker and blob store.
#[derive(Clone)]
pub struct AppServices {
    pub jobs: JobService,
    pub pool: WorkerPool,
    pub pool_config: WorkerPoolConfig,
    pub limits: ExtractionLimits,
}

impl AppServices {
    /// All in-process adapters. Used by tests and local runs.
    pub fn in_memory(engine: Arc<dyn ExtractionEngine>, pool_config: WorkerPoolConfig) -> Self {
        assemble(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryBlobStore::new()),
            engine,
            Notifier::log_only(),
            ExtractionLimits::default(),
            pool_config,
        )
    }

    pub async fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let store: Arc<dyn JobStore> = match &settings.database_url {
            Some(url) => {
                let store = PostgresJobStore::connect(url, DB_MAX_CONNECTIONS)
                    .await
                    .context("connecting to Postgres")?;
                store.ensure_schema().await.context("creating jobs schema")?;
                info!("job store: postgres");
                Arc::new(store)
            }
            None => {
                warn!("DATABASE_URL not set; jobs are kept in memory and lost on restart");
                Arc::new(InMemoryJobStore::new())
            }
        };

        let broker: Arc<dyn Broker> = match &settings.broker.redis_url {
            Some(url) => {
                let config = RedisStreamsConfig::new(url.clone())
                    .with_stream(settings.broker.stream.clone())
                    .with_group(settings.broker.group.clone())
                    .with_visibility_timeout(settings.broker.visibility_timeout);
                let broker = RedisStreamsBroker::open(config).await.context("connecting to Redis")?;
                info!(stream = %settings.broker.stream, group = %settings.broker.group, "broker: redis streams");
                Arc::new(broker)
            }
            None => {
                warn!("REDIS_URL not set; using the in-memory broker");
                Arc::new(InMemoryBroker::new())
            }
        };

        let blobs = Arc::new(FsBlobStore::new(settings.blob_dir.clone()));

        let engine = OpenAiEngine::new(OpenAiConfig {
            base_url: settings.extraction.base_url.clone(),
            api_key: settings.extraction.api_key.clone(),
            model: settings.extraction.model.clone(),
            request_timeout: settings.extraction.timeout,
        })
        .context("building extraction engine client")?;

        let notifier = match &settings.notify.webhook_url {
            Some(url) => {
                let sender = WebhookSender::new(url.clone(), WEBHOOK_TIMEOUT).context("building webhook sender")?;
                Notifier::new(Arc::new(sender), settings.notify.max_attempts, NOTIFY_RETRY_DELAY)
            }
            None => Notifier::log_only(),
        };

        let pool_config = WorkerPoolConfig::default()
            .with_workers(settings.workers.count)
            .with_retry(settings.workers.retry.clone())
            .with_claim_lease(settings.workers.claim_lease)
            .with_extraction_timeout(settings.extraction.timeout);

        Ok(assemble(
            store,
            broker,
            blobs,
            Arc::new(engine),
            notifier,
            ExtractionLimits {
                max_input_bytes: settings.extraction.max_input_bytes,
            },
            pool_config,
        ))
    }
}

fn assemble(
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    blobs: Arc<dyn BlobStore>,
    engine: Arc<dyn ExtractionEngine>,
    notifier: Notifier,
    limits: ExtractionLimits,
    pool_config: WorkerPoolConfig,
) -> AppServices {
    let resolver = BlobResolver::default();
    let jobs = JobService::new(
        store.clone(),
        broker.clone(),
        blobs.clone(),
        resolver.clone(),
        pool_config.retry.clone(),
        notifier.clone(),
    );
    let extraction = ExtractionClient::new(engine, blobs.clone(), limits);
    let pool = WorkerPool::new(store, broker, blobs, resolver, extraction, notifier);

    AppServices {
        jobs,
        pool,
        pool_config,
        limits,
    }
}
