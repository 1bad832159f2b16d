//! Submission, status query and the recovery sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use docflow_core::{Job, JobId, JobStatus, JobUpdate, Owner, RetryPolicy};

use super::release::{release_claim, Released};
use super::store::{JobStore, JobStoreError};
use crate::blob::{BlobError, BlobResolver, BlobStore};
use crate::broker::{Broker, BrokerError, QueuedMessage};
use crate::notifier::Notifier;

/// Jobs looked at per status per sweep.
const RECOVERY_BATCH: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("storing input failed: {0}")]
    Blob(#[from] BlobError),
    #[error("creating job failed: {0}")]
    Store(#[from] JobStoreError),
    /// The row exists and stays `Pending`; the recovery sweep republishes it.
    #[error("job {job_id} created but not queued: {source}")]
    Publish {
        job_id: JobId,
        #[source]
        source: BrokerError,
    },
}

/// What one recovery sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    /// Stale `Pending` jobs published and queued.
    pub republished: usize,
    /// Stale `Queued` jobs whose message was published again.
    pub requeued_messages: usize,
    /// Abandoned `Running` claims given back to the queue.
    pub released: usize,
    /// Abandoned `Running` claims that had no attempts left.
    pub dead_lettered: usize,
}

/// Entry points the API layer drives.
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn Broker>,
    blobs: Arc<dyn BlobStore>,
    resolver: BlobResolver,
    retry: RetryPolicy,
    notifier: Notifier,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn Broker>,
        blobs: Arc<dyn BlobStore>,
        resolver: BlobResolver,
        retry: RetryPolicy,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            broker,
            blobs,
            resolver,
            retry,
            notifier,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Store the input, create the job and queue it.
    ///
    /// The row is created `Pending` before anything is published, so a worker
    /// can never see a message for a job that does not exist. If publishing
    /// fails the job stays `Pending` and `SubmitError::Publish` carries its id.
    #[instrument(skip(self, input), fields(owner = %owner, len = input.len()), err)]
    pub async fn submit(&self, owner: Owner, input: Vec<u8>) -> Result<Job, SubmitError> {
        let id = JobId::new();
        let input_ref = self.resolver.input_for(id)?;
        self.blobs.put_at(&input_ref, input).await?;

        let job = Job::new(id, owner, input_ref, Utc::now());
        self.store.create(job.clone()).await?;

        if let Err(source) = self.broker.publish(QueuedMessage::new(id, 0)).await {
            warn!(job_id = %id, error = %source, "publish failed, job left pending");
            return Err(SubmitError::Publish { job_id: id, source });
        }

        match self
            .store
            .transition(id, &[JobStatus::Pending], JobStatus::Queued, JobUpdate::none())
            .await
        {
            Ok(queued) => {
                info!(job_id = %id, "job submitted");
                Ok(queued)
            }
            // Recovery got there first; the job is queued either way.
            Err(e) if e.is_conflict() => Ok(self.store.get(id).await?),
            Err(e) => {
                // Published but not marked queued: the sweep finishes the move.
                error!(job_id = %id, error = %e, "failed to mark job queued");
                Ok(job)
            }
        }
    }

    /// Read-only projection of a job.
    pub async fn get_status(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.store.get(id).await
    }

    /// One recovery pass.
    ///
    /// - `Pending` older than `pending_after`: see
    ///   [`JobService::recover_stale_pending`].
    /// - `Queued` older than `claim_lease`: its message may have been lost
    ///   between a requeue and the broker; publish again (duplicates are
    ///   harmless, claims are compare-and-set).
    /// - `Running` older than `claim_lease`: the claimant is presumed dead;
    ///   release the claim and publish.
    #[instrument(skip(self), err)]
    pub async fn recover(
        &self,
        pending_after: Duration,
        claim_lease: Duration,
    ) -> Result<RecoveryReport, JobStoreError> {
        let lease_cutoff = cutoff(Utc::now(), claim_lease);
        let mut report = RecoveryReport {
            republished: self.recover_stale_pending(pending_after).await?,
            ..RecoveryReport::default()
        };

        for job in self
            .store
            .list_stale(JobStatus::Queued, lease_cutoff, RECOVERY_BATCH)
            .await?
        {
            if self.publish(&job).await {
                report.requeued_messages += 1;
            }
        }

        for job in self
            .store
            .list_stale(JobStatus::Running, lease_cutoff, RECOVERY_BATCH)
            .await?
        {
            match release_claim(self.store.as_ref(), &job, &self.retry, "claim lease expired").await {
                Ok(Released::Requeued(queued)) => {
                    report.released += 1;
                    self.publish(&queued).await;
                }
                Ok(Released::DeadLettered(dead)) => {
                    report.dead_lettered += 1;
                    if let Some(outcome) = dead.outcome() {
                        self.notifier.notify(&dead.owner, dead.id, outcome).await;
                    }
                }
                Err(e) if e.is_conflict() => debug!(job_id = %job.id, "claim moved on during recovery"),
                Err(e) => error!(job_id = %job.id, error = %e, "failed to release abandoned claim"),
            }
        }

        if report != RecoveryReport::default() {
            info!(?report, "recovery sweep");
        }
        Ok(report)
    }

    /// Publish every `Pending` job older than `older_than` and move it to
    /// `Queued`. Returns how many were queued.
    ///
    /// A job that was never `Queued` cannot be held by a worker, so
    /// publishing it again can at worst produce a duplicate delivery.
    pub async fn recover_stale_pending(&self, older_than: Duration) -> Result<usize, JobStoreError> {
        let mut queued = 0;
        for job in self
            .store
            .list_stale(JobStatus::Pending, cutoff(Utc::now(), older_than), RECOVERY_BATCH)
            .await?
        {
            if !self.publish(&job).await {
                continue;
            }
            match self
                .store
                .transition(job.id, &[JobStatus::Pending], JobStatus::Queued, JobUpdate::none())
                .await
            {
                Ok(_) => queued += 1,
                Err(e) if e.is_conflict() => debug!(job_id = %job.id, "pending job moved on during recovery"),
                Err(e) => error!(job_id = %job.id, error = %e, "failed to queue recovered job"),
            }
        }
        Ok(queued)
    }

    /// Run [`JobService::recover`] every `interval` until `shutdown` flips.
    pub async fn run_recovery(
        self,
        interval: Duration,
        pending_after: Duration,
        claim_lease: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.recover(pending_after, claim_lease).await {
                error!(error = %e, "recovery sweep failed");
            }
        }
        debug!("recovery loop stopped");
    }

    async fn publish(&self, job: &Job) -> bool {
        match self.broker.publish(QueuedMessage::new(job.id, job.attempt_count)).await {
            Ok(_) => true,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "republish failed");
                false
            }
        }
    }
}

/// `now - age`, saturating at the earliest representable time.
fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::InMemoryBlobStore;
    use crate::broker::InMemoryBroker;
    use crate::jobs::InMemoryJobStore;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        broker: Arc<InMemoryBroker>,
        blobs: Arc<InMemoryBlobStore>,
        service: JobService,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryJobStore::new());
        let broker = Arc::new(InMemoryBroker::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let service = JobService::new(
            store.clone(),
            broker.clone(),
            blobs.clone(),
            BlobResolver::default(),
            RetryPolicy::exponential(2, Duration::ZERO, Duration::ZERO),
            Notifier::log_only(),
        );
        Fixture {
            store,
            broker,
            blobs,
            service,
        }
    }

    fn owner() -> Owner {
        Owner::new("alice").unwrap()
    }

    #[tokio::test]
    async fn submit_stores_input_and_queues() {
        let f = fixture();
        let job = f.service.submit(owner(), b"doc-42".to_vec()).await.unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        let input = job.input_ref.clone().unwrap();
        assert_eq!(f.blobs.get(&input).await.unwrap(), b"doc-42");
        assert_eq!(f.broker.ready_len(), 1);
        assert_eq!(f.service.get_status(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn failed_publish_leaves_job_pending_until_recovery() {
        let f = fixture();
        f.broker.fail_next_publishes(1);

        let err = f.service.submit(owner(), b"doc".to_vec()).await.unwrap_err();
        let SubmitError::Publish { job_id, .. } = err else {
            panic!("expected publish error, got {err:?}");
        };
        assert_eq!(f.store.get(job_id).await.unwrap().status, JobStatus::Pending);
        assert_eq!(f.broker.ready_len(), 0);

        let report = f.service.recover(Duration::ZERO, Duration::from_secs(300)).await.unwrap();
        assert_eq!(report.republished, 1);
        assert_eq!(f.store.get(job_id).await.unwrap().status, JobStatus::Queued);
        assert_eq!(f.broker.ready_len(), 1);
    }

    #[tokio::test]
    async fn stale_pending_sweep_alone() {
        let f = fixture();
        f.broker.fail_next_publishes(1);
        let _ = f.service.submit(owner(), b"doc".to_vec()).await;

        assert_eq!(f.service.recover_stale_pending(Duration::from_secs(60)).await.unwrap(), 0);
        assert_eq!(f.service.recover_stale_pending(Duration::ZERO).await.unwrap(), 1);
        assert_eq!(f.store.count_by_status().await.unwrap().queued, 1);
    }

    #[tokio::test]
    async fn recovery_leaves_fresh_jobs_alone() {
        let f = fixture();
        f.broker.fail_next_publishes(1);
        let _ = f.service.submit(owner(), b"doc".to_vec()).await;

        let report = f.service.recover(Duration::from_secs(60), Duration::from_secs(300)).await.unwrap();
        assert_eq!(report, RecoveryReport::default());
    }

    #[tokio::test]
    async fn recovery_releases_abandoned_claims() {
        let f = fixture();
        let job = f.service.submit(owner(), b"doc".to_vec()).await.unwrap();
        f.store
            .transition(job.id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
            .unwrap();

        let report = f.service.recover(Duration::from_secs(60), Duration::ZERO).await.unwrap();
        assert_eq!(report.released, 1);
        let job = f.store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
    }

    #[tokio::test]
    async fn recovery_dead_letters_claims_without_budget() {
        let f = fixture();
        let job = f.service.submit(owner(), b"doc".to_vec()).await.unwrap();
        let claim = || {
            f.store
                .transition(job.id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
        };
        claim().await.unwrap();
        f.store
            .transition(job.id, &[JobStatus::Running], JobStatus::Queued, JobUpdate::none())
            .await
            .unwrap();
        claim().await.unwrap();

        let report = f.service.recover(Duration::from_secs(60), Duration::ZERO).await.unwrap();
        assert_eq!(report.dead_lettered, 1);
        let job = f.store.get(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempt_count, 2);
    }
}
