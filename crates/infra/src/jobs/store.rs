//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docflow_core::{DomainError, Job, JobId, JobStatus, JobUpdate};

/// Durable record of job state.
///
/// `transition` is the only way to change a stored job and is the single
/// concurrency-control primitive of the pipeline: it is an atomic
/// compare-and-set on `status` (and optionally `attempt_count`). Callers need
/// no external locking.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. The job must be `Pending`.
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Job, JobStoreError>;

    /// Move `id` to `to` if its current status is in `from`.
    ///
    /// Returns the updated job. Fails with `Conflict` when the stored status
    /// (or attempt count, see [`JobUpdate::expect_attempt`]) does not match,
    /// and with `InvalidTransition` when the request names an edge the state
    /// machine does not have. Updates `updated_at`.
    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, JobStoreError>;

    /// Touch `updated_at` on a `Running` job still held by claim `attempt`,
    /// so the claim lease does not run out under a live worker.
    ///
    /// Fails with `Conflict` once the job has moved on.
    async fn renew_claim(&self, id: JobId, attempt: u32) -> Result<Job, JobStoreError>;

    /// Jobs in `status` whose `updated_at` is older than `updated_before`,
    /// oldest first.
    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Count jobs per status.
    async fn count_by_status(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// Lost a compare-and-set race: the job moved on under us.
    #[error("conflict on job {id}: currently {current}, attempted {attempted}")]
    Conflict {
        id: JobId,
        current: JobStatus,
        attempted: JobStatus,
    },
    /// The requested edge is not part of the state machine. A caller bug; never retry.
    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("invalid job update: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    /// Both flavours of "ConflictError": a lost race or an illegal edge.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            JobStoreError::Conflict { .. } | JobStoreError::InvalidTransition { .. }
        )
    }

    pub(crate) fn from_domain(id: JobId, current: JobStatus, attempted: JobStatus, err: DomainError) -> Self {
        match err {
            DomainError::InvalidTransition { from, to } => JobStoreError::InvalidTransition { from, to },
            DomainError::Conflict(_) => JobStoreError::Conflict { id, current, attempted },
            DomainError::NotFound => JobStoreError::NotFound(id),
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => JobStoreError::Invalid(msg),
        }
    }
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl JobStats {
    pub(crate) fn add(&mut self, status: JobStatus, count: u64) {
        let slot = match status {
            JobStatus::Pending => &mut self.pending,
            JobStatus::Queued => &mut self.queued,
            JobStatus::Running => &mut self.running,
            JobStatus::Succeeded => &mut self.succeeded,
            JobStatus::Failed => &mut self.failed,
            JobStatus::DeadLettered => &mut self.dead_lettered,
        };
        *slot += count;
    }
}

/// In-memory job store for tests/dev.
///
/// A single write lock covers check-and-apply, which is what makes
/// `transition` atomic here.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a job as-is, bypassing the state machine.
    ///
    /// Test hook for staging states such as a claim that went stale.
    #[cfg(test)]
    pub(crate) fn put_raw(&self, job: Job) {
        self.jobs.write().unwrap().insert(job.id, job);
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        if job.status != JobStatus::Pending {
            return Err(JobStoreError::Invalid(format!(
                "new jobs must be pending, got {}",
                job.status
            )));
        }
        let mut jobs = self.jobs.write().unwrap();
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Job, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        jobs.get(&id).cloned().ok_or(JobStoreError::NotFound(id))
    }

    async fn transition(
        &self,
        id: JobId,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
    ) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let current = job.status;

        job.transition(from, to, update, Utc::now())
            .map_err(|e| JobStoreError::from_domain(id, current, to, e))?;

        Ok(job.clone())
    }

    async fn renew_claim(&self, id: JobId, attempt: u32) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap();
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        let current = job.status;

        job.renew_claim(attempt, Utc::now())
            .map_err(|e| JobStoreError::from_domain(id, current, JobStatus::Running, e))?;

        Ok(job.clone())
    }

    async fn list_stale(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status && j.updated_at <= updated_before)
            .cloned()
            .collect();

        result.sort_by_key(|j| j.updated_at);
        result.truncate(limit);
        Ok(result)
    }

    async fn count_by_status(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.jobs.read().unwrap();
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.add(job.status, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use docflow_core::{BlobRef, ErrorKind, JobError, Owner};

    fn new_job() -> Job {
        Job::new(
            JobId::new(),
            Owner::new("owner").unwrap(),
            BlobRef::new("sha256/abc").unwrap(),
            Utc::now(),
        )
    }

    async fn queued(store: &InMemoryJobStore) -> JobId {
        let id = store.create(new_job()).await.unwrap();
        store
            .transition(id, &[JobStatus::Pending], JobStatus::Queued, JobUpdate::none())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryJobStore::new();
        let job = new_job();
        let id = store.create(job.clone()).await.unwrap();

        assert_eq!(store.get(id).await.unwrap(), job);
        assert_eq!(store.create(job).await, Err(JobStoreError::AlreadyExists(id)));
    }

    #[tokio::test]
    async fn create_rejects_non_pending_jobs() {
        let store = InMemoryJobStore::new();
        let mut job = new_job();
        job.status = JobStatus::Queued;
        assert!(matches!(store.create(job).await, Err(JobStoreError::Invalid(_))));
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert_eq!(store.get(id).await, Err(JobStoreError::NotFound(id)));
        assert_eq!(
            store
                .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
                .await,
            Err(JobStoreError::NotFound(id))
        );
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let store = InMemoryJobStore::new();
        let id = queued(&store).await;

        let claimed = store
            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempt_count, 1);

        let second = store
            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
            .unwrap_err();
        assert!(matches!(
            second,
            JobStoreError::Conflict { current: JobStatus::Running, .. }
        ));
        assert_eq!(store.get(id).await.unwrap().attempt_count, 1);
    }

    #[tokio::test]
    async fn terminal_jobs_reject_every_transition() {
        let store = InMemoryJobStore::new();
        let id = queued(&store).await;
        store
            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
            .unwrap();
        store
            .transition(
                id,
                &[JobStatus::Running],
                JobStatus::Failed,
                JobUpdate::errored(JobError::new(ErrorKind::UnsupportedFormat, "docx")),
            )
            .await
            .unwrap();

        let err = store
            .transition(id, &[JobStatus::Failed], JobStatus::Queued, JobUpdate::none())
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));

        let err = store
            .transition(id, &[JobStatus::Running], JobStatus::Queued, JobUpdate::none())
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { current: JobStatus::Failed, .. }));
    }

    #[tokio::test]
    async fn renewal_keeps_a_live_claim_off_the_stale_list() {
        let store = InMemoryJobStore::new();
        let id = queued(&store).await;
        let claimed = store
            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
            .unwrap();

        let mut aged = claimed.clone();
        aged.updated_at -= chrono::Duration::minutes(10);
        store.put_raw(aged);
        let cutoff = Utc::now() - chrono::Duration::minutes(5);
        assert_eq!(store.list_stale(JobStatus::Running, cutoff, 10).await.unwrap().len(), 1);

        store.renew_claim(id, 1).await.unwrap();
        assert!(store.list_stale(JobStatus::Running, cutoff, 10).await.unwrap().is_empty());

        let err = store.renew_claim(id, 2).await.unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict { current: JobStatus::Running, .. }));
    }

    #[tokio::test]
    async fn list_stale_filters_by_status_and_age() {
        let store = InMemoryJobStore::new();
        let pending = store.create(new_job()).await.unwrap();
        let _queued = queued(&store).await;

        let later = Utc::now() + chrono::Duration::seconds(1);
        let stale = store.list_stale(JobStatus::Pending, later, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, pending);

        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert!(store.list_stale(JobStatus::Pending, earlier, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.create(new_job()).await.unwrap();
        }
        let id = queued(&store).await;
        store
            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
            .await
            .unwrap();

        let stats = store.count_by_status().await.unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 0);
    }

    /// Two simulated workers race the same claim; exactly one may win.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_have_exactly_one_winner() {
        for _ in 0..200 {
            let store = Arc::new(InMemoryJobStore::new());
            let id = queued(&store).await;

            let racers: Vec<_> = (0..2)
                .map(|_| {
                    let store = store.clone();
                    tokio::spawn(async move {
                        store
                            .transition(id, &[JobStatus::Queued], JobStatus::Running, JobUpdate::claim())
                            .await
                    })
                })
                .collect();

            let mut wins = 0;
            for racer in racers {
                match racer.await.unwrap() {
                    Ok(_) => wins += 1,
                    Err(e) => assert!(e.is_conflict()),
                }
            }

            assert_eq!(wins, 1);
            assert_eq!(store.get(id).await.unwrap().attempt_count, 1);
        }
    }
}
