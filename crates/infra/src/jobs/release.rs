//! Giving a `Running` claim back.

use tracing::{info, warn};

use docflow_core::{ErrorKind, Job, JobError, JobStatus, JobUpdate, RetryPolicy};

use super::store::{JobStore, JobStoreError};

/// Where a released job ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// Back to `Queued`; the next claim counts as a new attempt.
    Requeued(Job),
    /// The claim being released was the last allowed attempt.
    DeadLettered(Job),
}

impl Released {
    pub fn job(&self) -> &Job {
        match self {
            Released::Requeued(job) | Released::DeadLettered(job) => job,
        }
    }
}

/// Move `job` out of `Running` without a result.
///
/// Guarded by the observed `attempt_count`, so a claim that has already been
/// released (or re-claimed) by someone else yields `Conflict`. If the attempt
/// budget is spent the job is dead-lettered instead of requeued, which keeps
/// `attempt_count == max_attempts` for every dead-lettered job.
pub async fn release_claim(
    store: &dyn JobStore,
    job: &Job,
    retry: &RetryPolicy,
    reason: &str,
) -> Result<Released, JobStoreError> {
    if retry.is_exhausted(job.attempt_count) {
        let error = JobError::new(
            ErrorKind::AttemptsExhausted,
            format!("gave up after {} attempts: {}", job.attempt_count, reason),
        );
        let dead = store
            .transition(
                job.id,
                &[JobStatus::Running],
                JobStatus::DeadLettered,
                JobUpdate::errored(error).expecting_attempt(job.attempt_count),
            )
            .await?;
        warn!(job_id = %job.id, attempt = job.attempt_count, reason, "job dead-lettered");
        return Ok(Released::DeadLettered(dead));
    }

    let queued = store
        .transition(
            job.id,
            &[JobStatus::Running],
            JobStatus::Queued,
            JobUpdate::none().expecting_attempt(job.attempt_count),
        )
        .await?;
    info!(job_id = %job.id, attempt = job.attempt_count, reason, "job requeued");
    Ok(Released::Requeued(queued))
}
