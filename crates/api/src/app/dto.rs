use chrono::{DateTime, Utc};
use serde::Serialize;

use docflow_core::{BlobRef, Job, JobError, JobId, JobStatus};
use docflow_infra::jobs::JobStats;

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub id: JobId,
    pub status: JobStatus,
}

/// Status projection of a job as seen by its owner.
#[derive(Debug, Serialize)]
pub struct JobResponse {
    pub id: JobId,
    pub status: JobStatus,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_ref: Option<BlobRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            attempt_count: job.attempt_count,
            output_ref: job.output_ref,
            error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub jobs: JobStats,
}
