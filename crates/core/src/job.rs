//! The job record and its state machine.
//!
//! ## State machine
//!
//! ```text
//! Pending ──► Queued ──► Running ──► Succeeded
//!               ▲          │ ├────► Failed
//!               └──────────┘ └────► DeadLettered
//! ```
//!
//! `Succeeded`, `Failed` and `DeadLettered` are terminal. Every change goes
//! through [`Job::transition`], which is a compare-and-set: it only applies
//! when the current status is in the caller's expected set (and, optionally,
//! the attempt count matches). Stores call it under their own atomicity
//! boundary, so the check and the write cannot interleave with another worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{BlobRef, JobId, Owner};

/// Job lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Row created, message not yet durably published.
    Pending,
    /// Message published, waiting for a worker.
    Queued,
    /// Claimed by exactly one worker.
    Running,
    Succeeded,
    Failed,
    /// Attempt budget exhausted.
    DeadLettered,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::DeadLettered,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::DeadLettered
        )
    }

    /// Whether `self -> to` is an edge of the state machine.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Queued, Running)
                | (Running, Succeeded)
                | (Running, Queued)
                | (Running, Failed)
                | (Running, DeadLettered)
        )
    }

    /// Stable storage name (`snake_case`).
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// Category of a recorded job failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    MalformedInput,
    UnsupportedFormat,
    InputTooLarge,
    /// The engine explicitly refused the document.
    EngineRejected,
    /// Retries ran out (transient failures or abandoned claims).
    AttemptsExhausted,
}

/// Structured error stored on `Failed` / `DeadLettered` jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl core::fmt::Display for JobError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Field changes carried by a transition.
///
/// The target status decides which fields must be present; see
/// [`JobUpdate::validate_for`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobUpdate {
    /// Only apply if the stored `attempt_count` equals this value.
    pub expect_attempt: Option<u32>,
    /// Count this transition as a new delivery (claims only).
    pub increment_attempt: bool,
    pub output_ref: Option<BlobRef>,
    pub last_error: Option<JobError>,
}

impl JobUpdate {
    /// Plain status change with no field updates.
    pub fn none() -> Self {
        Self::default()
    }

    /// `Queued -> Running`.
    pub fn claim() -> Self {
        Self {
            increment_attempt: true,
            ..Self::default()
        }
    }

    /// `Running -> Succeeded`.
    pub fn succeeded(output_ref: BlobRef) -> Self {
        Self {
            output_ref: Some(output_ref),
            ..Self::default()
        }
    }

    /// `Running -> Failed | DeadLettered`.
    pub fn errored(error: JobError) -> Self {
        Self {
            last_error: Some(error),
            ..Self::default()
        }
    }

    pub fn expecting_attempt(mut self, attempt: u32) -> Self {
        self.expect_attempt = Some(attempt);
        self
    }

    /// Check the field invariants for the given target status.
    ///
    /// - `output_ref` is present iff the target is `Succeeded`
    /// - `last_error` is present iff the target is `Failed` or `DeadLettered`
    /// - `increment_attempt` is set iff the target is `Running`
    pub fn validate_for(&self, to: JobStatus) -> DomainResult<()> {
        let wants_output = to == JobStatus::Succeeded;
        let wants_error = matches!(to, JobStatus::Failed | JobStatus::DeadLettered);
        let wants_increment = to == JobStatus::Running;

        if self.output_ref.is_some() != wants_output {
            return Err(DomainError::validation(format!(
                "output_ref must {}be set when moving to {to}",
                if wants_output { "" } else { "not " }
            )));
        }
        if self.last_error.is_some() != wants_error {
            return Err(DomainError::validation(format!(
                "last_error must {}be set when moving to {to}",
                if wants_error { "" } else { "not " }
            )));
        }
        if self.increment_attempt != wants_increment {
            return Err(DomainError::validation(format!(
                "attempt_count may only advance when moving to running (target: {to})"
            )));
        }
        Ok(())
    }
}

/// Check that every `from -> to` pair is an edge and the update fits `to`.
///
/// Pure function of the request, so stores can run it before touching storage.
pub fn validate_transition(from: &[JobStatus], to: JobStatus, update: &JobUpdate) -> DomainResult<()> {
    if from.is_empty() {
        return Err(DomainError::validation("from-status set must not be empty"));
    }
    if let Some(bad) = from.iter().find(|s| !s.can_transition_to(to)) {
        return Err(DomainError::InvalidTransition { from: *bad, to });
    }
    update.validate_for(to)
}

/// Terminal result, as reported to the requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded { output_ref: BlobRef },
    Failed { error: JobError },
    DeadLettered { error: JobError },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::DeadLettered { .. } => JobStatus::DeadLettered,
        }
    }
}

/// One unit of document-processing work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner: Owner,
    pub status: JobStatus,
    /// Number of claims so far. Never decreases.
    pub attempt_count: u32,
    pub input_ref: Option<BlobRef>,
    pub output_ref: Option<BlobRef>,
    pub last_error: Option<JobError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new `Pending` job.
    pub fn new(id: JobId, owner: Owner, input_ref: BlobRef, now: DateTime<Utc>) -> Self {
        Self {
            id,
            owner,
            status: JobStatus::Pending,
            attempt_count: 0,
            input_ref: Some(input_ref),
            output_ref: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Compare-and-set transition.
    ///
    /// Fails with `InvalidTransition` when the request names an edge the state
    /// machine does not have (a caller bug), and with `Conflict` when the
    /// stored status or attempt count does not match (a lost race). The job is
    /// left untouched on error.
    pub fn transition(
        &mut self,
        from: &[JobStatus],
        to: JobStatus,
        update: JobUpdate,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        validate_transition(from, to, &update)?;

        if !from.contains(&self.status) {
            return Err(DomainError::conflict(format!(
                "job {} is {}, expected one of {:?}",
                self.id, self.status, from
            )));
        }
        if let Some(expected) = update.expect_attempt {
            if expected != self.attempt_count {
                return Err(DomainError::conflict(format!(
                    "job {} is at attempt {}, expected {}",
                    self.id, self.attempt_count, expected
                )));
            }
        }

        self.status = to;
        if update.increment_attempt {
            self.attempt_count += 1;
        }
        self.output_ref = update.output_ref;
        self.last_error = update.last_error;
        self.updated_at = now.max(self.updated_at);
        self.completed_at = to.is_terminal().then_some(self.updated_at);
        Ok(())
    }

    /// Terminal outcome, or `None` while the job is still in flight.
    pub fn outcome(&self) -> Option<JobOutcome> {
        match (self.status, &self.output_ref, &self.last_error) {
            (JobStatus::Succeeded, Some(output_ref), _) => Some(JobOutcome::Succeeded {
                output_ref: output_ref.clone(),
            }),
            (JobStatus::Failed, _, Some(error)) => Some(JobOutcome::Failed {
                error: error.clone(),
            }),
            (JobStatus::DeadLettered, _, Some(error)) => Some(JobOutcome::DeadLettered {
                error: error.clone(),
            }),
            _ => None,
        }
    }

    /// Refresh `updated_at` for the holder of claim `attempt`.
    ///
    /// Conflicts once the job has left `Running` or been claimed again.
    pub fn renew_claim(&mut self, attempt: u32, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Running || self.attempt_count != attempt {
            return Err(DomainError::conflict(format!(
                "job {} is {} at attempt {}, claim {} is gone",
                self.id, self.status, self.attempt_count, attempt
            )));
        }
        self.updated_at = now.max(self.updated_at);
        Ok(())
    }

    /// `Running` with no progress for at least `lease`.
    pub fn claim_expired(&self, lease: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Running && now - self.updated_at >= lease
    }
}
