//! `docflow-core`: domain building blocks for the document job pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the job record and its state machine, and retry policy math.

pub mod error;
pub mod id;
pub mod job;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use id::{BlobRef, JobId, Owner};
pub use job::{validate_transition, ErrorKind, Job, JobError, JobOutcome, JobStatus, JobUpdate};
pub use retry::{BackoffStrategy, RetryPolicy};
