//! Job Store, submission and recovery.

pub mod postgres;
mod release;
mod service;
mod store;

pub use postgres::PostgresJobStore;
pub use release::{release_claim, Released};
pub use service::{JobService, RecoveryReport, SubmitError};
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError};
