//! Infrastructure for the document job pipeline: job persistence, blob
//! storage, the broker adapter, the extraction client, notifications and
//! the worker pool that ties them together.

pub mod blob;
pub mod broker;
pub mod config;
pub mod extraction;
pub mod jobs;
pub mod notifier;
pub mod workers;
