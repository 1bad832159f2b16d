//! Worker Pool: a fixed number of consumers that claim, extract, complete
//! and notify.
//!
//! Workers share nothing but the Job Store. Every state change goes through
//! a compare-and-set transition, so duplicate deliveries are resolved by
//! whoever loses the race discarding its copy.

mod pool;
mod worker;

pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
