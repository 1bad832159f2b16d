//! Best-effort completion notifications.
//!
//! A job is already terminal in the store before anyone is notified, so a
//! failed notification is logged and dropped; it never touches job state.

mod webhook;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, warn};

use docflow_core::{JobId, JobOutcome, Owner};

pub use webhook::WebhookSender;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("notification transport error: {0}")]
    Transport(String),
    #[error("notification rejected with status {0}")]
    Rejected(u16),
}

/// What the requester is told about a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub owner: Owner,
    pub job_id: JobId,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

/// Delivery channel (webhook, log, ...).
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes the notification to the log and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            owner = %notification.owner,
            job_id = %notification.job_id,
            status = %notification.outcome.status(),
            "job finished"
        );
        Ok(())
    }
}

/// Retries a [`NotificationSender`] a small fixed number of times.
#[derive(Clone)]
pub struct Notifier {
    sender: Arc<dyn NotificationSender>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl Notifier {
    pub fn new(sender: Arc<dyn NotificationSender>, max_attempts: u32, retry_delay: Duration) -> Self {
        Self {
            sender,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    /// Log-only notifier.
    pub fn log_only() -> Self {
        Self::new(Arc::new(LogSender), 1, Duration::ZERO)
    }

    /// Deliver, best effort. Returns whether delivery succeeded; callers
    /// are free to ignore it.
    pub async fn notify(&self, owner: &Owner, job_id: JobId, outcome: JobOutcome) -> bool {
        let notification = Notification {
            owner: owner.clone(),
            job_id,
            outcome,
        };

        for attempt in 1..=self.max_attempts {
            match self.sender.send(&notification).await {
                Ok(()) => {
                    debug!(job_id = %job_id, attempt, "notification delivered");
                    return true;
                }
                Err(e) if attempt < self.max_attempts => {
                    debug!(job_id = %job_id, attempt, error = %e, "notification failed, retrying");
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => {
                    warn!(job_id = %job_id, attempts = attempt, error = %e, "notification dropped");
                }
            }
        }
        false
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every notification; fails the first `failures` sends.
    #[derive(Default)]
    pub struct RecordingSender {
        pub sent: Mutex<Vec<Notification>>,
        pub calls: Mutex<u32>,
        pub failures: u32,
    }

    impl RecordingSender {
        pub fn failing(failures: u32) -> Self {
            Self {
                failures,
                ..Self::default()
            }
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NotificationSender for RecordingSender {
        async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls <= self.failures {
                return Err(NotifyError::Transport("simulated outage".to_string()));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }
}
