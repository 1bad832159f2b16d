use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::instrument;

use super::{Notification, NotificationSender, NotifyError};

/// POSTs the notification as JSON to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    client: Client,
    url: String,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Transport(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    #[instrument(skip(self, notification), fields(job_id = %notification.job_id), err)]
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header("X-Docflow-Event", "job.completed")
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(response.status().as_u16()))
        }
    }
}
