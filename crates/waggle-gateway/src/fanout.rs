use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

/// Characters of content carried in an offline delivery summary.
const SUMMARY_LEN: usize = 80;

/// Handed to the external notification collaborator when a recipient
/// has no live connection.
#[derive(Debug, Clone, Serialize)]
pub struct OfflineNotification {
    pub user_id: Uuid,
    pub thread_id: Uuid,
    pub sender_id: Uuid,
    pub summary: String,
}

/// Thin bridge to the external notification service. Delivery
/// mechanics (push tokens, retries) live on the other side of this
/// seam.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, notification: OfflineNotification);
}

/// POSTs the delivery summary to the notification service. Failures
/// are logged and dropped; offline notification must never fail a
/// send.
pub struct HttpNotifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpNotifier {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl NotificationSink for HttpNotifier {
    async fn notify(&self, notification: OfflineNotification) {
        let result = self
            .client
            .post(&self.endpoint)
            .json(&notification)
            .send()
            .await;
        if let Err(e) = result {
            warn!(
                "offline notification for {} failed: {}",
                notification.user_id, e
            );
        }
    }
}

/// Default sink for deployments without a notification service.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify(&self, notification: OfflineNotification) {
        debug!(
            "offline notification: user={} thread={} summary={:?}",
            notification.user_id, notification.thread_id, notification.summary
        );
    }
}

/// Truncated preview of a message for offline delivery.
pub fn summarize(content: &str, attachments: &[String]) -> String {
    let trimmed = content.trim();
    if trimmed.is_empty() && !attachments.is_empty() {
        return "Sent an attachment".to_string();
    }
    if trimmed.chars().count() <= SUMMARY_LEN {
        trimmed.to_string()
    } else {
        let mut cut: String = trimmed.chars().take(SUMMARY_LEN).collect();
        cut.push('…');
        cut
    }
}
