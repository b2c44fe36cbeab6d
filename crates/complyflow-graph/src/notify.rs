//! Outbound notifications — used by the notification node and by scheduler alerts.
//! Two targets: structured log lines and a generic HTTP webhook.

use std::time::Duration;

use async_trait::async_trait;
use complyflow_core::error::{ComplyError, Result};
use serde::{Deserialize, Serialize};

/// A notification to deliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub priority: NotifyPriority,
    /// Which task, case or node triggered this.
    pub source: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Notification {
    pub fn new(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Self {
        Self {
            title: title.to_string(),
            body: body.to_string(),
            priority,
            source: source.to_string(),
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl NotifyPriority {
    fn emoji(&self) -> &'static str {
        match self {
            NotifyPriority::Urgent => "🚨",
            NotifyPriority::High => "⚠️",
            NotifyPriority::Normal => "📢",
            NotifyPriority::Low => "ℹ️",
        }
    }
}

/// A delivery channel.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the tracing log. Always succeeds.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let emoji = notification.priority.emoji();
        match notification.priority {
            NotifyPriority::Urgent | NotifyPriority::High => tracing::warn!(
                source = %notification.source,
                "{emoji} {}: {}",
                notification.title,
                notification.body
            ),
            NotifyPriority::Normal | NotifyPriority::Low => tracing::info!(
                source = %notification.source,
                "{emoji} {}: {}",
                notification.title,
                notification.body
            ),
        }
        Ok(())
    }
}

/// Generic HTTP webhook: POST with a JSON body.
pub struct WebhookNotifier {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookNotifier {
    pub fn new(url: &str, headers: Vec<(String, String)>) -> Self {
        Self {
            url: url.to_string(),
            headers,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn payload(notification: &Notification) -> serde_json::Value {
        serde_json::json!({
            "title": notification.title,
            "body": notification.body,
            "priority": format!("{:?}", notification.priority),
            "source": notification.source,
            "timestamp": notification.timestamp.to_rfc3339(),
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let mut req = self
            .client
            .post(&self.url)
            .json(&Self::payload(notification))
            .timeout(self.timeout);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| ComplyError::transient(format!("webhook send failed: {e}")))?;

        let status = resp.status();
        if status.is_success() {
            tracing::info!("✅ Webhook notification sent to {}: {}", self.url, notification.title);
            Ok(())
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(ComplyError::transient(format!("webhook error {status}")))
        } else {
            Err(ComplyError::terminal(format!("webhook rejected notification: {status}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        let n = Notification::new("Case failed", "retries exhausted", "task-1", NotifyPriority::Urgent);
        assert!(LogNotifier.send(&n).await.is_ok());
    }

    #[test]
    fn test_webhook_payload_shape() {
        let n = Notification::new("Report ready", "case-7", "reporting", NotifyPriority::Normal);
        let payload = WebhookNotifier::payload(&n);
        assert_eq!(payload["title"], "Report ready");
        assert_eq!(payload["priority"], "Normal");
        assert!(payload["timestamp"].as_str().is_some());
    }
}
