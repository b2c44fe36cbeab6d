//! Alert routing — records scheduler alerts and fans them out to notifiers.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use complyflow_graph::notify::{Notification, NotifyPriority, Notifier};

/// Keeps the last `capacity` notifications and delivers each to every notifier.
pub struct NotifyRouter {
    notifiers: Vec<Arc<dyn Notifier>>,
    history: Mutex<VecDeque<Notification>>,
    capacity: usize,
}

impl NotifyRouter {
    pub fn new(capacity: usize) -> Self {
        Self {
            notifiers: Vec::new(),
            history: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn with_notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    /// Record a notification in history (ring buffer).
    pub fn record(&self, notification: Notification) {
        if let Ok(mut history) = self.history.lock() {
            history.push_back(notification);
            while history.len() > self.capacity {
                history.pop_front();
            }
        }
    }

    /// Oldest first.
    pub fn history(&self) -> Vec<Notification> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record and deliver. Returns how many notifiers accepted it; failures are logged.
    pub async fn dispatch(&self, notification: Notification) -> usize {
        self.record(notification.clone());
        let mut delivered = 0;
        for notifier in &self.notifiers {
            match notifier.send(&notification).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("⚠️ Alert via '{}' failed: {e}", notifier.name()),
            }
        }
        delivered
    }

    pub fn create(title: &str, body: &str, source: &str, priority: NotifyPriority) -> Notification {
        Notification::new(title, body, source, priority)
    }
}

impl Default for NotifyRouter {
    fn default() -> Self {
        Self::new(100)
    }
}
