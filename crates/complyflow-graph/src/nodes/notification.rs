//! Tells humans how the case went.

use std::sync::Arc;

use async_trait::async_trait;
use complyflow_core::error::{ComplyError, Result};
use complyflow_core::reducers::merge_decisions;
use complyflow_core::state::{ComplianceState, Decision, DecisionKind};

use crate::node::{Node, NodeKind, NodeOutcome, already_ran, mark_ran};
use crate::notify::{Notification, NotifyPriority, Notifier};

/// Sends one notification per trace to every notifier.
/// Succeeds if at least one notifier delivered; otherwise fails transiently.
pub struct NotificationNode {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationNode {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    fn compose(state: &ComplianceState) -> Notification {
        let compliant = state.decisions.iter().rev().find_map(|d| match d.kind {
            DecisionKind::Assessment { compliant } => Some(compliant),
            _ => None,
        });
        let (title, priority) = match compliant {
            Some(false) => (format!("Case {} is not compliant", state.case_id), NotifyPriority::High),
            Some(true) => (format!("Case {} is compliant", state.case_id), NotifyPriority::Normal),
            None => (format!("Case {} update", state.case_id), NotifyPriority::Low),
        };
        let body = format!(
            "{}: {} evidence item(s), {} decision(s), {} error(s)",
            state.objective,
            state.evidence.len(),
            state.decisions.len(),
            state.error_count
        );
        Notification::new(&title, &body, &state.case_id, priority)
    }
}

#[async_trait]
impl Node for NotificationNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Notification
    }

    async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome> {
        if already_ran(&state, self.label()) {
            return Ok(NodeOutcome::next(state));
        }
        let notification = Self::compose(&state);

        let mut delivered: Vec<String> = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        for notifier in &self.notifiers {
            match notifier.send(&notification).await {
                Ok(()) => delivered.push(notifier.name().to_string()),
                Err(e) => {
                    tracing::warn!(node = self.label(), "⚠️ Notifier '{}' failed: {e}", notifier.name());
                    errors.push(format!("{}: {e}", notifier.name()));
                }
            }
        }
        if delivered.is_empty() && !self.notifiers.is_empty() {
            return Err(ComplyError::transient(format!(
                "no notifier delivered: {}",
                errors.join("; ")
            )));
        }

        let decisions = delivered
            .iter()
            .map(|channel| {
                Decision::new(
                    self.label(),
                    DecisionKind::Notification {
                        channel: channel.clone(),
                    },
                    notification.title.clone(),
                )
            })
            .collect();
        let next = merge_decisions(&state, decisions);
        Ok(NodeOutcome::next(mark_ran(&next, self.label())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LogNotifier;

    struct Broken;

    #[async_trait]
    impl Notifier for Broken {
        fn name(&self) -> &str {
            "broken"
        }
        async fn send(&self, _n: &Notification) -> Result<()> {
            Err(ComplyError::transient("smtp down"))
        }
    }

    fn state() -> ComplianceState {
        ComplianceState::new("case-n", "Notify", "RegWatch").unwrap()
    }

    #[tokio::test]
    async fn test_partial_delivery_succeeds() {
        let node = NotificationNode::new(vec![Arc::new(Broken), Arc::new(LogNotifier)]);
        let out = node.execute(state()).await.unwrap();
        assert_eq!(out.state.decisions.len(), 1);
        assert!(matches!(
            &out.state.decisions[0].kind,
            DecisionKind::Notification { channel } if channel == "log"
        ));
        // Second run within the same trace sends nothing.
        let again = node.execute(out.state.clone()).await.unwrap();
        assert_eq!(again.state.decisions.len(), 1);
    }

    #[tokio::test]
    async fn test_all_notifiers_failing_is_transient() {
        let node = NotificationNode::new(vec![Arc::new(Broken)]);
        let err = node.execute(state()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
