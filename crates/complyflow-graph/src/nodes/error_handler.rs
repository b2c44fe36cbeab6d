//! Error handler node. Decides between another attempt and giving up.

use async_trait::async_trait;
use complyflow_core::error::{ErrorClass, Result};
use complyflow_core::reducers::merge_decisions;
use complyflow_core::state::{ComplianceState, Decision, DecisionKind};

use crate::node::{Node, NodeKind, NodeOutcome};

/// Retries transient failures while both the retry and error budgets allow it.
/// Validation and terminal failures are never retried.
#[derive(Debug, Clone)]
pub struct ErrorHandlerNode {
    max_retries: u32,
    max_errors: u32,
}

impl ErrorHandlerNode {
    pub fn new(max_retries: u32, max_errors: u32) -> Self {
        Self { max_retries, max_errors }
    }

    fn should_retry(&self, state: &ComplianceState) -> (bool, String) {
        let Some((_, class)) = state.last_failure() else {
            return (false, "no failure recorded".into());
        };
        if class != ErrorClass::Transient {
            return (false, format!("{class} failure is not retryable"));
        }
        if state.retry_count >= self.max_retries {
            return (
                false,
                format!("retry budget exhausted ({}/{})", state.retry_count, self.max_retries),
            );
        }
        if state.error_count > self.max_errors {
            return (
                false,
                format!("error budget exhausted ({}/{})", state.error_count, self.max_errors),
            );
        }
        (
            true,
            format!("retry {} of {}", state.retry_count + 1, self.max_retries),
        )
    }
}

#[async_trait]
impl Node for ErrorHandlerNode {
    fn kind(&self) -> NodeKind {
        NodeKind::ErrorHandler
    }

    async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome> {
        let (retry, summary) = self.should_retry(&state);
        let decision = Decision::new(self.label(), DecisionKind::Recovery { retry }, summary).with_detail(
            serde_json::json!({
                "retry_count": state.retry_count,
                "error_count": state.error_count,
            }),
        );
        let next = merge_decisions(&state, vec![decision]);
        if retry {
            Ok(NodeOutcome::retry(next))
        } else {
            Ok(NodeOutcome::end(next))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Route;
    use complyflow_core::reducers::increment_error;

    fn failed(class: ErrorClass, retries: u32, errors: u32) -> ComplianceState {
        let mut state = ComplianceState::new("case-e", "handler", "RegWatch").unwrap();
        state.retry_count = retries;
        for _ in 0..errors {
            state = increment_error(&state);
        }
        merge_decisions(
            &state,
            vec![Decision::new("evidence", DecisionKind::Failure { class }, "boom")],
        )
    }

    #[tokio::test]
    async fn test_transient_within_budget_retries() {
        let handler = ErrorHandlerNode::new(3, 10);
        let out = handler.execute(failed(ErrorClass::Transient, 2, 1)).await.unwrap();
        assert_eq!(out.route, Route::Retry);
        assert!(matches!(
            out.state.decisions.last().unwrap().kind,
            DecisionKind::Recovery { retry: true }
        ));
    }

    #[tokio::test]
    async fn test_budgets_and_classes_stop_retries() {
        let handler = ErrorHandlerNode::new(3, 2);
        for state in [
            failed(ErrorClass::Transient, 3, 1),
            failed(ErrorClass::Transient, 0, 3),
            failed(ErrorClass::Validation, 0, 1),
            failed(ErrorClass::Terminal, 0, 1),
        ] {
            let out = handler.execute(state).await.unwrap();
            assert_eq!(out.route, Route::End);
        }
    }
}
