//! Compliance check — assesses collected evidence against the case's obligations.

use std::sync::Arc;

use async_trait::async_trait;
use complyflow_core::error::Result;
use complyflow_core::reducers::{append_episodic, merge_decisions, update_cost_tracker, upsert_semantic};
use complyflow_core::state::{ComplianceState, CostDelta, Decision, DecisionKind};
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeKind, NodeOutcome, already_ran, mark_ran};

/// Result of assessing a case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub compliant: bool,
    /// Obligation ids (or free-form findings) that are not satisfied.
    pub findings: Vec<String>,
    /// Route straight to notification instead of reporting.
    pub escalate: bool,
    /// Resources spent producing the assessment.
    pub tokens: u64,
    pub cost_usd: f64,
    pub summary: String,
}

/// Produces an [`Assessment`]. Model-backed assessors report their token usage.
#[async_trait]
pub trait Assessor: Send + Sync {
    fn name(&self) -> &str;

    async fn assess(&self, state: &ComplianceState) -> Result<Assessment>;
}

/// Obligation coverage by evidence source.
///
/// An obligation is satisfied when some evidence comes from one of its
/// `required_sources`, or, if it names none, when any evidence exists.
/// Non-compliance escalates once findings reach `escalate_threshold`.
#[derive(Debug, Clone)]
pub struct RuleAssessor {
    escalate_threshold: usize,
}

impl RuleAssessor {
    pub fn new(escalate_threshold: usize) -> Self {
        Self {
            escalate_threshold: escalate_threshold.max(1),
        }
    }
}

impl Default for RuleAssessor {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl Assessor for RuleAssessor {
    fn name(&self) -> &str {
        "rules"
    }

    async fn assess(&self, state: &ComplianceState) -> Result<Assessment> {
        let obligations = state
            .context
            .as_ref()
            .map(|c| c.obligations.as_slice())
            .unwrap_or_default();

        let findings: Vec<String> = obligations
            .iter()
            .filter(|o| {
                let covered = if o.required_sources.is_empty() {
                    !state.evidence.is_empty()
                } else {
                    state
                        .evidence
                        .iter()
                        .any(|e| o.required_sources.iter().any(|s| s == &e.source))
                };
                !covered
            })
            .map(|o| o.id.clone())
            .collect();

        let compliant = findings.is_empty();
        let summary = if obligations.is_empty() {
            "no obligations in scope".to_string()
        } else if compliant {
            format!("all {} obligation(s) covered", obligations.len())
        } else {
            format!(
                "{} of {} obligation(s) lack evidence: {}",
                findings.len(),
                obligations.len(),
                findings.join(", ")
            )
        };

        Ok(Assessment {
            compliant,
            escalate: findings.len() >= self.escalate_threshold,
            findings,
            tokens: 0,
            cost_usd: 0.0,
            summary,
        })
    }
}

/// Runs the assessor once per trace.
pub struct ComplianceCheckNode {
    assessor: Arc<dyn Assessor>,
}

impl ComplianceCheckNode {
    pub fn new(assessor: Arc<dyn Assessor>) -> Self {
        Self { assessor }
    }
}

#[async_trait]
impl Node for ComplianceCheckNode {
    fn kind(&self) -> NodeKind {
        NodeKind::ComplianceCheck
    }

    async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome> {
        if already_ran(&state, self.label()) {
            tracing::debug!(trace_id = %state.trace_id, "⏭️ Compliance check already recorded for this trace");
            return Ok(route(state, self.label()));
        }

        let assessment = self.assessor.assess(&state).await?;
        let delta = CostDelta::new(
            i64::try_from(assessment.tokens).unwrap_or(i64::MAX),
            assessment.cost_usd,
        );

        let mut next = update_cost_tracker(&state, delta)?;
        next = merge_decisions(
            &next,
            vec![
                Decision::new(
                    self.label(),
                    DecisionKind::Assessment {
                        compliant: assessment.compliant,
                    },
                    assessment.summary.clone(),
                )
                .with_detail(serde_json::json!({
                    "assessor": self.assessor.name(),
                    "findings": assessment.findings,
                    "escalate": assessment.escalate,
                    "evidence_count": state.evidence.len(),
                })),
            ],
        );
        next = upsert_semantic(
            &next,
            "compliance_status",
            serde_json::json!(if assessment.compliant { "compliant" } else { "non_compliant" }),
        );
        next = append_episodic(&next, self.label(), assessment.summary.clone());
        next = mark_ran(&next, self.label());

        tracing::info!(
            case_id = %next.case_id,
            trace_id = %next.trace_id,
            compliant = assessment.compliant,
            "🔎 {}",
            assessment.summary
        );

        if assessment.escalate {
            Ok(NodeOutcome::goto(next, NodeKind::Notification))
        } else {
            Ok(NodeOutcome::next(next))
        }
    }
}

/// Route a re-run the same way the recorded assessment of this trace went.
///
/// Decisions are append-only and `already_ran` guarantees this node's latest
/// assessment belongs to the current trace.
fn route(state: ComplianceState, node: &str) -> NodeOutcome {
    let escalate = state
        .decisions
        .iter()
        .rev()
        .find_map(|d| match d.kind {
            DecisionKind::Assessment { compliant } if d.node == node => Some(
                d.detail
                    .get("escalate")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(!compliant),
            ),
            _ => None,
        })
        .unwrap_or(false);
    if escalate {
        NodeOutcome::goto(state, NodeKind::Notification)
    } else {
        NodeOutcome::next(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutionLimits, GraphExecutor, Verdict};
    use crate::graph::NodeGraph;
    use crate::node::Route;
    use crate::nodes::ErrorHandlerNode;
    use complyflow_core::error::ComplyError;
    use complyflow_core::reducers::increment_retry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use chrono::Utc;
    use complyflow_core::reducers::accumulate_evidence;
    use complyflow_core::state::{ComplianceContext, EvidenceItem, Obligation};

    fn obligation(id: &str, sources: &[&str]) -> Obligation {
        Obligation {
            id: id.to_string(),
            description: format!("{id} control"),
            required_sources: sources.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn case(evidence_sources: &[&str]) -> ComplianceState {
        let state = ComplianceState::new("case-cc", "SOC2 check", "PolicyAuthor")
            .unwrap()
            .with_context(ComplianceContext {
                framework: Some("SOC2".into()),
                obligations: vec![obligation("CC6.1", &["okta"]), obligation("CC8.1", &["github"])],
                ..ComplianceContext::default()
            });
        let items = evidence_sources
            .iter()
            .enumerate()
            .map(|(i, s)| EvidenceItem::new(&format!("ev-{i}"), s, "ref", Utc::now()))
            .collect();
        accumulate_evidence(&state, items)
    }

    struct PricedAssessor;

    #[async_trait]
    impl Assessor for PricedAssessor {
        fn name(&self) -> &str {
            "priced"
        }
        async fn assess(&self, _state: &ComplianceState) -> Result<Assessment> {
            Ok(Assessment {
                compliant: true,
                findings: vec![],
                escalate: false,
                tokens: 1500,
                cost_usd: 0.25,
                summary: "looks fine".into(),
            })
        }
    }

    #[tokio::test]
    async fn test_rule_assessor_coverage() {
        let assessor = RuleAssessor::default();
        let full = assessor.assess(&case(&["okta", "github"])).await.unwrap();
        assert!(full.compliant);
        assert!(!full.escalate);

        let partial = assessor.assess(&case(&["okta"])).await.unwrap();
        assert!(!partial.compliant);
        assert_eq!(partial.findings, vec!["CC8.1".to_string()]);
        assert!(partial.escalate);
    }

    #[tokio::test]
    async fn test_non_compliance_escalates_to_notification() {
        let node = ComplianceCheckNode::new(Arc::new(RuleAssessor::default()));
        let out = node.execute(case(&["okta"])).await.unwrap();
        assert_eq!(out.route, Route::Goto(NodeKind::Notification));
        assert!(matches!(
            out.state.decisions[0].kind,
            DecisionKind::Assessment { compliant: false }
        ));
        assert_eq!(out.state.memory.semantic["compliance_status"], "non_compliant");
    }

    /// Counts calls; fails the first `failures` of them with a transient error.
    struct Counting {
        kind: NodeKind,
        failures: u32,
        calls: AtomicU32,
    }

    impl Counting {
        fn new(kind: NodeKind, failures: u32) -> Arc<Self> {
            Arc::new(Self {
                kind,
                failures,
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Node for Counting {
        fn kind(&self) -> NodeKind {
            self.kind
        }
        async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(ComplyError::transient("webhook returned 502"));
            }
            Ok(NodeOutcome::next(state))
        }
    }

    #[tokio::test]
    async fn test_escalation_survives_retry_within_trace() {
        let reporting = Counting::new(NodeKind::Reporting, 0);
        let notification = Counting::new(NodeKind::Notification, 1);
        let graph = NodeGraph::builder("review")
            .then(Arc::new(ComplianceCheckNode::new(Arc::new(RuleAssessor::default()))))
            .then(reporting.clone())
            .then(notification.clone())
            .on_error(Arc::new(ErrorHandlerNode::new(3, 10)))
            .build()
            .unwrap();
        let executor = GraphExecutor::new(ExecutionLimits {
            max_steps: 16,
            node_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(60),
            parallel_limit: 4,
        });
        let cancel = CancellationToken::new();

        let first = executor.run(&graph, case(&["okta"]), &cancel).await;
        assert!(matches!(first.verdict, Verdict::Retry(_)));
        assert_eq!(reporting.calls.load(Ordering::SeqCst), 0);

        let second = executor.run(&graph, increment_retry(&first.state), &cancel).await;
        assert_eq!(second.verdict, Verdict::Completed);
        assert_eq!(reporting.calls.load(Ordering::SeqCst), 0);
        assert_eq!(notification.calls.load(Ordering::SeqCst), 2);
        let assessments = second
            .state
            .decisions
            .iter()
            .filter(|d| matches!(d.kind, DecisionKind::Assessment { .. }))
            .count();
        assert_eq!(assessments, 1);
    }

    #[tokio::test]
    async fn test_cost_recorded_once_per_trace() {
        let node = ComplianceCheckNode::new(Arc::new(PricedAssessor));
        let first = node.execute(case(&[])).await.unwrap();
        assert_eq!(first.route, Route::Next);
        assert_eq!(first.state.cost_tracker.tokens, 1500);
        assert_eq!(first.state.cost_tracker.cost_usd, 0.25);

        let again = node.execute(first.state.clone()).await.unwrap();
        assert_eq!(again.state, first.state);

        let next_run = first.state.next_execution("re-check", first.state.actor).unwrap();
        let rerun = node.execute(next_run).await.unwrap();
        assert_eq!(rerun.state.cost_tracker.tokens, 3000);
        assert_eq!(rerun.state.decisions.len(), 2);
    }
}
