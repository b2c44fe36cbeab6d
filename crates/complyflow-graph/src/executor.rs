//! Graph executor — walks a [`NodeGraph`] for one execution attempt.
//!
//! ```text
//! READY → RUNNING ──────────────────────────→ COMPLETED
//!            │ node error / timeout / bad route
//!            ▼
//!      ERROR_HANDLING ──(handler: retry)──→ retry requested
//!            └────────(handler: give up)──→ FAILED
//! ```
//!
//! Every node call is bounded by the node timeout and by what is left of the
//! execution deadline, and can be interrupted by the cancellation token.
//! The executor never returns an error: the outcome says how the attempt ended.

use std::sync::Arc;
use std::time::Duration;

use complyflow_core::config::{GraphConfig, SchedulerConfig};
use complyflow_core::error::{ComplyError, ErrorClass};
use complyflow_core::reducers::{increment_error, merge_decisions, record_node_time, set_status};
use complyflow_core::state::{ComplianceState, Decision, DecisionKind, WorkflowStatus};
use complyflow_core::StateUpdate;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::graph::{NodeGraph, Stage};
use crate::node::{Node, NodeKind, NodeOutcome, Route};

/// Bounds applied to every execution.
#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    /// Maximum number of stages visited per attempt (guards Goto loops).
    pub max_steps: u32,
    pub node_timeout: Duration,
    pub execution_timeout: Duration,
    /// Worker pool size for parallel stages.
    pub parallel_limit: usize,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default(), &GraphConfig::default())
    }
}

impl ExecutionLimits {
    pub fn from_config(scheduler: &SchedulerConfig, graph: &GraphConfig) -> Self {
        Self {
            max_steps: graph.max_steps,
            node_timeout: Duration::from_secs(scheduler.node_timeout_secs),
            execution_timeout: Duration::from_secs(scheduler.execution_timeout_secs),
            parallel_limit: graph.parallel_limit.max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphPhase {
    Ready,
    Running,
    ErrorHandling,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for GraphPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GraphPhase::Ready => "ready",
            GraphPhase::Running => "running",
            GraphPhase::ErrorHandling => "error_handling",
            GraphPhase::Completed => "completed",
            GraphPhase::Failed => "failed",
            GraphPhase::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why an attempt left the happy path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The node returned an error.
    NodeError,
    /// The node routed to `Fail`.
    NodeRejected,
    Timeout,
    /// Goto to a node outside the graph, or a route the node may not take.
    InvalidRoute,
    StepLimit,
    /// The node returned a state that is invalid or rewrote history.
    InvalidState,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub node: String,
    pub class: ErrorClass,
    pub cause: FailureCause,
    pub message: String,
}

impl Failure {
    fn new(node: &str, class: ErrorClass, cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            node: node.to_string(),
            class,
            cause,
            message: message.into(),
        }
    }

    fn from_error(node: &str, err: &ComplyError) -> Self {
        let cause = match err {
            ComplyError::Timeout(_) => FailureCause::Timeout,
            ComplyError::Cancelled(_) => FailureCause::Cancelled,
            _ => FailureCause::NodeError,
        };
        Self::new(node, err.class(), cause, err.to_string())
    }

    fn is_cancellation(&self) -> bool {
        self.cause == FailureCause::Cancelled
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Completed,
    /// The error handler asked for another attempt.
    Retry(Failure),
    Failed(Failure),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub state: ComplianceState,
    pub verdict: Verdict,
    /// Stages visited.
    pub steps: u32,
}

impl ExecutionOutcome {
    pub fn phase(&self) -> GraphPhase {
        match self.verdict {
            Verdict::Completed => GraphPhase::Completed,
            Verdict::Retry(_) => GraphPhase::ErrorHandling,
            Verdict::Failed(_) => GraphPhase::Failed,
            Verdict::Cancelled => GraphPhase::Cancelled,
        }
    }

    pub fn failure(&self) -> Option<&Failure> {
        match &self.verdict {
            Verdict::Retry(f) | Verdict::Failed(f) => Some(f),
            Verdict::Completed | Verdict::Cancelled => None,
        }
    }
}

/// Result of one stage: the state to continue from and either a route or a failure.
struct StageResult {
    state: ComplianceState,
    next: std::result::Result<Route, Failure>,
}

pub struct GraphExecutor {
    limits: ExecutionLimits,
}

impl GraphExecutor {
    pub fn new(limits: ExecutionLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Run `graph` once over `state`.
    pub async fn run(
        &self,
        graph: &NodeGraph,
        state: ComplianceState,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        let deadline = Instant::now() + self.limits.execution_timeout;
        let mut state = set_status(&state, WorkflowStatus::InProgress);
        let mut index = 0usize;
        let mut steps = 0u32;

        tracing::debug!(
            case_id = %state.case_id,
            trace_id = %state.trace_id,
            "🔀 Graph '{}': {} → {}",
            graph.name(),
            GraphPhase::Ready,
            GraphPhase::Running
        );

        loop {
            let Some(stage) = graph.stages().get(index) else {
                return self.complete(graph, state, steps);
            };
            if steps >= self.limits.max_steps {
                let failure = Failure::new(
                    &stage.describe(),
                    ErrorClass::Terminal,
                    FailureCause::StepLimit,
                    format!("step limit of {} reached", self.limits.max_steps),
                );
                return self.handle_failure(graph, state, failure, steps, cancel).await;
            }
            steps += 1;

            let result = match stage {
                Stage::Single(node) => self.run_single(node, state, deadline, cancel).await,
                Stage::Parallel(nodes) => self.run_parallel(nodes, state, deadline, cancel).await,
            };
            state = result.state;

            let failure = match result.next {
                Ok(Route::Next) => {
                    index += 1;
                    continue;
                }
                Ok(Route::End) => return self.complete(graph, state, steps),
                Ok(Route::Goto(kind)) => match graph.position(kind) {
                    Some(target) if kind != NodeKind::ErrorHandler => {
                        tracing::debug!(trace_id = %state.trace_id, "↪️ {} → {kind}", stage.describe());
                        index = target;
                        continue;
                    }
                    _ => Failure::new(
                        &stage.describe(),
                        ErrorClass::Terminal,
                        FailureCause::InvalidRoute,
                        format!("goto {kind}: no such node in graph '{}'", graph.name()),
                    ),
                },
                Ok(Route::Retry) => Failure::new(
                    &stage.describe(),
                    ErrorClass::Terminal,
                    FailureCause::InvalidRoute,
                    "only the error handler may request a retry",
                ),
                Ok(Route::Fail(reason)) => Failure::new(
                    &stage.describe(),
                    ErrorClass::Terminal,
                    FailureCause::NodeRejected,
                    reason,
                ),
                Err(failure) => failure,
            };
            return self.handle_failure(graph, state, failure, steps, cancel).await;
        }
    }

    fn complete(&self, graph: &NodeGraph, state: ComplianceState, steps: u32) -> ExecutionOutcome {
        tracing::debug!(
            case_id = %state.case_id,
            trace_id = %state.trace_id,
            "✅ Graph '{}' completed in {steps} step(s)",
            graph.name()
        );
        ExecutionOutcome {
            state: set_status(&state, WorkflowStatus::Completed),
            verdict: Verdict::Completed,
            steps,
        }
    }

    async fn run_single(
        &self,
        node: &Arc<dyn Node>,
        state: ComplianceState,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> StageResult {
        let (elapsed, result) = self.invoke(node, &state, Some(deadline), cancel).await;
        match result {
            Ok(outcome) => StageResult {
                state: record_node_time(&outcome.state, node.label(), elapsed),
                next: Ok(outcome.route),
            },
            Err(failure) => StageResult {
                state: record_node_time(&state, node.label(), elapsed),
                next: Err(failure),
            },
        }
    }

    /// Fan branches out to at most `parallel_limit` concurrent calls and fold
    /// their updates into the input state in completion order.
    async fn run_parallel(
        &self,
        nodes: &[Arc<dyn Node>],
        state: ComplianceState,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> StageResult {
        let base = state;
        let runs: Vec<(Arc<dyn Node>, Duration, std::result::Result<NodeOutcome, Failure>)> =
            futures::stream::iter(
                nodes
                    .iter()
                    .cloned()
                    .map(|node| {
                        let base = &base;
                        async move {
                            let (elapsed, result) = self.invoke(&node, base, Some(deadline), cancel).await;
                            (node, elapsed, result)
                        }
                    })
                    .collect::<Vec<_>>(),
            )
                .buffer_unordered(self.limits.parallel_limit)
                .collect()
                .await;

        let mut merged = base.clone();
        let mut routes: Vec<Route> = Vec::with_capacity(runs.len());
        let mut first_failure: Option<Failure> = None;

        for (node, elapsed, result) in runs {
            merged = record_node_time(&merged, node.label(), elapsed);
            let outcome = match result {
                Ok(outcome) => outcome,
                Err(failure) => {
                    // Cancellation outranks any other branch failure.
                    let replace = match &first_failure {
                        None => true,
                        Some(existing) => failure.is_cancellation() && !existing.is_cancellation(),
                    };
                    if replace {
                        first_failure = Some(failure);
                    }
                    continue;
                }
            };
            let applied = StateUpdate::between(&base, &outcome.state)
                .and_then(|update| update.apply(&merged));
            match applied {
                Ok(next) => merged = next,
                Err(e) => {
                    if first_failure.is_none() {
                        first_failure = Some(Failure::new(
                            node.label(),
                            ErrorClass::Validation,
                            FailureCause::InvalidState,
                            format!("branch result could not be merged: {e}"),
                        ));
                    }
                    continue;
                }
            }
            routes.push(outcome.route);
        }

        if let Some(failure) = first_failure {
            return StageResult { state: merged, next: Err(failure) };
        }
        if let Some(reason) = routes.iter().find_map(|r| match r {
            Route::Fail(reason) => Some(reason.clone()),
            _ => None,
        }) {
            return StageResult { state: merged, next: Ok(Route::Fail(reason)) };
        }
        let next = match routes.split_first() {
            Some((first, rest)) if rest.iter().all(|r| r == first) => Ok(first.clone()),
            Some(_) => Err(Failure::new(
                &Stage::Parallel(nodes.to_vec()).describe(),
                ErrorClass::Terminal,
                FailureCause::InvalidRoute,
                "parallel branches disagree on routing",
            )),
            None => Ok(Route::Next),
        };
        StageResult { state: merged, next }
    }

    /// Call one node under its time budget and check what it returned.
    async fn invoke(
        &self,
        node: &Arc<dyn Node>,
        input: &ComplianceState,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> (Duration, std::result::Result<NodeOutcome, Failure>) {
        let label = node.label();
        let started = Instant::now();
        let mut budget = node.timeout().unwrap_or(self.limits.node_timeout);
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(started);
            if remaining.is_zero() {
                return (
                    Duration::ZERO,
                    Err(Failure::new(
                        label,
                        ErrorClass::Transient,
                        FailureCause::Timeout,
                        "execution deadline exceeded",
                    )),
                );
            }
            budget = budget.min(remaining);
        }

        tracing::debug!(node = label, trace_id = %input.trace_id, "▶️ Node start");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Failure::new(
                label,
                ErrorClass::Terminal,
                FailureCause::Cancelled,
                "execution cancelled",
            )),
            res = tokio::time::timeout(budget, node.execute(input.clone())) => match res {
                Err(_) => Err(Failure::new(
                    label,
                    ErrorClass::Transient,
                    FailureCause::Timeout,
                    format!("node timed out after {}ms", budget.as_millis()),
                )),
                Ok(Err(e)) => Err(Failure::from_error(label, &e)),
                Ok(Ok(outcome)) => check_outcome(label, input, outcome),
            },
        };
        let elapsed = started.elapsed();

        match &result {
            Ok(_) => tracing::debug!(node = label, "⏱️ Node done in {}ms", elapsed.as_millis()),
            Err(f) => tracing::warn!(
                node = label,
                trace_id = %input.trace_id,
                "⚠️ Node failed ({}): {}",
                f.class,
                f.message
            ),
        }
        (elapsed, result)
    }

    /// Record the failure and let the error handler decide between retry and give-up.
    async fn handle_failure(
        &self,
        graph: &NodeGraph,
        state: ComplianceState,
        failure: Failure,
        steps: u32,
        cancel: &CancellationToken,
    ) -> ExecutionOutcome {
        if failure.is_cancellation() {
            tracing::info!(case_id = %state.case_id, trace_id = %state.trace_id, "🛑 Execution cancelled");
            return ExecutionOutcome {
                state: set_status(&state, WorkflowStatus::Cancelled),
                verdict: Verdict::Cancelled,
                steps,
            };
        }

        tracing::debug!(
            trace_id = %state.trace_id,
            "🔀 Graph '{}': {} → {}",
            graph.name(),
            GraphPhase::Running,
            GraphPhase::ErrorHandling
        );

        let state = increment_error(&state);
        let state = merge_decisions(
            &state,
            vec![
                Decision::new(
                    &failure.node,
                    DecisionKind::Failure { class: failure.class },
                    failure.message.clone(),
                )
                .with_detail(serde_json::json!({ "cause": failure.cause })),
            ],
        );

        // The handler still gets its own budget after the execution deadline passed.
        let handler = graph.error_handler();
        let (elapsed, result) = self.invoke(handler, &state, None, cancel).await;

        match result {
            Ok(outcome) => {
                let state = record_node_time(&outcome.state, handler.label(), elapsed);
                if outcome.route == Route::Retry {
                    tracing::info!(
                        case_id = %state.case_id,
                        trace_id = %state.trace_id,
                        "🔁 Error handler requested a retry after {} failure",
                        failure.class
                    );
                    ExecutionOutcome {
                        state,
                        verdict: Verdict::Retry(failure),
                        steps,
                    }
                } else {
                    self.fail(state, failure, steps)
                }
            }
            Err(handler_failure) if handler_failure.is_cancellation() => ExecutionOutcome {
                state: set_status(&state, WorkflowStatus::Cancelled),
                verdict: Verdict::Cancelled,
                steps,
            },
            Err(handler_failure) => {
                tracing::error!(
                    trace_id = %state.trace_id,
                    "❌ Error handler failed: {}",
                    handler_failure.message
                );
                let state = record_node_time(&state, handler.label(), elapsed);
                self.fail(state, failure, steps)
            }
        }
    }

    fn fail(&self, state: ComplianceState, failure: Failure, steps: u32) -> ExecutionOutcome {
        tracing::error!(
            case_id = %state.case_id,
            trace_id = %state.trace_id,
            node = %failure.node,
            "❌ Execution failed ({}): {}",
            failure.class,
            failure.message
        );
        ExecutionOutcome {
            state: set_status(&state, WorkflowStatus::Failed),
            verdict: Verdict::Failed(failure),
            steps,
        }
    }
}

/// A node may only add to the state of its own execution.
fn check_outcome(
    label: &str,
    input: &ComplianceState,
    outcome: NodeOutcome,
) -> std::result::Result<NodeOutcome, Failure> {
    let invalid = |msg: String| {
        Failure::new(label, ErrorClass::Validation, FailureCause::InvalidState, msg)
    };
    outcome
        .state
        .validate()
        .map_err(|e| invalid(format!("node returned an invalid state: {e}")))?;
    if outcome.state.trace_id != input.trace_id {
        return Err(invalid("node changed the trace id".into()));
    }
    StateUpdate::between(input, &outcome.state)
        .map_err(|e| invalid(format!("node rewrote state history: {e}")))?;
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::ErrorHandlerNode;
    use async_trait::async_trait;
    use chrono::Utc;
    use complyflow_core::reducers::accumulate_evidence;
    use complyflow_core::state::EvidenceItem;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Behaviour = Box<dyn Fn(ComplianceState) -> complyflow_core::Result<NodeOutcome> + Send + Sync>;

    struct TestNode {
        kind: NodeKind,
        label: String,
        delay: Duration,
        calls: AtomicU32,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Node for TestNode {
        fn kind(&self) -> NodeKind {
            self.kind
        }
        fn label(&self) -> &str {
            &self.label
        }
        async fn execute(&self, state: ComplianceState) -> complyflow_core::Result<NodeOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.behaviour)(state)
        }
    }

    fn node(
        kind: NodeKind,
        label: &str,
        delay_ms: u64,
        behaviour: impl Fn(ComplianceState) -> complyflow_core::Result<NodeOutcome> + Send + Sync + 'static,
    ) -> Arc<TestNode> {
        Arc::new(TestNode {
            kind,
            label: label.to_string(),
            delay: Duration::from_millis(delay_ms),
            calls: AtomicU32::new(0),
            behaviour: Box::new(behaviour),
        })
    }

    fn collector(label: &str, id: &'static str, delay_ms: u64) -> Arc<TestNode> {
        node(NodeKind::EvidenceCollection, label, delay_ms, move |s| {
            let item = EvidenceItem::new(id, "test", "ref", Utc::now());
            Ok(NodeOutcome::next(accumulate_evidence(&s, vec![item])))
        })
    }

    fn passthrough(kind: NodeKind) -> Arc<TestNode> {
        node(kind, kind.as_str(), 0, |s| Ok(NodeOutcome::next(s)))
    }

    fn handler(max_retries: u32) -> Arc<dyn Node> {
        Arc::new(ErrorHandlerNode::new(max_retries, 10))
    }

    fn state() -> ComplianceState {
        ComplianceState::new("case-x", "Executor test", "EvidenceCollector").unwrap()
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            max_steps: 16,
            node_timeout: Duration::from_secs(5),
            execution_timeout: Duration::from_secs(60),
            parallel_limit: 4,
        }
    }

    #[tokio::test]
    async fn test_sequential_graph_completes() {
        let check = passthrough(NodeKind::ComplianceCheck);
        let graph = NodeGraph::builder("seq")
            .then(collector("evidence", "e1", 0))
            .then(check.clone())
            .then(passthrough(NodeKind::Reporting))
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert_eq!(out.verdict, Verdict::Completed);
        assert_eq!(out.phase(), GraphPhase::Completed);
        assert_eq!(out.steps, 3);
        assert_eq!(out.state.workflow_status, WorkflowStatus::Completed);
        assert_eq!(out.state.evidence.len(), 1);
        assert_eq!(out.state.node_execution_times.len(), 3);
        assert_eq!(check.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_goto_skips_stages() {
        let reporting = passthrough(NodeKind::Reporting);
        let notify = passthrough(NodeKind::Notification);
        let graph = NodeGraph::builder("escalate")
            .then(node(NodeKind::ComplianceCheck, "compliance_check", 0, |s| {
                Ok(NodeOutcome::goto(s, NodeKind::Notification))
            }))
            .then(reporting.clone())
            .then(notify.clone())
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert_eq!(out.verdict, Verdict::Completed);
        assert_eq!(reporting.calls.load(Ordering::SeqCst), 0);
        assert_eq!(notify.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_stage_merges_in_completion_order() {
        let graph = NodeGraph::builder("fanout")
            .parallel(vec![
                collector("evidence:slow", "slow", 2_000) as Arc<dyn Node>,
                collector("evidence:fast", "fast", 1_000),
            ])
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert_eq!(out.verdict, Verdict::Completed);
        let ids: Vec<&str> = out.state.evidence.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["fast", "slow"]);
        assert!(out.state.node_execution_times.contains_key("evidence:slow"));
        assert!(out.state.node_execution_times.contains_key("evidence:fast"));
    }

    #[tokio::test]
    async fn test_transient_error_requests_retry() {
        let graph = NodeGraph::builder("flaky")
            .then(node(NodeKind::EvidenceCollection, "evidence", 0, |_| {
                Err(ComplyError::transient("integration returned 503"))
            }))
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert!(matches!(out.verdict, Verdict::Retry(ref f) if f.class == ErrorClass::Transient));
        assert_eq!(out.state.error_count, 1);
        let (_, class) = out.state.last_failure().unwrap();
        assert_eq!(class, ErrorClass::Transient);
        assert!(matches!(
            out.state.decisions.last().map(|d| &d.kind),
            Some(DecisionKind::Recovery { retry: true })
        ));
    }

    #[tokio::test]
    async fn test_validation_error_fails_without_retry() {
        let graph = NodeGraph::builder("bad-input")
            .then(node(NodeKind::ComplianceCheck, "compliance_check", 0, |_| {
                Err(ComplyError::validation("obligation list malformed"))
            }))
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert!(matches!(out.verdict, Verdict::Failed(ref f) if f.class == ErrorClass::Validation));
        assert_eq!(out.state.workflow_status, WorkflowStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_is_transient_failure() {
        let graph = NodeGraph::builder("slow")
            .then(collector("evidence", "late", 10_000))
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        let failure = out.failure().unwrap();
        assert_eq!(failure.cause, FailureCause::Timeout);
        assert_eq!(failure.class, ErrorClass::Transient);
        assert!(out.state.evidence.is_empty());
    }

    #[tokio::test]
    async fn test_goto_missing_node_is_graph_failure() {
        let graph = NodeGraph::builder("dangling")
            .then(node(NodeKind::ComplianceCheck, "compliance_check", 0, |s| {
                Ok(NodeOutcome::goto(s, NodeKind::Reporting))
            }))
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert!(matches!(
            out.verdict,
            Verdict::Failed(Failure { cause: FailureCause::InvalidRoute, .. })
        ));
    }

    #[tokio::test]
    async fn test_step_limit_stops_loops() {
        let graph = NodeGraph::builder("loop")
            .then(passthrough(NodeKind::EvidenceCollection))
            .then(node(NodeKind::ComplianceCheck, "compliance_check", 0, |s| {
                Ok(NodeOutcome::goto(s, NodeKind::EvidenceCollection))
            }))
            .on_error(handler(3))
            .build()
            .unwrap();

        let out = GraphExecutor::new(limits())
            .run(&graph, state(), &CancellationToken::new())
            .await;
        assert_eq!(out.steps, 16);
        assert!(matches!(
            out.verdict,
            Verdict::Failed(Failure { cause: FailureCause::StepLimit, .. })
        ));
    }

    #[tokio::test]
    async fn test_history_rewrite_is_rejected() {
        let graph = NodeGraph::builder("rewrite")
            .then(node(NodeKind::Reporting, "reporting", 0, |mut s| {
                s.evidence.clear();
                Ok(NodeOutcome::next(s))
            }))
            .on_error(handler(3))
            .build()
            .unwrap();

        let start = accumulate_evidence(&state(), vec![EvidenceItem::new("keep", "s", "r", Utc::now())]);
        let out = GraphExecutor::new(limits())
            .run(&graph, start, &CancellationToken::new())
            .await;
        assert!(matches!(
            out.verdict,
            Verdict::Failed(Failure { cause: FailureCause::InvalidState, .. })
        ));
        assert_eq!(out.state.evidence.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_execution_skips_handler() {
        let graph = NodeGraph::builder("cancel")
            .then(collector("evidence", "e", 1_000))
            .on_error(handler(3))
            .build()
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let out = GraphExecutor::new(limits()).run(&graph, state(), &cancel).await;
        assert_eq!(out.verdict, Verdict::Cancelled);
        assert_eq!(out.state.workflow_status, WorkflowStatus::Cancelled);
        assert_eq!(out.state.error_count, 0);
    }
}
