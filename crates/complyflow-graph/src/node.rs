//! Node trait and routing types.

use std::time::Duration;

use async_trait::async_trait;
use complyflow_core::error::Result;
use complyflow_core::state::ComplianceState;
use serde::{Deserialize, Serialize};

/// The closed set of node kinds a graph can contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    EvidenceCollection,
    ComplianceCheck,
    Reporting,
    Notification,
    ErrorHandler,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::EvidenceCollection => "evidence_collection",
            NodeKind::ComplianceCheck => "compliance_check",
            NodeKind::Reporting => "reporting",
            NodeKind::Notification => "notification",
            NodeKind::ErrorHandler => "error_handler",
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the executor goes after a node returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Follow the graph's sequence to the next stage.
    Next,
    /// Jump to the stage holding this node kind.
    Goto(NodeKind),
    /// Stop: the execution completed.
    End,
    /// The node could not do its job; hand over to the error handler.
    Fail(String),
    /// Error handler only: ask the retry policy for another attempt.
    Retry,
}

/// What a node hands back to the executor.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub state: ComplianceState,
    pub route: Route,
}

impl NodeOutcome {
    pub fn next(state: ComplianceState) -> Self {
        Self { state, route: Route::Next }
    }

    pub fn goto(state: ComplianceState, kind: NodeKind) -> Self {
        Self { state, route: Route::Goto(kind) }
    }

    pub fn end(state: ComplianceState) -> Self {
        Self { state, route: Route::End }
    }

    pub fn fail(state: ComplianceState, reason: impl Into<String>) -> Self {
        Self { state, route: Route::Fail(reason.into()) }
    }

    pub fn retry(state: ComplianceState) -> Self {
        Self { state, route: Route::Retry }
    }
}

/// A unit of work inside a node graph.
///
/// Nodes must tolerate being re-run with the same input (at-least-once
/// dispatch) and must not remove or rewrite anything already in the state.
#[async_trait]
pub trait Node: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// Name used in timings, logs and decisions. Branches of one parallel
    /// stage that share a kind should return distinct labels.
    fn label(&self) -> &str {
        self.kind().as_str()
    }

    /// Per-node timeout override.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome>;
}

fn last_trace_key(node: &str) -> String {
    format!("{node}.last_trace")
}

/// Whether `node` already finished its work for the current trace.
pub(crate) fn already_ran(state: &ComplianceState, node: &str) -> bool {
    state
        .memory
        .semantic
        .get(&last_trace_key(node))
        .and_then(|v| v.as_str())
        == Some(state.trace_id.as_str())
}

/// Remember that `node` finished its work for the current trace.
pub(crate) fn mark_ran(state: &ComplianceState, node: &str) -> ComplianceState {
    complyflow_core::reducers::upsert_semantic(
        state,
        &last_trace_key(node),
        serde_json::Value::String(state.trace_id.clone()),
    )
}
