//! # ComplyFlow Graph
//!
//! Node graphs over [`ComplianceState`](complyflow_core::ComplianceState):
//! - [`Node`] trait with a closed [`NodeKind`] set and explicit [`Route`]s
//! - [`NodeGraph`] builder with sequential and parallel stages
//! - [`GraphExecutor`] with timeouts, cancellation and error-handler routing
//! - reference nodes: evidence collection, compliance check, reporting,
//!   notification, error handler

pub mod catalog;
pub mod executor;
pub mod graph;
pub mod node;
pub mod nodes;
pub mod notify;

pub use executor::{
    ExecutionLimits, ExecutionOutcome, Failure, FailureCause, GraphExecutor, GraphPhase, Verdict,
};
pub use graph::{GraphBuilder, GraphRegistry, NodeGraph, Stage};
pub use node::{Node, NodeKind, NodeOutcome, Route};
pub use notify::{LogNotifier, Notification, Notifier, NotifyPriority, WebhookNotifier};
