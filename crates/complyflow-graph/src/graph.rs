//! Node graphs — a named sequence of stages with conditional jumps.
//!
//! ```text
//! evidence_review:
//!   [evidence(github) | evidence(okta) | evidence(jira)]   ← parallel stage
//!     → compliance_check ──(escalate)──┐
//!     → reporting                      │
//!     → notification  ◄────────────────┘
//!   on error → error_handler
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use complyflow_core::error::{ComplyError, Result};

use crate::node::{Node, NodeKind};

/// One step of a graph.
#[derive(Clone)]
pub enum Stage {
    Single(Arc<dyn Node>),
    /// Branches run concurrently on copies of the same input state and are
    /// merged with the reducers in completion order.
    Parallel(Vec<Arc<dyn Node>>),
}

impl Stage {
    pub fn contains(&self, kind: NodeKind) -> bool {
        match self {
            Stage::Single(node) => node.kind() == kind,
            Stage::Parallel(nodes) => nodes.iter().any(|n| n.kind() == kind),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Stage::Single(node) => node.label().to_string(),
            Stage::Parallel(nodes) => {
                let labels: Vec<&str> = nodes.iter().map(|n| n.label()).collect();
                format!("[{}]", labels.join(" | "))
            }
        }
    }
}

/// A validated, executable graph.
pub struct NodeGraph {
    name: String,
    stages: Vec<Stage>,
    error_handler: Arc<dyn Node>,
}

impl NodeGraph {
    pub fn builder(name: &str) -> GraphBuilder {
        GraphBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn error_handler(&self) -> &Arc<dyn Node> {
        &self.error_handler
    }

    /// Index of the stage holding `kind`.
    pub fn position(&self, kind: NodeKind) -> Option<usize> {
        self.stages.iter().position(|s| s.contains(kind))
    }
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stages: Vec<String> = self.stages.iter().map(Stage::describe).collect();
        f.debug_struct("NodeGraph")
            .field("name", &self.name)
            .field("stages", &stages)
            .field("error_handler", &self.error_handler.label())
            .finish()
    }
}

pub struct GraphBuilder {
    name: String,
    stages: Vec<Stage>,
    error_handler: Option<Arc<dyn Node>>,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stages: Vec::new(),
            error_handler: None,
        }
    }

    /// Append a sequential stage.
    pub fn then(mut self, node: Arc<dyn Node>) -> Self {
        self.stages.push(Stage::Single(node));
        self
    }

    /// Append a parallel fan-out stage.
    pub fn parallel(mut self, nodes: Vec<Arc<dyn Node>>) -> Self {
        self.stages.push(Stage::Parallel(nodes));
        self
    }

    pub fn on_error(mut self, handler: Arc<dyn Node>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Check the graph's shape and freeze it.
    pub fn build(self) -> Result<NodeGraph> {
        if self.name.trim().is_empty() {
            return Err(ComplyError::Graph("graph name must not be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(ComplyError::Graph(format!("graph '{}' has no stages", self.name)));
        }
        let error_handler = self.error_handler.ok_or_else(|| {
            ComplyError::Graph(format!("graph '{}' has no error handler", self.name))
        })?;
        if error_handler.kind() != NodeKind::ErrorHandler {
            return Err(ComplyError::Graph(format!(
                "graph '{}': on_error node must be an error handler, got {}",
                self.name,
                error_handler.kind()
            )));
        }

        // Each kind lives in exactly one stage so that Goto is unambiguous.
        let mut seen: HashSet<NodeKind> = HashSet::new();
        for stage in &self.stages {
            let kinds: HashSet<NodeKind> = match stage {
                Stage::Single(node) => HashSet::from([node.kind()]),
                Stage::Parallel(nodes) => {
                    if nodes.is_empty() {
                        return Err(ComplyError::Graph(format!(
                            "graph '{}' has an empty parallel stage",
                            self.name
                        )));
                    }
                    let labels: HashSet<&str> = nodes.iter().map(|n| n.label()).collect();
                    if labels.len() != nodes.len() {
                        return Err(ComplyError::Graph(format!(
                            "graph '{}': parallel branches need distinct labels",
                            self.name
                        )));
                    }
                    nodes.iter().map(|n| n.kind()).collect()
                }
            };
            if kinds.contains(&NodeKind::ErrorHandler) {
                return Err(ComplyError::Graph(format!(
                    "graph '{}': the error handler cannot be a regular stage",
                    self.name
                )));
            }
            if let Some(dup) = kinds.iter().find(|k| seen.contains(k)) {
                return Err(ComplyError::Graph(format!(
                    "graph '{}': node kind {dup} appears in more than one stage",
                    self.name
                )));
            }
            seen.extend(kinds);
        }

        Ok(NodeGraph {
            name: self.name,
            stages: self.stages,
            error_handler,
        })
    }
}

/// Graphs available to the scheduler, by name.
#[derive(Default)]
pub struct GraphRegistry {
    graphs: HashMap<String, Arc<NodeGraph>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, graph: NodeGraph) {
        tracing::info!("🧩 Registered graph '{}' ({} stages)", graph.name(), graph.stages().len());
        self.graphs.insert(graph.name().to_string(), Arc::new(graph));
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeGraph>> {
        self.graphs.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.graphs.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.graphs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeOutcome;
    use async_trait::async_trait;
    use complyflow_core::state::ComplianceState;

    struct Stub(NodeKind, &'static str);

    #[async_trait]
    impl Node for Stub {
        fn kind(&self) -> NodeKind {
            self.0
        }
        fn label(&self) -> &str {
            self.1
        }
        async fn execute(&self, state: ComplianceState) -> complyflow_core::Result<NodeOutcome> {
            Ok(NodeOutcome::next(state))
        }
    }

    fn stub(kind: NodeKind, label: &'static str) -> Arc<dyn Node> {
        Arc::new(Stub(kind, label))
    }

    fn handler() -> Arc<dyn Node> {
        stub(NodeKind::ErrorHandler, "error_handler")
    }

    #[test]
    fn test_build_valid_graph() {
        let graph = NodeGraph::builder("review")
            .parallel(vec![
                stub(NodeKind::EvidenceCollection, "evidence:github"),
                stub(NodeKind::EvidenceCollection, "evidence:okta"),
            ])
            .then(stub(NodeKind::ComplianceCheck, "compliance_check"))
            .then(stub(NodeKind::Notification, "notification"))
            .on_error(handler())
            .build()
            .unwrap();
        assert_eq!(graph.position(NodeKind::Notification), Some(2));
        assert_eq!(graph.position(NodeKind::EvidenceCollection), Some(0));
        assert_eq!(graph.position(NodeKind::Reporting), None);
    }

    #[test]
    fn test_rejects_malformed_graphs() {
        assert!(NodeGraph::builder("empty").on_error(handler()).build().is_err());
        assert!(
            NodeGraph::builder("no-handler")
                .then(stub(NodeKind::Reporting, "reporting"))
                .build()
                .is_err()
        );
        assert!(
            NodeGraph::builder("dup")
                .then(stub(NodeKind::Reporting, "reporting"))
                .then(stub(NodeKind::Reporting, "reporting-2"))
                .on_error(handler())
                .build()
                .is_err()
        );
        assert!(
            NodeGraph::builder("empty-parallel")
                .parallel(vec![])
                .on_error(handler())
                .build()
                .is_err()
        );
        assert!(
            NodeGraph::builder("same-labels")
                .parallel(vec![
                    stub(NodeKind::EvidenceCollection, "evidence"),
                    stub(NodeKind::EvidenceCollection, "evidence"),
                ])
                .on_error(handler())
                .build()
                .is_err()
        );
        assert!(
            NodeGraph::builder("wrong-handler")
                .then(stub(NodeKind::Reporting, "reporting"))
                .on_error(stub(NodeKind::Notification, "notification"))
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = GraphRegistry::new();
        registry.register(
            NodeGraph::builder("b")
                .then(stub(NodeKind::Reporting, "reporting"))
                .on_error(handler())
                .build()
                .unwrap(),
        );
        registry.register(
            NodeGraph::builder("a")
                .then(stub(NodeKind::Reporting, "reporting"))
                .on_error(handler())
                .build()
                .unwrap(),
        );
        assert!(registry.contains("a"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
