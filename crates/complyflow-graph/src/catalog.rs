//! Built-in graphs assembled from configuration.

use std::sync::Arc;

use complyflow_core::config::{ComplyConfig, expand_path};
use complyflow_core::error::Result;

use crate::graph::{GraphRegistry, NodeGraph};
use crate::node::Node;
use crate::nodes::{
    ComplianceCheckNode, ErrorHandlerNode, EvidenceCollectionNode, EvidenceSource, FileReportSink,
    HttpEvidenceSource, NotificationNode, ReportingNode, RuleAssessor,
};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};

/// Full review: evidence from every integration in parallel, then assessment,
/// report and notification. Non-compliance skips straight to notification.
pub const EVIDENCE_REVIEW: &str = "evidence_review";
/// Evidence only: keeps the case's evidence fresh between reviews.
pub const EVIDENCE_SWEEP: &str = "evidence_sweep";

pub fn notifiers_from_config(config: &ComplyConfig) -> Vec<Arc<dyn Notifier>> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.notify.webhook_url {
        notifiers.push(Arc::new(WebhookNotifier::new(url, config.notify.webhook_headers.clone())));
    }
    notifiers
}

/// Register the built-in graphs.
pub fn default_registry(config: &ComplyConfig) -> Result<GraphRegistry> {
    let sources: Vec<Arc<dyn EvidenceSource>> = config
        .integrations
        .iter()
        .map(|i| Arc::new(HttpEvidenceSource::new(i)) as Arc<dyn EvidenceSource>)
        .collect();
    let handler: Arc<dyn Node> = Arc::new(ErrorHandlerNode::new(
        config.retry.max_retries,
        config.graph.max_errors,
    ));

    let mut registry = GraphRegistry::new();

    let evidence_stage = || -> Vec<Arc<dyn Node>> {
        if sources.is_empty() {
            vec![Arc::new(EvidenceCollectionNode::new("evidence", Vec::new()))]
        } else {
            EvidenceCollectionNode::per_source(sources.clone())
        }
    };

    registry.register(
        NodeGraph::builder(EVIDENCE_REVIEW)
            .parallel(evidence_stage())
            .then(Arc::new(ComplianceCheckNode::new(Arc::new(RuleAssessor::default()))))
            .then(Arc::new(ReportingNode::new(Arc::new(FileReportSink::new(expand_path(
                &config.reports.dir,
            ))))))
            .then(Arc::new(NotificationNode::new(notifiers_from_config(config))))
            .on_error(handler.clone())
            .build()?,
    );
    registry.register(
        NodeGraph::builder(EVIDENCE_SWEEP)
            .parallel(evidence_stage())
            .on_error(handler)
            .build()?,
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;

    #[test]
    fn test_default_registry() {
        let config = ComplyConfig::from_toml(
            r#"
            [[integrations]]
            name = "github"
            url = "http://localhost:9/evidence"

            [[integrations]]
            name = "okta"
            url = "http://localhost:9/okta"
            "#,
        )
        .unwrap();
        let registry = default_registry(&config).unwrap();
        assert_eq!(registry.names(), vec![EVIDENCE_REVIEW, EVIDENCE_SWEEP]);

        let review = registry.get(EVIDENCE_REVIEW).unwrap();
        assert_eq!(review.stages().len(), 4);
        assert_eq!(review.stages()[0].describe(), "[evidence:github | evidence:okta]");
        assert_eq!(review.position(NodeKind::Notification), Some(3));
    }

    #[test]
    fn test_webhook_notifier_is_optional() {
        let mut config = ComplyConfig::default();
        assert_eq!(notifiers_from_config(&config).len(), 1);
        config.notify.webhook_url = Some("https://hooks.example.com/x".into());
        assert_eq!(notifiers_from_config(&config).len(), 2);
    }
}
