//! Evidence collection — pulls items from integrations and accumulates the valid ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use complyflow_core::config::IntegrationConfig;
use complyflow_core::error::{ComplyError, Result};
use complyflow_core::reducers::{accumulate_evidence, append_episodic, increment_error, merge_decisions};
use complyflow_core::state::{ComplianceState, Decision, DecisionKind, EvidenceItem};
use serde::Deserialize;

use crate::node::{Node, NodeKind, NodeOutcome};

/// An item as delivered by an integration, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawEvidence {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub collected_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload_ref: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl RawEvidence {
    /// Validate into an [`EvidenceItem`]. A missing source falls back to the
    /// integration that produced the item; a missing timestamp to `now`.
    pub fn into_item(self, integration: &str) -> Result<EvidenceItem> {
        let item = EvidenceItem {
            id: self.id.unwrap_or_default(),
            source: self.source.unwrap_or_else(|| integration.to_string()),
            collected_at: self.collected_at.unwrap_or_else(Utc::now),
            payload_ref: self.payload_ref.unwrap_or_default(),
            metadata: self.metadata,
        };
        item.validate()?;
        Ok(item)
    }
}

/// A system evidence is collected from (GitHub, Okta, a ticketing tool, ...).
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, state: &ComplianceState) -> Result<Vec<RawEvidence>>;
}

/// GET a JSON list of evidence items from an HTTP endpoint.
///
/// Accepts either a bare array or `{"items": [...]}`. The request carries
/// `case_id` and `trace_id` as query parameters.
pub struct HttpEvidenceSource {
    name: String,
    url: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    client: reqwest::Client,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EvidencePayload {
    List(Vec<RawEvidence>),
    Wrapped { items: Vec<RawEvidence> },
}

impl HttpEvidenceSource {
    pub fn new(config: &IntegrationConfig) -> Self {
        Self {
            name: config.name.clone(),
            url: config.url.clone(),
            headers: config.headers.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl EvidenceSource for HttpEvidenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, state: &ComplianceState) -> Result<Vec<RawEvidence>> {
        let mut req = self
            .client
            .get(&self.url)
            .query(&[("case_id", &state.case_id), ("trace_id", &state.trace_id)])
            .timeout(self.timeout);
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ComplyError::Timeout(format!("{}: {e}", self.name))
            } else {
                ComplyError::transient(format!("{}: {e}", self.name))
            }
        })?;

        let status = resp.status();
        if status.is_server_error() || status.as_u16() == 408 || status.as_u16() == 429 {
            return Err(ComplyError::transient(format!("{} returned {status}", self.name)));
        }
        if !status.is_success() {
            return Err(ComplyError::terminal(format!("{} rejected the request: {status}", self.name)));
        }

        let payload: EvidencePayload = resp
            .json()
            .await
            .map_err(|e| ComplyError::validation(format!("{} sent malformed evidence: {e}", self.name)))?;
        Ok(match payload {
            EvidencePayload::List(items) => items,
            EvidencePayload::Wrapped { items } => items,
        })
    }
}

/// Collects from each configured source in turn.
///
/// Items whose id is already in the state (or repeated within the batch) are
/// skipped, so re-running the node after a retry adds nothing twice. Invalid
/// items are rejected with a decision and count as errors.
pub struct EvidenceCollectionNode {
    label: String,
    sources: Vec<Arc<dyn EvidenceSource>>,
}

impl EvidenceCollectionNode {
    pub fn new(label: &str, sources: Vec<Arc<dyn EvidenceSource>>) -> Self {
        Self {
            label: label.to_string(),
            sources,
        }
    }

    /// One node per source, labelled `evidence:<source>`, for a parallel stage.
    pub fn per_source(sources: Vec<Arc<dyn EvidenceSource>>) -> Vec<Arc<dyn Node>> {
        sources
            .into_iter()
            .map(|source| {
                let label = format!("evidence:{}", source.name());
                Arc::new(Self::new(&label, vec![source])) as Arc<dyn Node>
            })
            .collect()
    }
}

#[async_trait]
impl Node for EvidenceCollectionNode {
    fn kind(&self) -> NodeKind {
        NodeKind::EvidenceCollection
    }

    fn label(&self) -> &str {
        &self.label
    }

    async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome> {
        let mut next = state;
        let mut accepted = 0usize;
        let mut skipped = 0usize;
        let mut rejected = 0usize;

        for source in &self.sources {
            let raw = source.fetch(&next).await?;
            let mut fresh: Vec<EvidenceItem> = Vec::new();
            let mut rejections: Vec<Decision> = Vec::new();

            for item in raw {
                let claimed_id = item.id.clone().unwrap_or_default();
                match item.into_item(source.name()) {
                    Ok(item) => {
                        if next.has_evidence(&item.id) || fresh.iter().any(|f| f.id == item.id) {
                            skipped += 1;
                        } else {
                            fresh.push(item);
                        }
                    }
                    Err(e) => {
                        rejected += 1;
                        next = increment_error(&next);
                        rejections.push(
                            Decision::new(
                                &self.label,
                                DecisionKind::EvidenceRejected { evidence_id: claimed_id },
                                e.to_string(),
                            )
                            .with_detail(serde_json::json!({ "source": source.name() })),
                        );
                    }
                }
            }

            accepted += fresh.len();
            next = accumulate_evidence(&next, fresh);
            next = merge_decisions(&next, rejections);
        }

        tracing::info!(
            case_id = %next.case_id,
            trace_id = %next.trace_id,
            node = %self.label,
            "📥 Evidence: {accepted} accepted, {skipped} already present, {rejected} rejected"
        );
        let next = append_episodic(
            &next,
            &self.label,
            format!("collected {accepted} item(s), skipped {skipped}, rejected {rejected}"),
        );
        Ok(NodeOutcome::next(next))
    }
}
