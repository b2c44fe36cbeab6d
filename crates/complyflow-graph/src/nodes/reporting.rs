//! Reporting — summarizes the case and hands the report to a sink.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use complyflow_core::error::Result;
use complyflow_core::reducers::merge_decisions;
use complyflow_core::state::{ComplianceState, CostTracker, Decision, DecisionKind, WorkflowStatus};
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeKind, NodeOutcome, already_ran, mark_ran};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceReport {
    /// `<case_id>-<trace_id>`: one report per execution.
    pub report_id: String,
    pub case_id: String,
    pub trace_id: String,
    pub objective: String,
    pub framework: Option<String>,
    pub compliant: Option<bool>,
    pub evidence_count: usize,
    pub evidence_sources: Vec<String>,
    pub decision_count: usize,
    pub error_count: u32,
    pub cost: CostTracker,
    pub status: WorkflowStatus,
    pub generated_at: DateTime<Utc>,
}

impl ComplianceReport {
    pub fn from_state(state: &ComplianceState) -> Self {
        let compliant = state.decisions.iter().rev().find_map(|d| match d.kind {
            DecisionKind::Assessment { compliant } => Some(compliant),
            _ => None,
        });
        let mut evidence_sources: Vec<String> = state.evidence.iter().map(|e| e.source.clone()).collect();
        evidence_sources.sort();
        evidence_sources.dedup();

        Self {
            report_id: format!("{}-{}", state.case_id, state.trace_id),
            case_id: state.case_id.clone(),
            trace_id: state.trace_id.clone(),
            objective: state.objective.clone(),
            framework: state.context.as_ref().and_then(|c| c.framework.clone()),
            compliant,
            evidence_count: state.evidence.len(),
            evidence_sources,
            decision_count: state.decisions.len(),
            error_count: state.error_count,
            cost: state.cost_tracker,
            status: state.workflow_status,
            generated_at: Utc::now(),
        }
    }
}

/// Where finished reports go.
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    /// Store the report and return where it went.
    async fn publish(&self, report: &ComplianceReport) -> Result<String>;
}

/// Writes each report as `<dir>/<report_id>.json`. Re-publishing overwrites.
pub struct FileReportSink {
    dir: PathBuf,
}

impl FileReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ReportSink for FileReportSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn publish(&self, report: &ComplianceReport) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{}.json", report.report_id));
        let body = serde_json::to_vec_pretty(report)?;
        tokio::fs::write(&path, body).await?;
        Ok(path.display().to_string())
    }
}

pub struct ReportingNode {
    sink: Arc<dyn ReportSink>,
}

impl ReportingNode {
    pub fn new(sink: Arc<dyn ReportSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl Node for ReportingNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Reporting
    }

    async fn execute(&self, state: ComplianceState) -> Result<NodeOutcome> {
        if already_ran(&state, self.label()) {
            return Ok(NodeOutcome::next(state));
        }
        let report = ComplianceReport::from_state(&state);
        let location = self.sink.publish(&report).await?;
        tracing::info!(
            case_id = %state.case_id,
            trace_id = %state.trace_id,
            "📄 Report {} published to {location}",
            report.report_id
        );

        let next = merge_decisions(
            &state,
            vec![
                Decision::new(
                    self.label(),
                    DecisionKind::Report {
                        report_id: report.report_id.clone(),
                    },
                    format!("report published via {}", self.sink.name()),
                )
                .with_detail(serde_json::json!({ "location": location })),
            ],
        );
        Ok(NodeOutcome::next(mark_ran(&next, self.label())))
    }
}
