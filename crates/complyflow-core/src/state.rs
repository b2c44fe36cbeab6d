//! ComplianceState — the unit of work threaded through every node of a task execution.
//!
//! A state belongs to exactly one compliance case (`case_id`) and one execution
//! (`trace_id`). Evidence and decisions accumulate across executions of the same
//! case; counters and the trace are reset for each new execution.

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ComplyError, ErrorClass, Result};

/// The logical role driving an execution step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Actor {
    PolicyAuthor,
    EvidenceCollector,
    RegWatch,
    FilingScheduler,
}

impl Actor {
    pub const ALL: [Actor; 4] = [
        Actor::PolicyAuthor,
        Actor::EvidenceCollector,
        Actor::RegWatch,
        Actor::FilingScheduler,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Actor::PolicyAuthor => "PolicyAuthor",
            Actor::EvidenceCollector => "EvidenceCollector",
            Actor::RegWatch => "RegWatch",
            Actor::FilingScheduler => "FilingScheduler",
        }
    }
}

impl FromStr for Actor {
    type Err = ComplyError;

    /// Case-sensitive: `"policyauthor"` is rejected.
    fn from_str(s: &str) -> Result<Self> {
        Actor::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| ComplyError::validation(format!("unknown actor '{s}'")))
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }
}

impl FromStr for WorkflowStatus {
    type Err = ComplyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "in_progress" => Ok(WorkflowStatus::InProgress),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(ComplyError::validation(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Organization the case is run for.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrganizationProfile {
    pub name: String,
    #[serde(default)]
    pub industry: Option<String>,
    #[serde(default)]
    pub jurisdiction: Option<String>,
}

/// A single obligation under the applicable framework.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub id: String,
    pub description: String,
    /// Evidence sources that satisfy this obligation (e.g. "github", "okta").
    #[serde(default)]
    pub required_sources: Vec<String>,
}

/// Optional case context: who, under which framework, owing what.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ComplianceContext {
    #[serde(default)]
    pub organization: Option<OrganizationProfile>,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub obligations: Vec<Obligation>,
}

/// One collected piece of evidence. The payload itself lives in external storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub id: String,
    pub source: String,
    pub collected_at: DateTime<Utc>,
    pub payload_ref: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl EvidenceItem {
    pub fn new(id: &str, source: &str, payload_ref: &str, collected_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            source: source.to_string(),
            collected_at,
            payload_ref: payload_ref.to_string(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Required-field check.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = [
            ("id", self.id.as_str()),
            ("source", self.source.as_str()),
            ("payload_ref", self.payload_ref.as_str()),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(k, _)| k)
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ComplyError::validation(format!(
                "evidence item missing required field(s): {}",
                missing.join(", ")
            )))
        }
    }
}

/// What kind of decision a record documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecisionKind {
    /// Outcome of a compliance assessment.
    Assessment { compliant: bool },
    /// An evidence item was rejected during validation.
    EvidenceRejected { evidence_id: String },
    /// A node failed; recorded by the graph executor.
    Failure { class: ErrorClass },
    /// The error handler chose how to proceed after a failure.
    Recovery { retry: bool },
    /// A report was produced.
    Report { report_id: String },
    /// A notification was sent.
    Notification { channel: String },
    Note,
}

/// An auditable decision taken during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub node: String,
    pub kind: DecisionKind,
    pub summary: String,
    #[serde(default)]
    pub detail: serde_json::Value,
    pub decided_at: DateTime<Utc>,
}

impl Decision {
    pub fn new(node: &str, kind: DecisionKind, summary: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            node: node.to_string(),
            kind,
            summary: summary.into(),
            detail: serde_json::Value::Null,
            decided_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// Running totals of what an execution chain has spent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostTracker {
    pub tokens: u64,
    pub cost_usd: f64,
}

/// An increment to [`CostTracker`]. Signed so that negative input can be rejected.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CostDelta {
    pub tokens: i64,
    pub cost_usd: f64,
}

impl CostDelta {
    pub fn new(tokens: i64, cost_usd: f64) -> Self {
        Self { tokens, cost_usd }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tokens < 0 {
            return Err(ComplyError::validation(format!(
                "negative token delta {}",
                self.tokens
            )));
        }
        if !self.cost_usd.is_finite() || self.cost_usd < 0.0 {
            return Err(ComplyError::validation(format!(
                "invalid cost delta {}",
                self.cost_usd
            )));
        }
        Ok(())
    }

    pub fn is_zero(&self) -> bool {
        self.tokens == 0 && self.cost_usd == 0.0
    }
}

/// Something a node chose to remember about this execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodicEntry {
    pub at: DateTime<Utc>,
    pub node: String,
    pub content: String,
}

/// Episodic log (appended) plus semantic facts (upserted by key).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Memory {
    #[serde(default)]
    pub episodic: Vec<EpisodicEntry>,
    #[serde(default)]
    pub semantic: BTreeMap<String, serde_json::Value>,
}

/// The state threaded through a task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceState {
    pub case_id: String,
    pub trace_id: String,
    pub objective: String,
    pub actor: Actor,
    #[serde(default)]
    pub context: Option<ComplianceContext>,
    #[serde(default)]
    pub evidence: Vec<EvidenceItem>,
    #[serde(default)]
    pub decisions: Vec<Decision>,
    #[serde(default)]
    pub cost_tracker: CostTracker,
    #[serde(default)]
    pub memory: Memory,
    pub workflow_status: WorkflowStatus,
    #[serde(default)]
    pub node_execution_times: BTreeMap<String, Duration>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_count: u32,
}

impl ComplianceState {
    /// Build a fresh state, parsing the actor case-sensitively.
    pub fn new(case_id: &str, objective: &str, actor: &str) -> Result<Self> {
        let actor = Actor::from_str(actor)?;
        Self::for_actor(case_id, objective, actor)
    }

    /// Build a fresh state for an already-typed actor.
    pub fn for_actor(case_id: &str, objective: &str, actor: Actor) -> Result<Self> {
        let state = Self {
            case_id: case_id.to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            objective: objective.to_string(),
            actor,
            context: None,
            evidence: Vec::new(),
            decisions: Vec::new(),
            cost_tracker: CostTracker::default(),
            memory: Memory::default(),
            workflow_status: WorkflowStatus::Pending,
            node_execution_times: BTreeMap::new(),
            retry_count: 0,
            error_count: 0,
        };
        state.validate()?;
        Ok(state)
    }

    pub fn with_context(mut self, context: ComplianceContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Check every invariant that can be verified on a single snapshot.
    pub fn validate(&self) -> Result<()> {
        if self.case_id.trim().is_empty() {
            return Err(ComplyError::validation("case_id must not be empty"));
        }
        if self.objective.trim().is_empty() {
            return Err(ComplyError::validation("objective must not be empty"));
        }
        if self.trace_id.trim().is_empty() {
            return Err(ComplyError::validation("trace_id must not be empty"));
        }
        uuid::Uuid::parse_str(&self.trace_id).map_err(|e| {
            ComplyError::validation(format!("malformed trace_id '{}': {e}", self.trace_id))
        })?;
        if !self.cost_tracker.cost_usd.is_finite() || self.cost_tracker.cost_usd < 0.0 {
            return Err(ComplyError::validation("cost_tracker.cost_usd must be >= 0"));
        }
        Ok(())
    }

    /// Derive the state for the next execution of the same case: a new trace,
    /// fresh counters and timings, accumulated audit data carried over.
    pub fn next_execution(&self, objective: &str, actor: Actor) -> Result<Self> {
        let mut next = self.clone();
        next.trace_id = uuid::Uuid::new_v4().to_string();
        next.objective = objective.to_string();
        next.actor = actor;
        next.workflow_status = WorkflowStatus::Pending;
        next.node_execution_times.clear();
        next.retry_count = 0;
        next.error_count = 0;
        next.validate()?;
        Ok(next)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize and re-validate.
    pub fn from_json(json: &str) -> Result<Self> {
        let state: Self = serde_json::from_str(json)
            .map_err(|e| ComplyError::validation(format!("invalid state JSON: {e}")))?;
        state.validate()?;
        Ok(state)
    }

    pub fn has_evidence(&self, id: &str) -> bool {
        self.evidence.iter().any(|e| e.id == id)
    }

    pub fn evidence_ids(&self) -> HashSet<&str> {
        self.evidence.iter().map(|e| e.id.as_str()).collect()
    }

    /// The most recent failure recorded by the executor, if any.
    pub fn last_failure(&self) -> Option<(&Decision, ErrorClass)> {
        self.decisions.iter().rev().find_map(|d| match d.kind {
            DecisionKind::Failure { class } => Some((d, class)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_valid_actors_construct() {
        for actor in ["PolicyAuthor", "EvidenceCollector", "RegWatch", "FilingScheduler"] {
            let state = ComplianceState::new("case-1", "Quarterly SOC2 review", actor).unwrap();
            assert_eq!(state.actor.as_str(), actor);
            assert_eq!(state.workflow_status, WorkflowStatus::Pending);
        }
    }

    #[test]
    fn test_invalid_actors_rejected() {
        for actor in ["policyauthor", "POLICYAUTHOR", "Regwatch", "", "Auditor", " RegWatch"] {
            let err = ComplianceState::new("case-1", "objective", actor).unwrap_err();
            assert!(matches!(err, ComplyError::Validation(_)), "{actor}: {err}");
        }
    }

    #[test]
    fn test_empty_required_fields_rejected() {
        assert!(matches!(
            ComplianceState::new("", "objective", "RegWatch"),
            Err(ComplyError::Validation(_))
        ));
        assert!(matches!(
            ComplianceState::new("case", "   ", "RegWatch"),
            Err(ComplyError::Validation(_))
        ));
    }

    #[test]
    fn test_malformed_trace_id_rejected() {
        let mut state = ComplianceState::new("case", "objective", "RegWatch").unwrap();
        state.trace_id = "not-a-uuid".into();
        assert!(matches!(state.validate(), Err(ComplyError::Validation(_))));
    }

    #[test]
    fn test_workflow_status_parse() {
        assert_eq!(
            "in_progress".parse::<WorkflowStatus>().unwrap(),
            WorkflowStatus::InProgress
        );
        assert!("Completed".parse::<WorkflowStatus>().is_err());
        assert!("done".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_unknown_actor_in_json_rejected() {
        let state = ComplianceState::new("case", "objective", "RegWatch").unwrap();
        let json = state.to_json().unwrap().replace("\"RegWatch\"", "\"regwatch\"");
        assert!(matches!(
            ComplianceState::from_json(&json),
            Err(ComplyError::Validation(_))
        ));
    }

    #[test]
    fn test_json_round_trip() {
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let mut state = ComplianceState::new("case-rt", "Round trip", "EvidenceCollector")
            .unwrap()
            .with_context(ComplianceContext {
                organization: Some(OrganizationProfile {
                    name: "Acme".into(),
                    industry: Some("fintech".into()),
                    jurisdiction: Some("EU".into()),
                }),
                framework: Some("SOC2".into()),
                obligations: vec![Obligation {
                    id: "CC6.1".into(),
                    description: "Logical access".into(),
                    required_sources: vec!["okta".into()],
                }],
            });
        let mut item = EvidenceItem::new("ev-1", "okta", "s3://bucket/ev-1.json", at);
        item.metadata = serde_json::json!({"users": 42});
        state.evidence.push(item);
        state.decisions.push(
            Decision::new("compliance_check", DecisionKind::Assessment { compliant: true }, "ok")
                .with_detail(serde_json::json!({"score": 0.93})),
        );
        state.cost_tracker = CostTracker {
            tokens: 1200,
            cost_usd: 0.375,
        };
        state.memory.episodic.push(EpisodicEntry {
            at,
            node: "evidence_collection".into(),
            content: "collected 1 item".into(),
        });
        state
            .memory
            .semantic
            .insert("framework".into(), serde_json::json!("SOC2"));
        state
            .node_execution_times
            .insert("evidence_collection".into(), Duration::from_millis(1534));
        state.workflow_status = WorkflowStatus::InProgress;
        state.retry_count = 1;
        state.error_count = 2;

        let json = state.to_json().unwrap();
        let back = ComplianceState::from_json(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_accumulated_costs_survive_json() {
        let mut state = ComplianceState::new("case-cost", "Costs", "EvidenceCollector").unwrap();
        for i in 1..=20_000u64 {
            let delta = CostDelta::new(17, (i % 997) as f64 * 0.000173 + 0.0001);
            state = crate::reducers::update_cost_tracker(&state, delta).unwrap();
            let back = ComplianceState::from_json(&state.to_json().unwrap()).unwrap();
            assert_eq!(
                back.cost_tracker.cost_usd.to_bits(),
                state.cost_tracker.cost_usd.to_bits(),
                "cost drifted after {i} updates"
            );
        }
        assert_eq!(state.cost_tracker.tokens, 17 * 20_000);
    }

    #[test]
    fn test_next_execution_resets_counters() {
        let mut state = ComplianceState::new("case", "first", "RegWatch").unwrap();
        state.retry_count = 2;
        state.error_count = 3;
        state.evidence.push(EvidenceItem::new("e", "s", "p", Utc::now()));
        state.workflow_status = WorkflowStatus::Completed;

        let next = state.next_execution("second", Actor::FilingScheduler).unwrap();
        assert_ne!(next.trace_id, state.trace_id);
        assert_eq!(next.retry_count, 0);
        assert_eq!(next.error_count, 0);
        assert_eq!(next.evidence.len(), 1);
        assert_eq!(next.workflow_status, WorkflowStatus::Pending);
        assert_eq!(next.actor, Actor::FilingScheduler);
    }

    #[test]
    fn test_evidence_item_validation() {
        let ok = EvidenceItem::new("id", "src", "ref", Utc::now());
        assert!(ok.validate().is_ok());
        let bad = EvidenceItem::new("", "src", " ", Utc::now());
        let msg = bad.validate().unwrap_err().to_string();
        assert!(msg.contains("id"));
        assert!(msg.contains("payload_ref"));
    }
}
