//! Reducers — pure functions that fold partial updates into a [`ComplianceState`].
//!
//! Every reducer is append-only or additive, so partial results produced
//! concurrently can be merged in any order without losing data. Reducers never
//! de-duplicate: idempotency is the calling node's job.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{ComplyError, Result};
use crate::state::{
    ComplianceContext, ComplianceState, CostDelta, Decision, EpisodicEntry, EvidenceItem,
    WorkflowStatus,
};

/// `state.evidence ++ new_items`.
pub fn accumulate_evidence(state: &ComplianceState, new_items: Vec<EvidenceItem>) -> ComplianceState {
    let mut next = state.clone();
    next.evidence.extend(new_items);
    next
}

/// Append decisions in arrival order.
pub fn merge_decisions(state: &ComplianceState, new_decisions: Vec<Decision>) -> ComplianceState {
    let mut next = state.clone();
    next.decisions.extend(new_decisions);
    next
}

/// Add `delta` to each cost dimension. A negative delta fails and the input state is untouched.
pub fn update_cost_tracker(state: &ComplianceState, delta: CostDelta) -> Result<ComplianceState> {
    delta.validate()?;
    let mut next = state.clone();
    next.cost_tracker.tokens = next
        .cost_tracker
        .tokens
        .checked_add(delta.tokens as u64)
        .ok_or_else(|| ComplyError::validation("token counter overflow"))?;
    next.cost_tracker.cost_usd += delta.cost_usd;
    Ok(next)
}

/// Apply a batch of deltas atomically: either every delta is applied or none.
pub fn update_cost_tracker_all(
    state: &ComplianceState,
    deltas: &[CostDelta],
) -> Result<ComplianceState> {
    deltas.iter().try_fold(state.clone(), |acc, d| update_cost_tracker(&acc, *d))
}

/// Upsert the execution time of `node_name`.
pub fn record_node_time(state: &ComplianceState, node_name: &str, duration: Duration) -> ComplianceState {
    let mut next = state.clone();
    next.node_execution_times.insert(node_name.to_string(), duration);
    next
}

pub fn increment_retry(state: &ComplianceState) -> ComplianceState {
    let mut next = state.clone();
    next.retry_count = next.retry_count.saturating_add(1);
    next
}

pub fn increment_error(state: &ComplianceState) -> ComplianceState {
    let mut next = state.clone();
    next.error_count = next.error_count.saturating_add(1);
    next
}

pub fn append_episodic(state: &ComplianceState, node: &str, content: impl Into<String>) -> ComplianceState {
    let mut next = state.clone();
    next.memory.episodic.push(EpisodicEntry {
        at: Utc::now(),
        node: node.to_string(),
        content: content.into(),
    });
    next
}

pub fn upsert_semantic(state: &ComplianceState, key: &str, value: serde_json::Value) -> ComplianceState {
    let mut next = state.clone();
    next.memory.semantic.insert(key.to_string(), value);
    next
}

pub fn set_status(state: &ComplianceState, status: WorkflowStatus) -> ComplianceState {
    let mut next = state.clone();
    next.workflow_status = status;
    next
}

/// Everything a branch added on top of a base state.
///
/// Because state only grows, the difference between a base snapshot and a
/// later snapshot of the same execution chain is itself a set of reducer
/// inputs. Applying it to another snapshot replays those reducers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    pub evidence: Vec<EvidenceItem>,
    pub decisions: Vec<Decision>,
    pub cost: CostDelta,
    pub episodic: Vec<EpisodicEntry>,
    pub semantic: BTreeMap<String, serde_json::Value>,
    pub node_times: BTreeMap<String, Duration>,
    pub retries: u32,
    pub errors: u32,
    pub context: Option<ComplianceContext>,
    pub status: Option<WorkflowStatus>,
}

impl StateUpdate {
    /// Compute what `later` added on top of `base`.
    ///
    /// Fails when `later` is not a descendant of `base` (different case,
    /// shrunk lists, rewritten history or lowered totals).
    pub fn between(base: &ComplianceState, later: &ComplianceState) -> Result<Self> {
        if base.case_id != later.case_id {
            return Err(ComplyError::validation(format!(
                "cannot diff states of different cases ('{}' vs '{}')",
                base.case_id, later.case_id
            )));
        }
        let evidence = suffix_of(&base.evidence, &later.evidence, "evidence")?;
        let decisions = suffix_of(&base.decisions, &later.decisions, "decisions")?;
        let episodic = suffix_of(&base.memory.episodic, &later.memory.episodic, "episodic memory")?;

        if later.cost_tracker.tokens < base.cost_tracker.tokens
            || later.cost_tracker.cost_usd < base.cost_tracker.cost_usd
        {
            return Err(ComplyError::validation("cost tracker decreased"));
        }
        let cost = CostDelta {
            tokens: i64::try_from(later.cost_tracker.tokens - base.cost_tracker.tokens)
                .map_err(|_| ComplyError::validation("token delta overflow"))?,
            cost_usd: later.cost_tracker.cost_usd - base.cost_tracker.cost_usd,
        };

        if base
            .memory
            .semantic
            .keys()
            .any(|k| !later.memory.semantic.contains_key(k))
        {
            return Err(ComplyError::validation("semantic memory entries were removed"));
        }
        let semantic = later
            .memory
            .semantic
            .iter()
            .filter(|(k, v)| base.memory.semantic.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let node_times = later
            .node_execution_times
            .iter()
            .filter(|(k, v)| base.node_execution_times.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        if later.retry_count < base.retry_count || later.error_count < base.error_count {
            return Err(ComplyError::validation("retry/error counters decreased"));
        }

        Ok(Self {
            evidence,
            decisions,
            cost,
            episodic,
            semantic,
            node_times,
            retries: later.retry_count - base.retry_count,
            errors: later.error_count - base.error_count,
            context: (later.context != base.context).then(|| later.context.clone()).flatten(),
            status: (later.workflow_status != base.workflow_status).then_some(later.workflow_status),
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Fold this update into `state` using the reducers above.
    pub fn apply(&self, state: &ComplianceState) -> Result<ComplianceState> {
        let mut next = accumulate_evidence(state, self.evidence.clone());
        next = merge_decisions(&next, self.decisions.clone());
        if !self.cost.is_zero() {
            next = update_cost_tracker(&next, self.cost)?;
        }
        next.memory.episodic.extend(self.episodic.iter().cloned());
        for (k, v) in &self.semantic {
            next = upsert_semantic(&next, k, v.clone());
        }
        for (k, v) in &self.node_times {
            next = record_node_time(&next, k, *v);
        }
        next.retry_count = next.retry_count.saturating_add(self.retries);
        next.error_count = next.error_count.saturating_add(self.errors);
        if let Some(context) = &self.context {
            next.context = Some(context.clone());
        }
        if let Some(status) = self.status {
            next.workflow_status = status;
        }
        Ok(next)
    }
}

fn suffix_of<T: Clone + PartialEq>(base: &[T], later: &[T], what: &str) -> Result<Vec<T>> {
    if later.len() < base.len() || later[..base.len()] != *base {
        return Err(ComplyError::validation(format!(
            "{what} is not an append-only extension of the base state"
        )));
    }
    Ok(later[base.len()..].to_vec())
}
