//! StateStore trait — the narrow repository interface for case checkpoints.
//!
//! Writes are optimistic: the caller states which version it based its work
//! on, and the store refuses the write with [`ComplyError::Conflict`] if
//! another writer committed in between.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state::ComplianceState;

/// Version number of a case that has never been checkpointed.
pub const NO_VERSION: u64 = 0;

/// A committed snapshot of a case.
#[derive(Debug, Clone, PartialEq)]
pub struct Checkpoint {
    pub state: ComplianceState,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Audit listing entry for one committed checkpoint row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub case_id: String,
    pub trace_id: String,
    pub version: u64,
    pub workflow_status: String,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    fn name(&self) -> &str;

    /// Commit `state` if the case is still at `expected_version`. Returns the new version.
    async fn save(&self, state: &ComplianceState, expected_version: u64) -> Result<u64>;

    /// Latest committed checkpoint of a case, if any.
    async fn load(&self, case_id: &str) -> Result<Option<Checkpoint>>;

    /// Remove every checkpoint of a case. Returns how many rows were removed.
    async fn delete(&self, case_id: &str) -> Result<usize>;

    /// Committed versions of a case, oldest first.
    async fn history(&self, case_id: &str) -> Result<Vec<CheckpointMeta>>;

    /// Connectivity probe used by health checks.
    async fn ping(&self) -> Result<()>;
}
