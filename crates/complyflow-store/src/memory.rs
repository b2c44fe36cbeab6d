//! In-memory checkpoint store with the same versioning rules as SQLite and no durability.
//! Used for tests and `backend = "memory"` dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use complyflow_core::error::{ComplyError, Result};
use complyflow_core::state::ComplianceState;
use complyflow_core::store::{Checkpoint, CheckpointMeta, StateStore};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

struct Row {
    trace_id: String,
    version: u64,
    state_json: String,
    workflow_status: String,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryStateStore {
    cases: Mutex<HashMap<String, Vec<Row>>>,
    offline: AtomicBool,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an unreachable backend: every operation fails with a store error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::Relaxed) {
            Err(ComplyError::Store("memory store is offline".into()))
        } else {
            Ok(())
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<Row>>>> {
        self.cases
            .lock()
            .map_err(|e| ComplyError::Store(format!("memory store lock poisoned: {e}")))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, state: &ComplianceState, expected_version: u64) -> Result<u64> {
        self.check_online()?;
        state.validate()?;
        let json = state.to_json()?;
        let mut cases = self.lock()?;
        let rows = cases.entry(state.case_id.clone()).or_default();
        let actual = rows.iter().map(|r| r.version).max().unwrap_or(0);
        if actual != expected_version {
            return Err(ComplyError::Conflict {
                case_id: state.case_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        let next = actual + 1;
        let row = Row {
            trace_id: state.trace_id.clone(),
            version: next,
            state_json: json,
            workflow_status: state.workflow_status.as_str().to_string(),
            updated_at: Utc::now(),
        };
        match rows.iter_mut().find(|r| r.trace_id == state.trace_id) {
            Some(existing) => *existing = row,
            None => rows.push(row),
        }
        Ok(next)
    }

    async fn load(&self, case_id: &str) -> Result<Option<Checkpoint>> {
        self.check_online()?;
        let cases = self.lock()?;
        let Some(latest) = cases
            .get(case_id)
            .and_then(|rows| rows.iter().max_by_key(|r| r.version))
        else {
            return Ok(None);
        };
        Ok(Some(Checkpoint {
            state: ComplianceState::from_json(&latest.state_json)?,
            version: latest.version,
            updated_at: latest.updated_at,
        }))
    }

    async fn delete(&self, case_id: &str) -> Result<usize> {
        self.check_online()?;
        let mut cases = self.lock()?;
        Ok(cases.remove(case_id).map(|rows| rows.len()).unwrap_or(0))
    }

    async fn history(&self, case_id: &str) -> Result<Vec<CheckpointMeta>> {
        self.check_online()?;
        let cases = self.lock()?;
        let mut out: Vec<CheckpointMeta> = cases
            .get(case_id)
            .map(|rows| {
                rows.iter()
                    .map(|r| CheckpointMeta {
                        case_id: case_id.to_string(),
                        trace_id: r.trace_id.clone(),
                        version: r.version,
                        workflow_status: r.workflow_status.clone(),
                        updated_at: r.updated_at,
                    })
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by_key(|m| m.version);
        Ok(out)
    }

    async fn ping(&self) -> Result<()> {
        self.check_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::store::NO_VERSION;

    #[tokio::test]
    async fn test_conflict_on_stale_version() {
        let store = MemoryStateStore::new();
        let s = ComplianceState::new("case-m", "memory", "RegWatch").unwrap();
        let v1 = store.save(&s, NO_VERSION).await.unwrap();
        store.save(&s, v1).await.unwrap();
        assert!(matches!(
            store.save(&s, v1).await,
            Err(ComplyError::Conflict { .. })
        ));
        // Same trace upserts in place.
        assert_eq!(store.history("case-m").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_offline_store_fails_every_call() {
        let store = MemoryStateStore::new();
        store.set_offline(true);
        assert!(store.ping().await.is_err());
        assert!(store.load("x").await.is_err());
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }
}
