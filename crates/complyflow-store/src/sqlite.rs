//! SQLite checkpoint store with optimistic per-case versioning.
//!
//! One row per `(case_id, trace_id)`; every commit bumps the case version, so
//! the newest row of a case is always its latest committed state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use complyflow_core::error::{ComplyError, Result};
use complyflow_core::state::ComplianceState;
use complyflow_core::store::{Checkpoint, CheckpointMeta, StateStore};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Mutex;

pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ComplyError {
    ComplyError::Store(e.to_string())
}

fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| ComplyError::Store(format!("corrupt checkpoint timestamp '{s}': {e}")))
}

impl SqliteStateStore {
    /// Open or create the checkpoint database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        // Concurrent readers while a writer holds the lock.
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        Self::init(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                case_id TEXT NOT NULL,
                trace_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                workflow_status TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (case_id, trace_id)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_checkpoints_case_version
                ON checkpoints (case_id, version);",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ComplyError::Store(format!("checkpoint db lock poisoned: {e}")))
    }

    fn current_version(conn: &Connection, case_id: &str) -> Result<u64> {
        let version: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM checkpoints WHERE case_id = ?1",
                [case_id],
                |r| r.get(0),
            )
            .map_err(db_err)?;
        Ok(version.max(0) as u64)
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn save(&self, state: &ComplianceState, expected_version: u64) -> Result<u64> {
        state.validate()?;
        let json = state.to_json()?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let actual = Self::current_version(&tx, &state.case_id)?;
        if actual != expected_version {
            // Dropping the transaction rolls it back.
            return Err(ComplyError::Conflict {
                case_id: state.case_id.clone(),
                expected: expected_version,
                actual,
            });
        }
        let next = actual + 1;
        tx.execute(
            "INSERT INTO checkpoints (case_id, trace_id, version, state_json, workflow_status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (case_id, trace_id) DO UPDATE SET
                version = excluded.version,
                state_json = excluded.state_json,
                workflow_status = excluded.workflow_status,
                updated_at = excluded.updated_at",
            rusqlite::params![
                state.case_id,
                state.trace_id,
                next as i64,
                json,
                state.workflow_status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;

        tracing::debug!(
            case_id = %state.case_id,
            trace_id = %state.trace_id,
            "💾 Checkpoint committed v{next}"
        );
        Ok(next)
    }

    async fn load(&self, case_id: &str) -> Result<Option<Checkpoint>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT state_json, version, updated_at FROM checkpoints
                 WHERE case_id = ?1 ORDER BY version DESC LIMIT 1",
                [case_id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        match row {
            Some((json, version, updated_at)) => Ok(Some(Checkpoint {
                state: ComplianceState::from_json(&json)?,
                version: version.max(0) as u64,
                updated_at: parse_time(&updated_at)?,
            })),
            None => Ok(None),
        }
    }

    async fn delete(&self, case_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM checkpoints WHERE case_id = ?1", [case_id])
            .map_err(db_err)?;
        if removed > 0 {
            tracing::info!("🗑️ Deleted {removed} checkpoint(s) for case '{case_id}'");
        }
        Ok(removed)
    }

    async fn history(&self, case_id: &str) -> Result<Vec<CheckpointMeta>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT case_id, trace_id, version, workflow_status, updated_at FROM checkpoints
                 WHERE case_id = ?1 ORDER BY version ASC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map([case_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })
            .map_err(db_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(case_id, trace_id, version, workflow_status, updated_at)| {
                Ok(CheckpointMeta {
                    case_id,
                    trace_id,
                    version: version.max(0) as u64,
                    workflow_status,
                    updated_at: parse_time(&updated_at)?,
                })
            })
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |r| r.get::<_, i64>(0))
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use complyflow_core::reducers::{accumulate_evidence, merge_decisions};
    use complyflow_core::state::{Decision, DecisionKind, EvidenceItem, WorkflowStatus};
    use complyflow_core::store::NO_VERSION;

    fn state(case: &str) -> ComplianceState {
        ComplianceState::new(case, "Checkpoint test", "EvidenceCollector").unwrap()
    }

    #[tokio::test]
    async fn test_save_and_load_latest() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        assert!(store.load("case-a").await.unwrap().is_none());

        let s1 = state("case-a");
        let v1 = store.save(&s1, NO_VERSION).await.unwrap();
        assert_eq!(v1, 1);

        let s2 = accumulate_evidence(&s1, vec![EvidenceItem::new("e1", "okta", "ref", Utc::now())]);
        let v2 = store.save(&s2, v1).await.unwrap();
        assert_eq!(v2, 2);

        let cp = store.load("case-a").await.unwrap().unwrap();
        assert_eq!(cp.version, 2);
        assert_eq!(cp.state, s2);
    }

    #[tokio::test]
    async fn test_concurrent_writers_same_base_conflict() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let base = state("case-c");
        let v1 = store.save(&base, NO_VERSION).await.unwrap();

        let first = accumulate_evidence(&base, vec![EvidenceItem::new("a", "github", "r", Utc::now())]);
        let second = merge_decisions(&base, vec![Decision::new("x", DecisionKind::Note, "second")]);

        assert_eq!(store.save(&first, v1).await.unwrap(), 2);
        let err = store.save(&second, v1).await.unwrap_err();
        assert!(matches!(
            err,
            ComplyError::Conflict { expected: 1, actual: 2, .. }
        ));
        assert!(err.is_retryable());

        // The first writer's evidence survived.
        let cp = store.load("case-c").await.unwrap().unwrap();
        assert_eq!(cp.state.evidence.len(), 1);
        assert!(cp.state.decisions.is_empty());
    }

    #[tokio::test]
    async fn test_cases_do_not_contend() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        assert_eq!(store.save(&state("one"), NO_VERSION).await.unwrap(), 1);
        assert_eq!(store.save(&state("two"), NO_VERSION).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_history_and_delete() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let first = state("case-h");
        let v = store.save(&first, NO_VERSION).await.unwrap();
        let mut second = first
            .next_execution("second run", first.actor)
            .unwrap();
        second.workflow_status = WorkflowStatus::Completed;
        store.save(&second, v).await.unwrap();

        let history = store.history("case-h").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].trace_id, first.trace_id);
        assert_eq!(history[1].workflow_status, "completed");

        assert_eq!(store.delete("case-h").await.unwrap(), 2);
        assert!(store.load("case-h").await.unwrap().is_none());
        store.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_timestamp_is_store_error() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        store.save(&state("case-t"), NO_VERSION).await.unwrap();
        store
            .lock()
            .unwrap()
            .execute("UPDATE checkpoints SET updated_at = 'yesterday' WHERE case_id = 'case-t'", [])
            .unwrap();

        assert!(matches!(store.load("case-t").await, Err(ComplyError::Store(_))));
        assert!(matches!(store.history("case-t").await, Err(ComplyError::Store(_))));
    }

    #[tokio::test]
    async fn test_file_backed_store_survives_reopen() {
        let dir = std::env::temp_dir().join("complyflow-test-sqlite-store");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("checkpoints.db");
        std::fs::remove_file(&path).ok();

        let s = state("case-f");
        {
            let store = SqliteStateStore::open(&path).unwrap();
            store.save(&s, NO_VERSION).await.unwrap();
        }
        let reopened = SqliteStateStore::open(&path).unwrap();
        let cp = reopened.load("case-f").await.unwrap().unwrap();
        assert_eq!(cp.state.trace_id, s.trace_id);
        std::fs::remove_dir_all(&dir).ok();
    }
}
