//! SQLite persistence for scheduled tasks, so registrations and run
//! metadata survive restarts.

use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use complyflow_core::error::{ComplyError, ErrorClass, Result};
use complyflow_core::state::Actor;
use rusqlite::Connection;

use crate::tasks::{Priority, Schedule, ScheduledTask, TaskError, TaskStatus};

pub struct TaskDb {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ComplyError {
    ComplyError::Store(format!("scheduler db: {e}"))
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

const COLUMNS: &str = "task_id, name, graph, schedule, priority, queue, status, case_id, objective, actor,
     created_at, last_run, next_run, run_count, failure_count, last_error_class, last_error_message, last_error_at";

impl TaskDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory().map_err(db_err)?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduler_tasks (
                task_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                graph TEXT NOT NULL,
                schedule TEXT NOT NULL,          -- JSON: {type: cron|once|interval, ...}
                priority TEXT NOT NULL,
                queue TEXT NOT NULL DEFAULT 'default',
                status TEXT NOT NULL DEFAULT 'pending',
                case_id TEXT NOT NULL,
                objective TEXT NOT NULL,
                actor TEXT NOT NULL,
                created_at TEXT NOT NULL,
                last_run TEXT,
                next_run TEXT,
                run_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                last_error_class TEXT,
                last_error_message TEXT,
                last_error_at TEXT
            );",
        )
        .map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ComplyError::Store(format!("scheduler db lock poisoned: {e}")))
    }

    /// Insert or replace a task.
    pub fn save_task(&self, task: &ScheduledTask) -> Result<()> {
        let schedule = serde_json::to_string(&task.schedule)?;
        let class = task
            .last_error
            .as_ref()
            .map(|e| serde_json::to_value(e.class))
            .transpose()?
            .and_then(|v| v.as_str().map(str::to_string));
        let conn = self.lock()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO scheduler_tasks ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
            ),
            rusqlite::params![
                task.task_id,
                task.name,
                task.graph,
                schedule,
                task.priority.as_str(),
                task.queue,
                task.status.as_str(),
                task.case_id,
                task.objective,
                task.actor.as_str(),
                task.created_at.to_rfc3339(),
                task.last_run.map(|t| t.to_rfc3339()),
                task.next_run.map(|t| t.to_rfc3339()),
                task.run_count,
                task.failure_count,
                class,
                task.last_error.as_ref().map(|e| e.message.clone()),
                task.last_error.as_ref().map(|e| e.at.to_rfc3339()),
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Load every task as stored. Rows that fail to decode are skipped with a warning.
    pub fn load_tasks(&self) -> Result<Vec<ScheduledTask>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {COLUMNS} FROM scheduler_tasks ORDER BY created_at"))
            .map_err(db_err)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(RawRow {
                    task_id: row.get(0)?,
                    name: row.get(1)?,
                    graph: row.get(2)?,
                    schedule: row.get(3)?,
                    priority: row.get(4)?,
                    queue: row.get(5)?,
                    status: row.get(6)?,
                    case_id: row.get(7)?,
                    objective: row.get(8)?,
                    actor: row.get(9)?,
                    created_at: row.get(10)?,
                    last_run: row.get(11)?,
                    next_run: row.get(12)?,
                    run_count: row.get(13)?,
                    failure_count: row.get(14)?,
                    last_error_class: row.get(15)?,
                    last_error_message: row.get(16)?,
                    last_error_at: row.get(17)?,
                })
            })
            .map_err(db_err)?;

        let mut tasks = Vec::new();
        for row in rows {
            let raw = row.map_err(db_err)?;
            let task_id = raw.task_id.clone();
            match raw.into_task() {
                Ok(task) => tasks.push(task),
                Err(e) => tracing::warn!(task_id = %task_id, "⚠️ Skipping unreadable task row: {e}"),
            }
        }
        Ok(tasks)
    }
}

struct RawRow {
    task_id: String,
    name: String,
    graph: String,
    schedule: String,
    priority: String,
    queue: String,
    status: String,
    case_id: String,
    objective: String,
    actor: String,
    created_at: String,
    last_run: Option<String>,
    next_run: Option<String>,
    run_count: u32,
    failure_count: u32,
    last_error_class: Option<String>,
    last_error_message: Option<String>,
    last_error_at: Option<String>,
}

impl RawRow {
    fn into_task(self) -> Result<ScheduledTask> {
        let schedule: Schedule = serde_json::from_str(&self.schedule)?;
        let last_error = match (self.last_error_class, self.last_error_message) {
            (Some(class), Some(message)) => Some(TaskError {
                class: serde_json::from_value::<ErrorClass>(serde_json::Value::String(class))?,
                message,
                at: self
                    .last_error_at
                    .as_deref()
                    .and_then(parse_time)
                    .unwrap_or_else(Utc::now),
            }),
            _ => None,
        };
        Ok(ScheduledTask {
            task_id: self.task_id,
            name: self.name,
            graph: self.graph,
            schedule,
            priority: Priority::from_str(&self.priority)?,
            queue: self.queue,
            status: TaskStatus::from_str(&self.status)?,
            case_id: self.case_id,
            objective: self.objective,
            actor: Actor::from_str(&self.actor)?,
            created_at: parse_time(&self.created_at).unwrap_or_else(Utc::now),
            last_run: self.last_run.as_deref().and_then(parse_time),
            next_run: self.next_run.as_deref().and_then(parse_time),
            run_count: self.run_count,
            failure_count: self.failure_count,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str) -> ScheduledTask {
        ScheduledTask::new(id, "Nightly evidence", "evidence_review", Schedule::cron("0 2 * * *").unwrap(), Priority::High)
            .with_queue("evidence")
    }

    #[test]
    fn test_save_and_load() {
        let db = TaskDb::open_in_memory().unwrap();
        let mut t = task("t1");
        t.next_run = Some(Utc::now());
        t.failure_count = 2;
        t.last_error = Some(TaskError {
            class: ErrorClass::Transient,
            message: "okta returned 503".into(),
            at: Utc::now(),
        });
        db.save_task(&t).unwrap();

        let loaded = db.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, "t1");
        assert_eq!(loaded[0].schedule, t.schedule);
        assert_eq!(loaded[0].priority, Priority::High);
        assert_eq!(loaded[0].failure_count, 2);
        assert_eq!(loaded[0].last_error.as_ref().unwrap().class, ErrorClass::Transient);
    }

    #[test]
    fn test_statuses_are_stored_verbatim() {
        let db = TaskDb::open_in_memory().unwrap();
        for (id, status) in [("run", TaskStatus::Running), ("retry", TaskStatus::Retrying), ("paused", TaskStatus::Paused)] {
            let mut t = task(id);
            t.status = status;
            db.save_task(&t).unwrap();
        }
        let loaded = db.load_tasks().unwrap();
        let status = |id: &str| loaded.iter().find(|t| t.task_id == id).unwrap().status;
        assert_eq!(status("run"), TaskStatus::Running);
        assert_eq!(status("retry"), TaskStatus::Retrying);
        assert_eq!(status("paused"), TaskStatus::Paused);
    }

    #[test]
    fn test_unreadable_rows_are_skipped() {
        let db = TaskDb::open_in_memory().unwrap();
        db.save_task(&task("good")).unwrap();
        db.save_task(&task("bad")).unwrap();
        db.lock()
            .unwrap()
            .execute("UPDATE scheduler_tasks SET priority = 'urgent' WHERE task_id = 'bad'", [])
            .unwrap();
        let loaded = db.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].task_id, "good");
    }

    #[test]
    fn test_upsert_keeps_one_row() {
        let db = TaskDb::open_in_memory().unwrap();
        let mut t = task("t");
        db.save_task(&t).unwrap();
        t.run_count = 5;
        db.save_task(&t).unwrap();
        t.status = TaskStatus::Cancelled;
        t.next_run = None;
        db.save_task(&t).unwrap();
        let loaded = db.load_tasks().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].run_count, 5);
        assert_eq!(loaded[0].status, TaskStatus::Cancelled);
    }
}
