//! Task definitions — the scheduling metadata for recurring compliance work.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use complyflow_core::config::TaskConfig;
use complyflow_core::error::{ComplyError, ErrorClass, Result};
use complyflow_core::state::Actor;
use serde::{Deserialize, Serialize};

use crate::cron::{CronSchedule, next_run_from_cron};

/// A scheduled task. Owned by the scheduler; nodes never see it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub name: String,
    /// Name of the node graph to run.
    pub graph: String,
    pub schedule: Schedule,
    pub priority: Priority,
    pub queue: String,
    pub status: TaskStatus,
    /// Compliance case the task works on. Every run of the task continues this case.
    pub case_id: String,
    pub objective: String,
    pub actor: Actor,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub failure_count: u32,
    pub last_error: Option<TaskError>,
}

/// Classification and message of the last failed run. No stack traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: ErrorClass,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// How/when the task triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run on a cron schedule.
    Cron { expression: String },
    /// Run once at a specific time.
    Once { at: DateTime<Utc> },
    /// Run every N seconds.
    Interval { every_secs: u64 },
}

impl Schedule {
    pub fn cron(expression: &str) -> Result<Self> {
        CronSchedule::parse(expression)?;
        Ok(Schedule::Cron {
            expression: expression.to_string(),
        })
    }

    /// Parse the config form: a cron expression, `every:<secs>` or `once:<rfc3339>`.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if let Some(secs) = expr.strip_prefix("every:") {
            let every_secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| ComplyError::validation(format!("invalid interval '{secs}'")))?;
            let schedule = Schedule::Interval { every_secs };
            schedule.validate()?;
            return Ok(schedule);
        }
        if let Some(at) = expr.strip_prefix("once:") {
            let at = DateTime::parse_from_rfc3339(at.trim())
                .map_err(|e| ComplyError::validation(format!("invalid one-shot time '{at}': {e}")))?
                .with_timezone(&Utc);
            return Ok(Schedule::Once { at });
        }
        Self::cron(expr)
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Schedule::Cron { expression } => CronSchedule::parse(expression).map(|_| ()),
            Schedule::Interval { every_secs: 0 } => {
                Err(ComplyError::validation("interval must be at least 1 second"))
            }
            Schedule::Interval { .. } | Schedule::Once { .. } => Ok(()),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Once { .. })
    }

    /// When a freshly registered task first fires.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once { at } => Some(*at),
            _ => self.next_after(now),
        }
    }

    /// Next slot strictly after `now`; `None` for a one-shot task that has fired.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Cron { expression } => next_run_from_cron(expression, now),
            Schedule::Interval { every_secs } => {
                Some(now + chrono::Duration::seconds(i64::try_from(*every_secs).ok()?))
            }
            Schedule::Once { .. } => None,
        }
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Cron { expression } => write!(f, "{expression}"),
            Schedule::Once { at } => write!(f, "once:{}", at.to_rfc3339()),
            Schedule::Interval { every_secs } => write!(f, "every:{every_secs}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
    Background,
}

impl Priority {
    /// Higher rank dispatches first.
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 4,
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
            Priority::Background => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
            Priority::Background => "background",
        }
    }
}

impl FromStr for Priority {
    type Err = ComplyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            "background" => Ok(Priority::Background),
            _ => Err(ComplyError::validation(format!("unknown priority '{s}'"))),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    /// Between attempts of one run, waiting out the backoff.
    Retrying,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Paused => "paused",
        }
    }

    /// A run is in flight.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Retrying)
    }
}

impl FromStr for TaskStatus {
    type Err = ComplyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            "paused" => Ok(TaskStatus::Paused),
            other => Err(ComplyError::validation(format!("unknown task status '{other}'"))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ScheduledTask {
    /// A pending task working on the case of the same id. `next_run` is
    /// computed at registration.
    pub fn new(task_id: &str, name: &str, graph: &str, schedule: Schedule, priority: Priority) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: name.to_string(),
            graph: graph.to_string(),
            schedule,
            priority,
            queue: "default".to_string(),
            status: TaskStatus::Pending,
            case_id: task_id.to_string(),
            objective: name.to_string(),
            actor: Actor::EvidenceCollector,
            created_at: Utc::now(),
            last_run: None,
            next_run: None,
            run_count: 0,
            failure_count: 0,
            last_error: None,
        }
    }

    pub fn with_queue(mut self, queue: &str) -> Self {
        self.queue = queue.to_string();
        self
    }

    pub fn with_case(mut self, case_id: &str, objective: &str, actor: Actor) -> Self {
        self.case_id = case_id.to_string();
        self.objective = objective.to_string();
        self.actor = actor;
        self
    }

    pub fn from_config(config: &TaskConfig) -> Result<Self> {
        let schedule = Schedule::parse(&config.schedule)?;
        let priority = Priority::from_str(&config.priority)?;
        let actor = Actor::from_str(&config.actor)?;
        let case_id = config.case_id.clone().unwrap_or_else(|| config.id.clone());
        let objective = config.objective.clone().unwrap_or_else(|| config.name.clone());
        Ok(Self::new(&config.id, &config.name, &config.graph, schedule, priority)
            .with_queue(&config.queue)
            .with_case(&case_id, &objective, actor))
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("task_id", &self.task_id),
            ("name", &self.name),
            ("graph", &self.graph),
            ("queue", &self.queue),
            ("case_id", &self.case_id),
            ("objective", &self.objective),
        ] {
            if value.trim().is_empty() {
                return Err(ComplyError::validation(format!("task {field} must not be empty")));
            }
        }
        self.schedule.validate()
    }

    /// Its slot has arrived and it is pending.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_run.is_some_and(|next| next <= now)
    }
}
