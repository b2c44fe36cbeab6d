//! # ComplyFlow Scheduler
//!
//! Runs compliance node graphs on a schedule.
//!
//! ## Architecture
//! ```text
//! TaskScheduler (tokio interval tick)
//!   ├── due tasks, highest priority first, bounded by a semaphore
//!   ├── run: load checkpoint → GraphExecutor → commit (rebase on conflict)
//!   │          └── retry with exponential backoff + jitter
//!   ├── TaskDb (SQLite): registry survives restarts, crash recovery
//!   └── NotifyRouter: terminal failures → log / webhook
//! ```
//!
//! Schedules are cron expressions (`"0 2 * * *"`), fixed intervals or
//! one-shot times.

pub mod clock;
pub mod cron;
pub mod engine;
pub mod lanes;
pub mod notify;
pub mod persistence;
pub mod retry;
mod runner;
pub mod tasks;

pub use clock::{Clock, ManualClock, SystemClock};
pub use cron::CronSchedule;
pub use engine::{HealthReport, HealthStatus, SchedulerBuilder, TaskScheduler};
pub use lanes::LaneStats;
pub use notify::NotifyRouter;
pub use persistence::TaskDb;
pub use retry::RetryPolicy;
pub use tasks::{Priority, Schedule, ScheduledTask, TaskError, TaskStatus};
