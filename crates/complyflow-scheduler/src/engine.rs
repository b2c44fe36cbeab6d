//! Scheduler engine: the task registry, the tick loop and dispatch.
//!
//! Each tick picks the due tasks, highest priority first, and hands each one
//! to its own async run while a concurrency permit is available. Tasks that
//! find no permit stay pending and are picked up by a later tick.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use complyflow_core::config::ComplyConfig;
use complyflow_core::error::{ComplyError, Result};
use complyflow_core::store::StateStore;
use complyflow_graph::{
    ExecutionLimits, GraphExecutor, GraphRegistry, Notification, Notifier,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::{Clock, SystemClock};
use crate::lanes::{LaneStats, Lanes};
use crate::notify::NotifyRouter;
use crate::persistence::TaskDb;
use crate::retry::RetryPolicy;
use crate::runner;
use crate::tasks::{ScheduledTask, TaskStatus};

/// State shared between the scheduler handle, the tick loop and every run.
pub(crate) struct Inner {
    tasks: Mutex<BTreeMap<String, ScheduledTask>>,
    pub(crate) store: Arc<dyn StateStore>,
    pub(crate) graphs: Arc<GraphRegistry>,
    pub(crate) clock: Arc<dyn Clock>,
    db: Option<Arc<TaskDb>>,
    pub(crate) router: NotifyRouter,
    pub(crate) lanes: Lanes,
    pub(crate) executor: GraphExecutor,
    pub(crate) retry: RetryPolicy,
    pub(crate) rebase_attempts: u32,
    pub(crate) alert_on_failure: bool,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    tick_interval: Duration,
    /// Parent of every run's token. Cancelled by `stop`.
    pub(crate) shutdown: CancellationToken,
    tracker: TaskTracker,
    running: Mutex<HashMap<String, CancellationToken>>,
    /// Tasks asked to pause while a run was in flight.
    pause_requested: Mutex<HashSet<String>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn persist(&self, task: &ScheduledTask) {
        if let Some(db) = &self.db
            && let Err(e) = db.save_task(task)
        {
            tracing::warn!(task_id = %task.task_id, "⚠️ Failed to persist task: {e}");
        }
    }

    /// Apply `f` to a task and persist the result.
    ///
    /// The row is written while the registry lock is held, so rows land in
    /// the same order as the in-memory updates.
    pub(crate) fn update_task<R>(&self, task_id: &str, f: impl FnOnce(&mut ScheduledTask) -> R) -> Option<R> {
        let mut tasks = lock(&self.tasks);
        let task = tasks.get_mut(task_id)?;
        let out = f(task);
        self.persist(task);
        Some(out)
    }

    /// Move an in-flight task between `running` and `retrying`.
    pub(crate) fn set_active_status(&self, task_id: &str, status: TaskStatus) {
        self.update_task(task_id, |t| {
            if t.status.is_active() {
                t.status = status;
            }
        });
    }

    /// Undo a dispatch whose run never took effect: the task is pending on
    /// its old slot again.
    pub(crate) fn restore(&self, before: &ScheduledTask) {
        let pause = self.take_pause_request(&before.task_id);
        self.update_task(&before.task_id, |t| {
            if t.status.is_active() {
                t.status = if pause { TaskStatus::Paused } else { TaskStatus::Pending };
                t.next_run = before.next_run;
                t.last_run = before.last_run;
                t.run_count = before.run_count;
            }
        });
    }

    pub(crate) fn take_pause_request(&self, task_id: &str) -> bool {
        lock(&self.pause_requested).remove(task_id)
    }

    pub(crate) fn release(&self, task_id: &str) {
        lock(&self.running).remove(task_id);
    }
}

/// Handle to the scheduler. Cheap to clone; all clones drive the same registry.
#[derive(Clone)]
pub struct TaskScheduler {
    inner: Arc<Inner>,
}

pub struct SchedulerBuilder {
    config: ComplyConfig,
    store: Arc<dyn StateStore>,
    graphs: GraphRegistry,
    clock: Arc<dyn Clock>,
    db: Option<Arc<TaskDb>>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl SchedulerBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist the registry and reload previously registered tasks.
    pub fn task_db(mut self, db: Arc<TaskDb>) -> Self {
        self.db = Some(db);
        self
    }

    /// Where terminal-failure alerts go, besides the alert history.
    pub fn notifiers(mut self, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn build(self) -> Result<TaskScheduler> {
        let config = &self.config;
        let max_concurrency = config.scheduler.max_concurrency.max(1);

        let mut tasks = BTreeMap::new();
        if let Some(db) = &self.db {
            for mut task in db.load_tasks()? {
                if task.status.is_active() {
                    tracing::warn!(task_id = %task.task_id, "♻️ Recovering task interrupted while {}", task.status);
                    task.status = TaskStatus::Pending;
                    db.save_task(&task)?;
                }
                if !self.graphs.contains(&task.graph) {
                    tracing::warn!(task_id = %task.task_id, "⚠️ Persisted task targets unknown graph '{}'", task.graph);
                }
                tasks.insert(task.task_id.clone(), task);
            }
            if !tasks.is_empty() {
                tracing::info!("📂 Loaded {} persisted task(s)", tasks.len());
            }
        }

        let inner = Inner {
            tasks: Mutex::new(tasks),
            store: self.store,
            graphs: Arc::new(self.graphs),
            clock: self.clock,
            db: self.db,
            router: NotifyRouter::new(config.notify.history_size).with_notifiers(self.notifiers),
            lanes: Lanes::new(),
            executor: GraphExecutor::new(ExecutionLimits::from_config(&config.scheduler, &config.graph)),
            retry: RetryPolicy::from_config(&config.retry),
            rebase_attempts: config.store.rebase_attempts,
            alert_on_failure: config.notify.alert_on_failure,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            tick_interval: Duration::from_secs(config.scheduler.tick_interval_secs.max(1)),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            running: Mutex::new(HashMap::new()),
            pause_requested: Mutex::new(HashSet::new()),
            loop_handle: Mutex::new(None),
        };
        Ok(TaskScheduler {
            inner: Arc::new(inner),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Some task is in `failed`.
    Degraded,
    /// The checkpoint store cannot be reached.
    Unhealthy,
}

/// Snapshot returned by [`TaskScheduler::health_check`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub total_tasks: usize,
    pub pending: usize,
    /// Running or retrying.
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub checkpointer: String,
    pub checkpointer_status: String,
    pub lanes: Vec<LaneStats>,
    pub recent_alerts: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Build a report from a task list and a store probe.
    pub async fn collect(
        tasks: &[ScheduledTask],
        store: &dyn StateStore,
        lanes: Vec<LaneStats>,
        recent_alerts: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let count = |pred: &dyn Fn(TaskStatus) -> bool| tasks.iter().filter(|t| pred(t.status)).count();
        let failed = count(&|s| s == TaskStatus::Failed);

        let (reachable, checkpointer_status) = match store.ping().await {
            Ok(()) => (true, "connected".to_string()),
            Err(e) => (false, format!("unreachable: {e}")),
        };
        let status = if !reachable {
            HealthStatus::Unhealthy
        } else if failed > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Self {
            status,
            total_tasks: tasks.len(),
            pending: count(&|s| s == TaskStatus::Pending),
            running: count(&|s| s.is_active()),
            paused: count(&|s| s == TaskStatus::Paused),
            completed: count(&|s| s == TaskStatus::Completed),
            failed,
            cancelled: count(&|s| s == TaskStatus::Cancelled),
            checkpointer: store.name().to_string(),
            checkpointer_status,
            lanes,
            recent_alerts,
            checked_at: now,
        }
    }
}

impl TaskScheduler {
    pub fn builder(config: &ComplyConfig, store: Arc<dyn StateStore>, graphs: GraphRegistry) -> SchedulerBuilder {
        SchedulerBuilder {
            config: config.clone(),
            store,
            graphs,
            clock: Arc::new(SystemClock),
            db: None,
            notifiers: Vec::new(),
        }
    }

    /// Add a task to the registry. Its first slot is computed now unless set.
    pub fn register_task(&self, mut task: ScheduledTask) -> Result<String> {
        task.validate()?;
        if !self.inner.graphs.contains(&task.graph) {
            return Err(ComplyError::validation(format!(
                "task '{}' targets unknown graph '{}'",
                task.task_id, task.graph
            )));
        }
        if task.status.is_active() {
            task.status = TaskStatus::Pending;
        }
        if task.next_run.is_none() {
            task.next_run = task.schedule.first_run(self.inner.clock.now());
        }
        if task.next_run.is_none() && task.status == TaskStatus::Pending {
            return Err(ComplyError::validation(format!(
                "task '{}' schedule '{}' never fires",
                task.task_id, task.schedule
            )));
        }

        {
            let mut tasks = lock(&self.inner.tasks);
            if tasks.contains_key(&task.task_id) {
                return Err(ComplyError::validation(format!(
                    "task '{}' is already registered",
                    task.task_id
                )));
            }
            tasks.insert(task.task_id.clone(), task.clone());
        }
        if let Some(db) = &self.inner.db
            && let Err(e) = db.save_task(&task)
        {
            lock(&self.inner.tasks).remove(&task.task_id);
            return Err(e);
        }

        tracing::info!(
            task_id = %task.task_id,
            "📅 Task registered: '{}' [{}] {} → graph '{}'",
            task.name,
            task.priority,
            task.schedule,
            task.graph
        );
        Ok(task.task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        lock(&self.inner.tasks).contains_key(task_id)
    }

    pub fn get_task(&self, task_id: &str) -> Option<ScheduledTask> {
        lock(&self.inner.tasks).get(task_id).cloned()
    }

    /// All tasks, ordered by id.
    pub fn list_tasks(&self) -> Vec<ScheduledTask> {
        lock(&self.inner.tasks).values().cloned().collect()
    }

    /// Stop dispatching a task. A run already in flight finishes first and
    /// the task is paused afterwards. `next_run` is kept.
    pub fn pause_task(&self, task_id: &str) -> Result<()> {
        let result = self
            .inner
            .update_task(task_id, |t| match t.status {
                TaskStatus::Pending | TaskStatus::Failed => {
                    t.status = TaskStatus::Paused;
                    Ok(false)
                }
                TaskStatus::Paused => Ok(false),
                TaskStatus::Running | TaskStatus::Retrying => Ok(true),
                other => Err(ComplyError::validation(format!(
                    "cannot pause task '{task_id}' in status {other}"
                ))),
            })
            .ok_or_else(|| ComplyError::NotFound(format!("task '{task_id}'")))?;
        if result? {
            lock(&self.inner.pause_requested).insert(task_id.to_string());
        }
        tracing::info!(task_id, "⏸️ Task paused");
        Ok(())
    }

    /// Re-enable a paused or failed task. A one-shot task that already fired
    /// gets its original slot back and runs on the next tick.
    pub fn resume_task(&self, task_id: &str) -> Result<()> {
        if self.inner.take_pause_request(task_id) {
            tracing::info!(task_id, "▶️ Pending pause withdrawn");
            return Ok(());
        }
        let now = self.inner.clock.now();
        self.inner
            .update_task(task_id, |t| match t.status {
                TaskStatus::Paused | TaskStatus::Failed => {
                    t.status = TaskStatus::Pending;
                    if t.next_run.is_none() {
                        t.next_run = t.schedule.first_run(now);
                    }
                    Ok(())
                }
                TaskStatus::Pending => Ok(()),
                other => Err(ComplyError::validation(format!(
                    "cannot resume task '{task_id}' in status {other}"
                ))),
            })
            .ok_or_else(|| ComplyError::NotFound(format!("task '{task_id}'")))??;
        tracing::info!(task_id, "▶️ Task resumed");
        Ok(())
    }

    /// Retire a task for good. An in-flight run is cancelled. The record is kept.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.inner
            .update_task(task_id, |t| {
                t.status = TaskStatus::Cancelled;
                t.next_run = None;
            })
            .ok_or_else(|| ComplyError::NotFound(format!("task '{task_id}'")))?;
        self.inner.take_pause_request(task_id);
        if let Some(token) = lock(&self.inner.running).get(task_id) {
            token.cancel();
        }
        tracing::info!(task_id, "🛑 Task cancelled");
        Ok(())
    }

    /// Dispatch every task due at `now`. Returns the ids dispatched, in order.
    pub fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        if self.inner.shutdown.is_cancelled() {
            return Vec::new();
        }

        let mut dispatched = Vec::new();
        {
            let mut tasks = lock(&self.inner.tasks);
            let mut due: Vec<(u8, DateTime<Utc>, String)> = tasks
                .values()
                .filter(|t| t.is_due(now))
                .map(|t| (t.priority.rank(), t.next_run.unwrap_or(now), t.task_id.clone()))
                .collect();
            due.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)).then_with(|| a.2.cmp(&b.2)));

            let total_due = due.len();
            for (_, _, task_id) in due {
                let Ok(permit) = self.inner.semaphore.clone().try_acquire_owned() else {
                    tracing::debug!(
                        "⏳ Concurrency limit ({}) reached, {} task(s) deferred",
                        self.inner.max_concurrency,
                        total_due - dispatched.len()
                    );
                    break;
                };
                let Some(task) = tasks.get_mut(&task_id) else {
                    continue;
                };
                let before = task.clone();
                task.status = TaskStatus::Running;
                task.last_run = Some(now);
                task.run_count += 1;
                task.next_run = task.schedule.next_after(now);
                let snapshot = task.clone();

                tracing::info!(
                    task_id = %task.task_id,
                    case_id = %task.case_id,
                    "🔔 Dispatching '{}' [{}] → graph '{}'",
                    task.name,
                    task.priority,
                    task.graph
                );

                // Persisted before the run exists, so its final row always lands last.
                self.inner.persist(&snapshot);
                let token = self.inner.shutdown.child_token();
                lock(&self.inner.running).insert(task_id.clone(), token.clone());
                self.inner
                    .tracker
                    .spawn(runner::run(self.inner.clone(), snapshot, before, permit, token));
                dispatched.push(task_id);
            }
        }
        dispatched
    }

    /// Counts by status plus checkpoint store connectivity.
    pub async fn health_check(&self) -> HealthReport {
        let tasks = self.list_tasks();
        let lanes = self.inner.lanes.stats(tasks.iter());
        HealthReport::collect(
            &tasks,
            self.inner.store.as_ref(),
            lanes,
            self.inner.router.history().len(),
            self.inner.clock.now(),
        )
        .await
    }

    pub fn lane_stats(&self) -> Vec<LaneStats> {
        let tasks = lock(&self.inner.tasks);
        self.inner.lanes.stats(tasks.values())
    }

    /// Alerts raised so far, oldest first.
    pub fn alerts(&self) -> Vec<Notification> {
        self.inner.router.history()
    }

    /// Spawn the tick loop. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut handle = lock(&self.inner.loop_handle);
        if handle.is_some() {
            tracing::warn!("⚠️ Scheduler already started");
            return;
        }
        let scheduler = self.clone();
        let shutdown = self.inner.shutdown.clone();
        let every = self.inner.tick_interval;
        tracing::info!(
            "⏰ Scheduler started (tick every {}s, max {} concurrent run(s))",
            every.as_secs(),
            self.inner.max_concurrency
        );
        *handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let fired = scheduler.tick(scheduler.inner.clock.now());
                        if !fired.is_empty() {
                            tracing::debug!("⏰ Tick dispatched {} task(s)", fired.len());
                        }
                    }
                }
            }
            tracing::debug!("⏰ Tick loop exited");
        }));
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.loop_handle).is_some() && !self.inner.shutdown.is_cancelled()
    }

    /// Stop the tick loop, cancel in-flight runs and wait for them to settle.
    /// Interrupted tasks go back to pending. A stopped scheduler cannot be restarted.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = lock(&self.inner.loop_handle).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!("⚠️ Tick loop ended abnormally: {e}");
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("⏰ Scheduler stopped");
    }

    /// Wait until every dispatched run has finished.
    pub async fn drain(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
    }
}
