//! One dispatched run of a task: load or start the case state, execute the
//! graph with retries, checkpoint each attempt and record the outcome.

use std::sync::Arc;

use complyflow_core::error::{ComplyError, ErrorClass, Result};
use complyflow_core::reducers::{increment_retry, set_status};
use complyflow_core::state::{ComplianceState, WorkflowStatus};
use complyflow_core::store::NO_VERSION;
use complyflow_core::StateUpdate;
use complyflow_graph::{NotifyPriority, Verdict};
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::sync::CancellationToken;

use crate::engine::Inner;
use crate::notify::NotifyRouter;
use crate::retry::RetryPolicy;
use crate::tasks::{ScheduledTask, TaskError, TaskStatus};

enum RunEnd {
    Completed,
    Failed(TaskError),
    Cancelled,
}

/// The checkpointed state a run starts from.
struct Started {
    state: ComplianceState,
    version: u64,
}

pub(crate) async fn run(
    inner: Arc<Inner>,
    task: ScheduledTask,
    before: ScheduledTask,
    _permit: OwnedSemaphorePermit,
    cancel: CancellationToken,
) {
    let end = match begin(&inner, &task).await {
        Ok(started) => {
            inner.lanes.start(&task.queue);
            let end = attempts(&inner, &task, started, &cancel).await;
            inner.lanes.complete(&task.queue);
            end
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!(
                task_id = %task.task_id,
                case_id = %task.case_id,
                "⚠️ Dispatch could not begin, task stays pending: {e}"
            );
            inner.restore(&before);
            inner.release(&task.task_id);
            return;
        }
        Err(e) => RunEnd::Failed(task_error(e.class(), e.to_string(), &inner)),
    };

    if matches!(end, RunEnd::Cancelled) && inner.shutdown.is_cancelled() {
        tracing::info!(task_id = %task.task_id, "🛑 Run interrupted by shutdown, task back to pending");
        inner.restore(&before);
    } else {
        finish(&inner, &task, end).await;
    }
    inner.release(&task.task_id);
}

/// Continue the case from its latest checkpoint, or open it.
async fn begin(inner: &Inner, task: &ScheduledTask) -> Result<Started> {
    let (state, base) = match inner.store.load(&task.case_id).await? {
        Some(checkpoint) => (
            checkpoint.state.next_execution(&task.objective, task.actor)?,
            checkpoint.version,
        ),
        None => (
            ComplianceState::for_actor(&task.case_id, &task.objective, task.actor)?,
            NO_VERSION,
        ),
    };
    let version = inner.store.save(&state, base).await?;
    tracing::info!(
        task_id = %task.task_id,
        case_id = %state.case_id,
        trace_id = %state.trace_id,
        "🚀 Run started (checkpoint v{version})"
    );
    Ok(Started { state, version })
}

async fn attempts(
    inner: &Inner,
    task: &ScheduledTask,
    started: Started,
    cancel: &CancellationToken,
) -> RunEnd {
    let Some(graph) = inner.graphs.get(&task.graph) else {
        return RunEnd::Failed(task_error(
            ErrorClass::Validation,
            format!("unknown graph '{}'", task.graph),
            inner,
        ));
    };
    let Started {
        state: mut committed,
        mut version,
    } = started;
    let mut working = committed.clone();

    loop {
        let outcome = inner.executor.run(&graph, working, cancel).await;
        working = outcome.state;

        let commit_error = match commit(inner, &committed, &working, version).await {
            Ok((state, v)) => {
                committed = state.clone();
                working = state;
                version = v;
                None
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task.task_id,
                    trace_id = %working.trace_id,
                    "⚠️ Checkpoint failed: {e}"
                );
                Some(e)
            }
        };

        let (class, message) = match (outcome.verdict, commit_error) {
            (Verdict::Cancelled, _) => return RunEnd::Cancelled,
            (Verdict::Failed(f), _) => {
                // A transient failure the handler gave up on has used its budget.
                let class = match f.class {
                    ErrorClass::Transient => ErrorClass::Terminal,
                    other => other,
                };
                return RunEnd::Failed(task_error(class, format!("{}: {}", f.node, f.message), inner));
            }
            (Verdict::Completed, None) => return RunEnd::Completed,
            (Verdict::Completed, Some(e)) => (e.class(), e.to_string()),
            (Verdict::Retry(f), _) => (f.class, format!("{}: {}", f.node, f.message)),
        };

        let retry = working.retry_count + 1;
        if class != ErrorClass::Transient {
            return RunEnd::Failed(task_error(class, message, inner));
        }
        if !inner.retry.allows(retry) {
            return RunEnd::Failed(task_error(
                ErrorClass::Terminal,
                format!("retry budget of {} exhausted: {message}", inner.retry.max_retries),
                inner,
            ));
        }

        inner.set_active_status(&task.task_id, TaskStatus::Retrying);
        let delay = inner.retry.delay_for(retry);
        tracing::warn!(
            task_id = %task.task_id,
            trace_id = %working.trace_id,
            "🔁 Retry {retry}/{} in {}ms: {message}",
            inner.retry.max_retries,
            delay.as_millis()
        );
        if !RetryPolicy::pause(delay, cancel).await {
            let cancelled = set_status(&working, WorkflowStatus::Cancelled);
            if let Err(e) = commit(inner, &committed, &cancelled, version).await {
                tracing::warn!(task_id = %task.task_id, "⚠️ Could not checkpoint cancellation: {e}");
            }
            return RunEnd::Cancelled;
        }
        working = increment_retry(&working);
        inner.set_active_status(&task.task_id, TaskStatus::Running);
    }
}

/// Save `working`, which descends from the checkpoint `base` at `expected`.
///
/// On a version conflict the changes made since `base` are replayed on top
/// of the latest checkpoint, up to `rebase_attempts` times.
async fn commit(
    inner: &Inner,
    base: &ComplianceState,
    working: &ComplianceState,
    expected: u64,
) -> Result<(ComplianceState, u64)> {
    let mut candidate = working.clone();
    let mut expected = expected;
    let mut rebases = 0;
    loop {
        match inner.store.save(&candidate, expected).await {
            Ok(version) => return Ok((candidate, version)),
            Err(ComplyError::Conflict { actual, .. }) if rebases < inner.rebase_attempts => {
                rebases += 1;
                tracing::warn!(
                    case_id = %working.case_id,
                    trace_id = %working.trace_id,
                    "⚠️ Checkpoint conflict (expected v{expected}, found v{actual}), rebasing {rebases}/{}",
                    inner.rebase_attempts
                );
                let Some(latest) = inner.store.load(&working.case_id).await? else {
                    return Err(ComplyError::transient(format!(
                        "checkpoint of case '{}' disappeared during commit",
                        working.case_id
                    )));
                };
                candidate = rebase(base, working, &latest.state)?;
                expected = latest.version;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Replay what `working` added over `base` onto `latest`, keeping this
/// execution's identity and counters.
fn rebase(base: &ComplianceState, working: &ComplianceState, latest: &ComplianceState) -> Result<ComplianceState> {
    let mut next = StateUpdate::between(base, working)?.apply(latest)?;
    next.trace_id = working.trace_id.clone();
    next.objective = working.objective.clone();
    next.actor = working.actor;
    next.workflow_status = working.workflow_status;
    next.retry_count = working.retry_count;
    next.error_count = working.error_count;
    Ok(next)
}

async fn finish(inner: &Inner, task: &ScheduledTask, end: RunEnd) {
    let pause = inner.take_pause_request(&task.task_id);
    inner.update_task(&task.task_id, |t| {
        // Cancelled by an operator while running.
        if t.status == TaskStatus::Cancelled {
            return;
        }
        t.status = match &end {
            RunEnd::Completed if t.schedule.is_recurring() => TaskStatus::Pending,
            RunEnd::Completed => TaskStatus::Completed,
            RunEnd::Failed(err) => {
                t.failure_count += 1;
                t.last_error = Some(err.clone());
                TaskStatus::Failed
            }
            RunEnd::Cancelled => TaskStatus::Cancelled,
        };
        if pause && matches!(t.status, TaskStatus::Pending | TaskStatus::Failed) {
            t.status = TaskStatus::Paused;
        }
    });

    match end {
        RunEnd::Completed => tracing::info!(task_id = %task.task_id, "✅ Task '{}' completed", task.name),
        RunEnd::Cancelled => tracing::info!(task_id = %task.task_id, "🛑 Task '{}' cancelled", task.name),
        RunEnd::Failed(err) => {
            tracing::error!(
                task_id = %task.task_id,
                case_id = %task.case_id,
                "❌ Task '{}' failed ({}): {}",
                task.name,
                err.class,
                err.message
            );
            if inner.alert_on_failure {
                let alert = NotifyRouter::create(
                    &format!("Task failed: {}", task.name),
                    &format!("[{}] {}", err.class, err.message),
                    &task.task_id,
                    NotifyPriority::Urgent,
                );
                inner.router.dispatch(alert).await;
            }
        }
    }
}

fn task_error(class: ErrorClass, message: String, inner: &Inner) -> TaskError {
    TaskError {
        class,
        message,
        at: inner.clock.now(),
    }
}
