use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use common::api::CommandRequest;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::gateway::CommandSink;
use crate::persistence::tasks::{self as task_store, TaskAction, TaskRecord, TaskTrigger};
use crate::persistence::{self as db};

/// One-shot fire times older than this are treated as missed, not executed.
/// Nobody wants a months-old forgotten command running at boot.
const MISSED_FIRE_GRACE_SECS: i64 = 60;

/// Turns persisted task records into timed calls against the command sink.
///
/// The in-memory job table is rebuilt wholesale by `refresh()`; the jobs
/// mutex serializes rebuilds against in-flight one-shot fires so a task can
/// never double-fire across a refresh.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    db: db::Db,
    sink: Arc<dyn CommandSink>,
    sched: JobScheduler,
    jobs: Mutex<HashMap<i64, Uuid>>,
    initialized: AtomicBool,
}

fn sched_err(err: JobSchedulerError) -> anyhow::Error {
    anyhow::anyhow!("job scheduler error: {err}")
}

/// What to do with a one-shot task found at arming time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OneShotDisposition {
    /// Arm a timer for the remaining delay.
    Schedule(StdDuration),
    /// Fire time just passed; execute immediately.
    FireNow,
    /// Fire time is past the grace window; delete without firing.
    Expired,
}

fn classify_one_shot(execute_at: DateTime<Utc>, now: DateTime<Utc>) -> OneShotDisposition {
    let delay = execute_at - now;
    if delay > ChronoDuration::zero() {
        OneShotDisposition::Schedule(delay.to_std().unwrap_or(StdDuration::ZERO))
    } else if delay > -ChronoDuration::seconds(MISSED_FIRE_GRACE_SECS) {
        OneShotDisposition::FireNow
    } else {
        OneShotDisposition::Expired
    }
}

/// Cheap syntax check used by the management API before a cron task is
/// accepted into the store.
pub fn validate_cron(expr: &str) -> bool {
    Job::new_async(expr, |_id, _sched| Box::pin(async {})).is_ok()
}

impl Scheduler {
    pub async fn new(db: db::Db, sink: Arc<dyn CommandSink>) -> anyhow::Result<Self> {
        let sched = JobScheduler::new().await.map_err(sched_err)?;
        Ok(Self {
            inner: Arc::new(Inner {
                db,
                sink,
                sched,
                jobs: Mutex::new(HashMap::new()),
                initialized: AtomicBool::new(false),
            }),
        })
    }

    /// Idempotent startup hook: starts the job runner and loads the schedule.
    pub async fn init(&self) -> anyhow::Result<()> {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        self.inner.sched.clone().start().await.map_err(sched_err)?;
        self.refresh().await
    }

    /// Cancels every armed job and re-arms the schedule from the durable
    /// store. The only way tasks are (re)scheduled, so task create/delete
    /// paths call this after touching the store.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let mut jobs = self.inner.jobs.lock().await;
        for (task_id, job_id) in jobs.drain() {
            if let Err(err) = self.inner.sched.clone().remove(&job_id).await {
                warn!(task_id, ?err, "failed to remove armed job");
            }
        }

        // Best-effort: tasks stay scheduled even if the broker is down now,
        // so commands are only lost at fire time, never silently dropped
        // from the schedule.
        if let Err(err) = self.inner.sink.ensure_connected().await {
            warn!(%err, "broker connect failed during schedule refresh");
        }

        let tasks = task_store::list_active_tasks(&self.inner.db).await?;
        let total = tasks.len();
        let mut armed = 0;
        for task in tasks {
            match self.arm(&mut jobs, task).await {
                Ok(true) => armed += 1,
                Ok(false) => {}
                Err(err) => warn!(?err, "failed to arm task"),
            }
        }

        info!(total, armed, "schedule rebuilt");
        Ok(())
    }

    /// Arms one task. Returns true when a job was installed; false when the
    /// task was handled without arming (fired immediately, expired, or
    /// rejected).
    async fn arm(&self, jobs: &mut HashMap<i64, Uuid>, task: TaskRecord) -> anyhow::Result<bool> {
        let Some(trigger) = task.trigger() else {
            error!(
                task_id = task.id,
                "task has both or neither trigger kind set, skipping"
            );
            return Ok(false);
        };

        match trigger {
            TaskTrigger::Cron(expr) => self.arm_cron(jobs, task, &expr).await,
            TaskTrigger::At(at) => match classify_one_shot(at, Utc::now()) {
                OneShotDisposition::Schedule(delay) => self.arm_one_shot(jobs, task, delay).await,
                OneShotDisposition::FireNow => {
                    info!(task_id = task.id, "one-shot fire time just passed, executing now");
                    task_store::delete_task(&self.inner.db, task.id).await?;
                    let sink = Arc::clone(&self.inner.sink);
                    tokio::spawn(async move {
                        fire_task(&task, sink.as_ref()).await;
                    });
                    Ok(false)
                }
                OneShotDisposition::Expired => {
                    info!(
                        task_id = task.id,
                        execute_at = %at,
                        "one-shot fire time is past the grace window, deleting without firing"
                    );
                    task_store::delete_task(&self.inner.db, task.id).await?;
                    Ok(false)
                }
            },
        }
    }

    async fn arm_cron(
        &self,
        jobs: &mut HashMap<i64, Uuid>,
        task: TaskRecord,
        expr: &str,
    ) -> anyhow::Result<bool> {
        let task_id = task.id;
        let task = Arc::new(task);
        let sink = Arc::clone(&self.inner.sink);
        let job = match Job::new_async(expr, move |_job_id, _sched| {
            let task = Arc::clone(&task);
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                fire_task(&task, sink.as_ref()).await;
            })
        }) {
            Ok(job) => job,
            Err(err) => {
                // Possibly a transient validation gap rather than user intent
                // to discard the task, so it stays in the store unarmed.
                error!(task_id, %err, expr, "invalid cron expression, task not armed");
                return Ok(false);
            }
        };

        let job_id = self.inner.sched.clone().add(job).await.map_err(sched_err)?;
        jobs.insert(task_id, job_id);
        Ok(true)
    }

    async fn arm_one_shot(
        &self,
        jobs: &mut HashMap<i64, Uuid>,
        task: TaskRecord,
        delay: StdDuration,
    ) -> anyhow::Result<bool> {
        let task_id = task.id;
        let task = Arc::new(task);
        let inner = Arc::clone(&self.inner);
        let fire_at = std::time::Instant::now() + delay;
        let job = Job::new_one_shot_at_instant_async(fire_at, move |job_id, _sched| {
            let task = Arc::clone(&task);
            let inner = Arc::clone(&inner);
            Box::pin(async move {
                // Holding the jobs lock across the store delete keeps a
                // concurrent refresh() from re-reading and re-arming the
                // task between our removal steps.
                {
                    let mut jobs = inner.jobs.lock().await;
                    let still_armed =
                        matches!(jobs.get(&task.id), Some(current) if *current == job_id);
                    if !still_armed {
                        return;
                    }
                    jobs.remove(&task.id);
                    if let Err(err) = task_store::delete_task(&inner.db, task.id).await {
                        warn!(task_id = task.id, ?err, "failed to delete one-shot task");
                    }
                }
                fire_task(&task, inner.sink.as_ref()).await;
            })
        })
        .map_err(sched_err)?;

        let job_id = self.inner.sched.clone().add(job).await.map_err(sched_err)?;
        jobs.insert(task_id, job_id);
        Ok(true)
    }

    /// Computed next fire time for display. `None` when the task is not
    /// armed, which is how an invalid cron expression shows up in the list.
    pub async fn next_run(&self, task: &TaskRecord) -> Option<DateTime<Utc>> {
        match task.trigger()? {
            TaskTrigger::At(at) => Some(at),
            TaskTrigger::Cron(_) => {
                let job_id = { self.inner.jobs.lock().await.get(&task.id).copied() }?;
                self.inner
                    .sched
                    .clone()
                    .next_tick_for_job(job_id)
                    .await
                    .ok()
                    .flatten()
            }
        }
    }

    /// Number of currently armed jobs, for diagnostics and tests.
    pub async fn armed_count(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }
}

async fn fire_task(task: &TaskRecord, sink: &dyn CommandSink) {
    let command = match resolve_command(task) {
        Ok(command) => command,
        Err(reason) => {
            error!(task_id = task.id, %reason, "cannot resolve task action, not firing");
            return;
        }
    };

    if let Err(err) = sink.ensure_connected().await {
        warn!(
            task_id = task.id,
            %err,
            "broker connect failed at fire time, command lost (at-most-once)"
        );
        return;
    }

    match sink.send_command(&command).await {
        Ok(()) => {
            crate::metrics::record_task_fired(command.kind());
            info!(task_id = task.id, kind = command.kind(), "scheduled command dispatched");
        }
        Err(err) => {
            warn!(task_id = task.id, %err, "command dispatch failed, not retrying");
        }
    }
}

/// Resolves a stored action into a command. Permissions were validated when
/// the task was created; fire time trusts the stored action.
fn resolve_command(task: &TaskRecord) -> Result<CommandRequest, String> {
    let params: &Value = &task.params.0;
    match task.action_type {
        TaskAction::Relay => {
            let relay_num = task
                .device_id
                .and_then(|id| u8::try_from(id).ok())
                .ok_or_else(|| "relay task is missing a valid device_id".to_string())?;
            let state = params
                .get("value")
                .and_then(Value::as_i64)
                .ok_or_else(|| "relay task params are missing 'value'".to_string())?;
            let state =
                u8::try_from(state).map_err(|_| "relay 'value' must be 0 or 1".to_string())?;
            Ok(CommandRequest::Relay { relay_num, state })
        }
        TaskAction::Light => {
            let channel = |key: &str| -> Result<Option<u8>, String> {
                match params.get(key) {
                    None | Some(Value::Null) => Ok(Some(0)),
                    Some(value) => value
                        .as_u64()
                        .and_then(|v| u8::try_from(v).ok())
                        .map(Some)
                        .ok_or_else(|| format!("light '{key}' must be between 0 and 255")),
                }
            };
            Ok(CommandRequest::Light {
                led1: channel("r")?,
                led2: channel("g")?,
                led3: channel("b")?,
                led4: channel("w")?,
            })
        }
    }
}
