//! Per-server maintenance task scheduler.
//!
//! Each server owns one scheduler holding a named set of recurring tasks and
//! a single timing loop that fires due tasks. Task failures are logged and
//! never stop the loop; a task is retried only at its next occurrence.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Due-task evaluation interval.
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task already exists: {0}")]
    DuplicateTask(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error("tasks must be loaded before the scheduler is started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// When a task becomes due.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Every `seconds` seconds.
    Interval { seconds: u64 },
    /// Calendar expression (cron syntax with seconds field).
    Cron { expression: String },
}

impl Trigger {
    pub fn validate(&self) -> Result<()> {
        match self {
            Trigger::Interval { seconds } => {
                if *seconds == 0 {
                    return Err(SchedulerError::InvalidTrigger(
                        "interval must be at least one second".into(),
                    ));
                }
                Ok(())
            }
            Trigger::Cron { expression } => {
                cron::Schedule::from_str(expression)
                    .map_err(|e| SchedulerError::InvalidTrigger(e.to_string()))?;
                Ok(())
            }
        }
    }

    /// First occurrence strictly after `after`.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { seconds } => {
                Some(after + chrono::Duration::seconds(*seconds as i64))
            }
            Trigger::Cron { expression } => {
                let schedule = cron::Schedule::from_str(expression).ok()?;
                schedule.after(&after).next()
            }
        }
    }
}

/// What a due task does.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskAction {
    Start,
    Stop,
    Restart,
    /// Write a command to the server console.
    Command { command: String },
}

/// A named, scheduled maintenance action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub name: String,
    pub trigger: Trigger,
    pub action: TaskAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Executes task actions. Implemented by the owning program; held weakly so
/// the scheduler loop never keeps a deleted program alive.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, name: &str, action: &TaskAction) -> anyhow::Result<()>;
}

struct ArmedTask {
    task: Task,
    next_due: Option<DateTime<Utc>>,
}

/// Owns one server's task set and timing loop.
pub struct Scheduler {
    server_id: String,
    tasks: Arc<RwLock<HashMap<String, ArmedTask>>>,
    started: AtomicBool,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl Scheduler {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            tasks: Arc::new(RwLock::new(HashMap::new())),
            started: AtomicBool::new(false),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Bulk-install a persisted task set. Only valid before [`start`].
    ///
    /// [`start`]: Scheduler::start
    pub async fn load_map(&self, tasks: HashMap<String, Task>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }
        for task in tasks.values() {
            task.trigger.validate()?;
        }
        let mut map = self.tasks.write().await;
        for (name, task) in tasks {
            map.insert(
                name,
                ArmedTask {
                    task,
                    next_due: None,
                },
            );
        }
        Ok(())
    }

    /// Begin the background timing loop. Arms every enabled task.
    pub async fn start(&self, runner: Weak<dyn TaskRunner>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyStarted);
        }

        let now = Utc::now();
        {
            let mut map = self.tasks.write().await;
            for armed in map.values_mut() {
                armed.next_due = if armed.task.enabled {
                    armed.task.trigger.next_after(now)
                } else {
                    None
                };
            }
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().expect("shutdown lock poisoned") = Some(shutdown_tx);

        let server_id = self.server_id.clone();
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            debug!(server = %server_id, "Scheduler started");
            let mut tick = tokio::time::interval(TICK);
            // Missed ticks collapse: a stalled loop fires each overdue task
            // once on catch-up, not once per missed interval.
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tick.tick() => {
                        run_due_tasks(&server_id, &tasks, &runner).await;
                    }
                }
            }
            debug!(server = %server_id, "Scheduler stopped");
        });

        Ok(())
    }

    /// Cancel the timing loop. Idempotent; used at delete and shutdown.
    pub fn stop(&self) {
        if let Some(tx) = self
            .shutdown_tx
            .lock()
            .expect("shutdown lock poisoned")
            .take()
        {
            let _ = tx.send(true);
        }
    }

    /// Install a new task. Fails if the name is taken.
    pub async fn add(&self, task: Task) -> Result<()> {
        task.trigger.validate()?;
        let mut map = self.tasks.write().await;
        if map.contains_key(&task.name) {
            return Err(SchedulerError::DuplicateTask(task.name));
        }
        let next_due = self.arm_time(&task);
        info!(server = %self.server_id, task = %task.name, "Task added");
        map.insert(task.name.clone(), ArmedTask { task, next_due });
        Ok(())
    }

    /// Remove a task by name.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let mut map = self.tasks.write().await;
        map.remove(name)
            .ok_or_else(|| SchedulerError::NotFound(name.to_string()))?;
        info!(server = %self.server_id, task = %name, "Task removed");
        Ok(())
    }

    /// Atomically replace (or install) a task definition.
    ///
    /// There is no window where neither the old nor the new definition is
    /// armed, and the old trigger cannot fire once this returns.
    pub async fn replace(&self, task: Task) -> Result<()> {
        task.trigger.validate()?;
        let mut map = self.tasks.write().await;
        let next_due = self.arm_time(&task);
        info!(server = %self.server_id, task = %task.name, "Task replaced");
        map.insert(task.name.clone(), ArmedTask { task, next_due });
        Ok(())
    }

    /// Point-in-time snapshot of the task set, for listing and persistence.
    pub async fn tasks(&self) -> HashMap<String, Task> {
        self.tasks
            .read()
            .await
            .iter()
            .map(|(name, armed)| (name.clone(), armed.task.clone()))
            .collect()
    }

    fn arm_time(&self, task: &Task) -> Option<DateTime<Utc>> {
        if self.started.load(Ordering::SeqCst) && task.enabled {
            task.trigger.next_after(Utc::now())
        } else {
            None
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_due_tasks(
    server_id: &str,
    tasks: &RwLock<HashMap<String, ArmedTask>>,
    runner: &Weak<dyn TaskRunner>,
) {
    let now = Utc::now();
    let due: Vec<(String, TaskAction)> = {
        let mut map = tasks.write().await;
        let mut due = Vec::new();
        for armed in map.values_mut() {
            if !armed.task.enabled {
                continue;
            }
            if armed.next_due.is_some_and(|at| at <= now) {
                // Re-arm strictly after now: one fire per match, with missed
                // matches collapsing into a single catch-up fire.
                armed.next_due = armed.task.trigger.next_after(now);
                due.push((armed.task.name.clone(), armed.task.action.clone()));
            }
        }
        due
    };

    if due.is_empty() {
        return;
    }
    let Some(runner) = runner.upgrade() else {
        return;
    };

    for (name, action) in due {
        debug!(server = %server_id, task = %name, "Task due");
        if let Err(e) = runner.run_task(&name, &action).await {
            warn!(server = %server_id, task = %name, error = %e, "Task execution failed");
        }
    }
}
