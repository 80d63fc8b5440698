mod executor;
mod persist;
mod task;

pub use executor::{Action, Job, JobError, JobOutcome};
pub use task::{Interval, Task, TaskUpdate};

use crate::conf::SchedulerConf;
use chrono::{SubsecRound, Utc};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("task {0} not found")]
    NotFound(String),

    #[error("task {0} already exists")]
    Duplicate(String),

    #[error("invalid task {name}: {reason}")]
    InvalidTask { name: String, reason: String },

    /// The in-memory change, if any, stays applied.
    #[error("persist schedule {}: {source}", .path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build http client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Owns the task map, fires due tasks through a bounded worker queue and keeps
/// the schedule file in sync with every mutation.
pub struct Scheduler {
    conf: SchedulerConf,
    tasks: RwLock<BTreeMap<String, Task>>,
    job_tx: mpsc::Sender<Job>,
    job_rx: std::sync::Mutex<Option<mpsc::Receiver<Job>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(conf: SchedulerConf) -> Self {
        let (job_tx, job_rx) = mpsc::channel(conf.queue_size.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            conf,
            tasks: RwLock::new(BTreeMap::new()),
            job_tx,
            job_rx: std::sync::Mutex::new(Some(job_rx)),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn schedule_path(&self) -> &Path {
        &self.conf.schedule_path
    }

    /// Loads the schedule file, starts the worker pool and the check loop. The
    /// scheduler starts empty when the file is missing. An unreadable file is
    /// renamed to `<path>.broken` so later writes cannot replace it. The first
    /// check runs one interval after start.
    pub async fn start(self: &Arc<Self>) -> Result<(), ScheduleError> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started");
            return Ok(());
        }

        match self.import_schedule(&self.conf.schedule_path).await {
            Ok(n) => info!(
                "Scheduler loaded {} tasks from {}",
                n,
                self.conf.schedule_path.display()
            ),
            Err(ScheduleError::Persist { source, .. })
                if source.kind() == ErrorKind::NotFound =>
            {
                info!(
                    "No schedule at {}, start empty",
                    self.conf.schedule_path.display()
                )
            }
            Err(e) => {
                warn!("Scheduler could not import schedule: {}", e);
                match persist::set_aside(&self.conf.schedule_path).await {
                    Ok(p) => warn!("Keep unreadable schedule as {}", p.display()),
                    Err(e) => error!("Set aside unreadable schedule fail: {}", e),
                }
            }
        }

        let client = executor::build_client(self.conf.request_timeout())?;
        let job_rx = match self.job_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(job_rx) = job_rx {
            let (outcome_tx, outcome_rx) = mpsc::channel(self.conf.queue_size.max(1));
            executor::spawn_workers(
                self.conf.workers.max(1),
                client,
                self.conf.base_url.clone(),
                job_rx,
                outcome_tx,
                self.shutdown.subscribe(),
            );
            tokio::spawn(executor::log_outcomes(outcome_rx));
        }

        tokio::spawn(self.clone().run(self.shutdown.subscribe()));
        info!(
            "Scheduler started, check every {:?}",
            self.conf.check_interval()
        );
        Ok(())
    }

    /// Persists the schedule and stops the loop and workers. Only the first call
    /// has any effect.
    pub async fn stop(&self) -> Result<(), ScheduleError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Scheduler already stopped");
            return Ok(());
        }

        let persisted = self.export_schedule(&self.conf.schedule_path).await;
        self.shutdown.send_replace(true);
        info!("Scheduler stopped");
        persisted
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.conf.check_interval();
        // first check one period after start
        let mut interval = time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.check_and_execute_schedule().await {
                        Ok(0) => debug!("No task due"),
                        Ok(n) => info!("Fired {} tasks", n),
                        Err(e) => error!("Schedule check fail: {}", e),
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Scheduler loop exit");
    }

    /// Fires every due task and moves it to its next state. The write lock is
    /// held from the due check until the schedule file is written. Returns the
    /// number of fired tasks.
    pub async fn check_and_execute_schedule(&self) -> Result<usize, ScheduleError> {
        let now = Utc::now().trunc_subsecs(0);
        let mut tasks = self.tasks.write().await;

        let mut fired = 0;
        for task in tasks.values_mut() {
            if !task.is_due(now) {
                continue;
            }
            task.last_ran = Some(now);
            match task.job(now) {
                Some(job) => self.enqueue(job),
                None => warn!("Task {} has nothing to run", task.name),
            }
            task.reschedule(now);
            fired += 1;
        }

        if fired > 0 {
            persist::write_schedule(&self.conf.schedule_path, &tasks).await?;
        }
        Ok(fired)
    }

    fn enqueue(&self, job: Job) {
        match self.job_tx.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => warn!("Job queue full, drop {}", job),
            Err(TrySendError::Closed(job)) => warn!("Job queue closed, drop {}", job),
        }
    }

    pub async fn add_task(&self, task: Task) -> Result<Task, ScheduleError> {
        task.validate()?;
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.name) {
            return Err(ScheduleError::Duplicate(task.name));
        }
        info!("Add task {}", task.name);
        tasks.insert(task.name.clone(), task.clone());
        persist::write_schedule(&self.conf.schedule_path, &tasks).await?;
        Ok(task)
    }

    pub async fn get_task(&self, name: &str) -> Option<Task> {
        self.tasks.read().await.get(name).cloned()
    }

    /// All tasks ordered by name.
    pub async fn list_tasks(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Applies `update` to the task called `name`. A new name re-keys the task.
    pub async fn edit_task(&self, name: &str, update: TaskUpdate) -> Result<Task, ScheduleError> {
        let mut tasks = self.tasks.write().await;
        let mut task = tasks
            .get(name)
            .cloned()
            .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;

        update.apply_to(&mut task);
        task.validate()?;
        if task.name != name {
            if tasks.contains_key(&task.name) {
                return Err(ScheduleError::Duplicate(task.name));
            }
            tasks.remove(name);
        }

        info!("Edit task {}", task.name);
        tasks.insert(task.name.clone(), task.clone());
        persist::write_schedule(&self.conf.schedule_path, &tasks).await?;
        Ok(task)
    }

    pub async fn delete_task(&self, name: &str) -> Result<Task, ScheduleError> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .remove(name)
            .ok_or_else(|| ScheduleError::NotFound(name.to_string()))?;
        info!("Delete task {}", name);
        persist::write_schedule(&self.conf.schedule_path, &tasks).await?;
        Ok(task)
    }

    pub async fn export_schedule(&self, path: &Path) -> Result<(), ScheduleError> {
        let tasks = self.tasks.read().await;
        persist::write_schedule(path, &tasks).await
    }

    /// Replaces the whole task map with the file's content.
    pub async fn import_schedule(&self, path: &Path) -> Result<usize, ScheduleError> {
        let imported = persist::read_schedule(path).await?;
        let n = imported.len();
        *self.tasks.write().await = imported;
        Ok(n)
    }
}
