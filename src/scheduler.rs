//! Per-class run scheduling with skip-if-running locks.
//!
//! Each class has at most one run in flight. [`RunScheduler::trigger_now`]
//! takes the class lock before any remote I/O and fails fast with
//! [`TriggerError::Locked`] if it is held; nothing is queued. Periodic
//! timers go through the same path, so manual and scheduled runs lock,
//! log, and abort identically.
//!
//! The lock is a [`PipelineLockGuard`] moved into the task that executes
//! the run. It is released when that task ends, whether the run succeeded,
//! aborted, or panicked, and even if the caller that triggered it went away.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use docsync_core::run::{PipelineRun, RunMode, RunOutcome, Trigger};

use crate::classes::ClassKind;
use crate::ingest::{PipelineOrchestrator, SyncOptions};
use crate::runlog::RunLog;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("class '{class}' is already running (run {holder_run_id})")]
    Locked {
        class: String,
        holder_run_id: String,
    },
    #[error("unknown document class: '{0}'")]
    UnknownClass(String),
    #[error("run log unavailable: {0}")]
    RunLog(String),
    #[error("run task failed: {0}")]
    Internal(String),
    #[error("class '{0}': timer interval must be greater than zero")]
    ZeroInterval(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockHolder {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
}

/// One lock slot per class; a present entry means the class is running.
#[derive(Debug, Default)]
pub struct LockRegistry {
    held: Mutex<HashMap<String, LockHolder>>,
}

impl LockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the class lock, or report who holds it.
    pub fn try_acquire(
        self: &Arc<Self>,
        class: &str,
        run_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<PipelineLockGuard, LockHolder> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(holder) = held.get(class) {
            return Err(holder.clone());
        }
        held.insert(
            class.to_string(),
            LockHolder {
                run_id: run_id.to_string(),
                started_at,
            },
        );
        Ok(PipelineLockGuard {
            registry: Arc::clone(self),
            class: class.to_string(),
            run_id: run_id.to_string(),
        })
    }

    pub fn holder(&self, class: &str) -> Option<LockHolder> {
        self.held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(class)
            .cloned()
    }
}

/// Releases the class lock exactly once, on drop.
#[derive(Debug)]
pub struct PipelineLockGuard {
    registry: Arc<LockRegistry>,
    class: String,
    run_id: String,
}

impl PipelineLockGuard {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl Drop for PipelineLockGuard {
    fn drop(&mut self) {
        let mut held = self.registry.held.lock().unwrap_or_else(|e| e.into_inner());
        if held.get(&self.class).map(|h| h.run_id.as_str()) == Some(self.run_id.as_str()) {
            held.remove(&self.class);
        }
    }
}

/// Lock and timer state of one class, for the operator API.
#[derive(Debug, Clone, Serialize)]
pub struct ClassStatus {
    pub class: String,
    pub kind: ClassKind,
    pub collection: String,
    pub running: Option<LockHolder>,
    /// Set when a periodic timer is active.
    pub interval_minutes: Option<u64>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<RunOutcome>,
}

struct Timer {
    interval: Duration,
    next_fire: Arc<Mutex<DateTime<Utc>>>,
    handle: JoinHandle<()>,
}

pub struct RunScheduler {
    pipelines: BTreeMap<String, Arc<PipelineOrchestrator>>,
    locks: Arc<LockRegistry>,
    run_log: Arc<dyn RunLog>,
    timers: Mutex<HashMap<String, Timer>>,
}

impl RunScheduler {
    pub fn new(pipelines: Vec<Arc<PipelineOrchestrator>>, run_log: Arc<dyn RunLog>) -> Arc<Self> {
        Arc::new(Self {
            pipelines: pipelines
                .into_iter()
                .map(|p| (p.class().to_string(), p))
                .collect(),
            locks: LockRegistry::new(),
            run_log,
            timers: Mutex::new(HashMap::new()),
        })
    }

    pub fn pipeline(&self, class: &str) -> Option<&Arc<PipelineOrchestrator>> {
        self.pipelines.get(class)
    }

    pub fn run_log(&self) -> &Arc<dyn RunLog> {
        &self.run_log
    }

    /// Run `class` now, waiting for it to finish.
    ///
    /// Returns the finalized run, which may be `aborted`. Only a held lock,
    /// an unknown class, or an unwritable run log is an `Err`.
    pub async fn trigger_now(
        &self,
        class: &str,
        trigger: Trigger,
        options: SyncOptions,
    ) -> Result<PipelineRun, TriggerError> {
        let pipeline = self
            .pipelines
            .get(class)
            .cloned()
            .ok_or_else(|| TriggerError::UnknownClass(class.to_string()))?;

        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let guard = self
            .locks
            .try_acquire(class, &run_id, started_at)
            .map_err(|holder| TriggerError::Locked {
                class: class.to_string(),
                holder_run_id: holder.run_id,
            })?;

        let run = PipelineRun::begin(
            run_id,
            class,
            trigger,
            RunMode::from_dry_run(options.dry_run),
            started_at,
        );
        self.run_log
            .start(&run)
            .await
            .map_err(|e| TriggerError::RunLog(format!("{:#}", e)))?;
        info!(class, run_id = %run.id, trigger = %trigger, mode = %run.mode, "run started");

        let run_log = Arc::clone(&self.run_log);
        let task = tokio::spawn(async move {
            let _guard = guard;
            let class = pipeline.class().to_string();
            let work = tokio::spawn(async move { pipeline.run(&options, started_at).await });
            let finished = match work.await {
                Ok(Ok(summary)) => run.complete(summary, Utc::now()),
                Ok(Err(e)) => {
                    error!(class = %class, run_id = %run.id, error = %e, "run aborted");
                    run.abort(e.to_string(), Utc::now())
                }
                Err(join_err) => {
                    error!(class = %class, run_id = %run.id, error = %join_err, "run task failed");
                    run.abort(format!("run task failed: {}", join_err), Utc::now())
                }
            };
            if finished.outcome != RunOutcome::Aborted {
                info!(
                    class = %class,
                    run_id = %finished.id,
                    outcome = %finished.outcome,
                    fetched = finished.counts.fetched,
                    failed = finished.counts.failed,
                    "run finished"
                );
            }
            if let Err(e) = run_log.finish(&finished).await {
                error!(class = %class, run_id = %finished.id, error = %format!("{:#}", e), "failed to record run");
            }
            finished
        });

        task.await
            .map_err(|e| TriggerError::Internal(e.to_string()))
    }

    /// Fire `class` every `interval`, first at `offset` from now.
    ///
    /// A tick that finds the class still running is skipped, not queued.
    /// Rescheduling a class replaces its previous timer.
    pub fn schedule(
        self: &Arc<Self>,
        class: &str,
        interval: Duration,
        offset: Duration,
    ) -> Result<(), TriggerError> {
        if !self.pipelines.contains_key(class) {
            return Err(TriggerError::UnknownClass(class.to_string()));
        }
        if interval.is_zero() {
            return Err(TriggerError::ZeroInterval(class.to_string()));
        }
        let scheduler = Arc::clone(self);
        let name = class.to_string();
        let next_fire = Arc::new(Mutex::new(fire_at(offset)));
        let next = Arc::clone(&next_fire);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + offset, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                *next.lock().unwrap_or_else(|e| e.into_inner()) = fire_at(interval);
                match scheduler
                    .trigger_now(&name, Trigger::Scheduled, SyncOptions::incremental(false))
                    .await
                {
                    Ok(run) => info!(
                        class = %name,
                        run_id = %run.id,
                        outcome = %run.outcome,
                        "scheduled run finished"
                    ),
                    Err(TriggerError::Locked { holder_run_id, .. }) => info!(
                        class = %name,
                        holder = %holder_run_id,
                        "scheduled run skipped, already running"
                    ),
                    Err(e) => warn!(class = %name, error = %e, "scheduled run failed to start"),
                }
            }
        });

        info!(
            class,
            interval_minutes = interval.as_secs() / 60,
            offset_minutes = offset.as_secs() / 60,
            "scheduled"
        );
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let timer = Timer {
            interval,
            next_fire,
            handle,
        };
        if let Some(previous) = timers.insert(class.to_string(), timer) {
            previous.handle.abort();
        }
        Ok(())
    }

    /// Start a timer for every class with its configured interval and offset.
    pub fn start_all(self: &Arc<Self>) {
        for pipeline in self.pipelines.values() {
            let settings = pipeline.settings();
            if let Err(e) = self.schedule(&settings.name, settings.interval, settings.start_offset) {
                warn!(class = %settings.name, error = %e, "could not start timer");
            }
        }
    }

    /// Run history, newest first.
    pub async fn status(&self, limit: usize) -> anyhow::Result<Vec<PipelineRun>> {
        self.run_log.recent(None, limit).await
    }

    pub async fn class_status(&self) -> anyhow::Result<Vec<ClassStatus>> {
        let mut out = Vec::with_capacity(self.pipelines.len());
        for pipeline in self.pipelines.values() {
            let settings = pipeline.settings();
            let last_outcome = self
                .run_log
                .recent(Some(&settings.name), 1)
                .await?
                .into_iter()
                .next()
                .map(|run| run.outcome);
            let (interval_minutes, next_run_at) = {
                let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
                match timers.get(&settings.name) {
                    Some(timer) => (
                        Some(timer.interval.as_secs() / 60),
                        Some(*timer.next_fire.lock().unwrap_or_else(|e| e.into_inner())),
                    ),
                    None => (None, None),
                }
            };
            out.push(ClassStatus {
                class: settings.name.clone(),
                kind: settings.kind,
                collection: settings.collection.clone(),
                running: self.locks.holder(&settings.name),
                interval_minutes,
                next_run_at,
                last_outcome,
            });
        }
        Ok(out)
    }

    /// Stop all timers. Runs already in flight finish and release their locks.
    pub fn shutdown(&self) {
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for (class, timer) in timers.drain() {
            timer.handle.abort();
            info!(class = %class, "timer stopped");
        }
    }
}

/// Wall-clock time `after` from now, clamped to the latest representable instant.
fn fire_at(after: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(after)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
