//! Fixed-interval scheduling with overlap prevention.
//!
//! A [`Scheduler`] drives one [`BatchJob`] (the classification
//! [`Coordinator`](crate::coordinator::Coordinator) or the calendar
//! [`Mirror`](crate::mirror::Mirror)). Ticks come from
//! `tokio::time::interval` with missed ticks skipped, or from
//! [`Scheduler::trigger_now`].
//!
//! At most one run is in flight per scheduler. A tick that finds a run in
//! progress is logged and dropped ([`TickOutcome::Skipped`]), never queued.
//!
//! [`Scheduler::shutdown`] cancels the shared `CancellationToken`, so the
//! in-flight run stops dispatching new items, and then waits for it.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use prism_core::models::{BatchRun, RunKind};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::runs;

/// A unit of periodic work.
#[async_trait]
pub trait BatchJob: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run once. Must observe `cancel` between dispatches and return a
    /// finished [`BatchRun`].
    async fn run(&self, cancel: CancellationToken) -> BatchRun;
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Completed(Box<BatchRun>),
    /// A run was already in progress, or the scheduler is shutting down.
    Skipped,
}

pub struct Scheduler {
    job: Arc<dyn BatchJob>,
    interval: Duration,
    running: Mutex<()>,
    cancel: CancellationToken,
    last: StdMutex<Option<BatchRun>>,
    history: Option<(SqlitePool, RunKind)>,
    ticker: StdMutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn BatchJob>, interval: Duration) -> Self {
        Self {
            job,
            interval,
            running: Mutex::new(()),
            cancel: CancellationToken::new(),
            last: StdMutex::new(None),
            history: None,
            ticker: StdMutex::new(None),
        }
    }

    /// Fall back to persisted runs of `kind` in [`last_run`](Self::last_run).
    pub fn with_history(mut self, pool: SqlitePool, kind: RunKind) -> Self {
        self.history = Some((pool, kind));
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    /// Run the job now unless a run is already in progress.
    pub async fn trigger_now(&self) -> TickOutcome {
        let Ok(_guard) = self.running.try_lock() else {
            tracing::info!(job = self.job.name(), "skipping tick; previous run still in progress");
            return TickOutcome::Skipped;
        };
        if self.cancel.is_cancelled() {
            tracing::debug!(job = self.job.name(), "scheduler shut down; not starting a run");
            return TickOutcome::Skipped;
        }

        let run = self.job.run(self.cancel.child_token()).await;
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(run.clone());
        TickOutcome::Completed(Box::new(run))
    }

    /// Start firing on the interval; the first tick is immediate.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(job = this.job.name(), interval_secs = this.interval.as_secs(), "scheduler started");
            loop {
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        // Runs are spawned so that a tick arriving mid-run is
                        // observed (and skipped) instead of silently delayed.
                        let scheduler = Arc::clone(&this);
                        tokio::spawn(async move {
                            scheduler.trigger_now().await;
                        });
                    }
                }
            }
        });
        *self.ticker.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Cancel, then wait for the ticker and any in-flight run to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.ticker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let _idle = self.running.lock().await;
        tracing::info!(job = self.job.name(), "scheduler stopped");
    }

    /// Most recent run: from memory, else from persisted history.
    pub async fn last_run(&self) -> Result<Option<BatchRun>> {
        if let Some(run) = self.last.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            return Ok(Some(run));
        }
        match &self.history {
            Some((pool, kind)) => runs::last_run(pool, *kind).await,
            None => Ok(None),
        }
    }
}
