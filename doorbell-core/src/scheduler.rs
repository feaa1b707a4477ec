use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};

use crate::pipeline::{CycleReport, Pipeline, PipelineResult};

/// Anything that can run one archive cycle.
#[async_trait]
pub trait CycleRunner: Send + Sync {
    async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> PipelineResult<CycleReport>;
}

#[async_trait]
impl CycleRunner for Pipeline {
    async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> PipelineResult<CycleReport> {
        Pipeline::run_cycle(self, shutdown).await
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("schedule period must be greater than zero")]
    InvalidPeriod,
    #[error("cycle failed fatally: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_skipped: u64,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Idle,
            cycles_completed: 0,
            cycles_failed: 0,
            cycles_skipped: 0,
            last_started_at: None,
            last_finished_at: None,
            last_error: None,
        }
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(CycleReport),
    Failed(String),
    /// The cycle hit an error that will repeat until someone intervenes.
    Fatal(String),
    /// Another cycle was still running.
    Skipped,
}

/// Clears the running flag however the cycle ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Fires cycles on a fixed period, never two at once.
pub struct Scheduler {
    runner: Arc<dyn CycleRunner>,
    period: Duration,
    running: AtomicBool,
    status: Mutex<SchedulerStatus>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn CycleRunner>, period: Duration) -> Result<Self, SchedulerError> {
        if period.is_zero() {
            return Err(SchedulerError::InvalidPeriod);
        }
        Ok(Self {
            runner,
            period,
            running: AtomicBool::new(false),
            status: Mutex::new(SchedulerStatus::default()),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> SchedulerStatus {
        self.lock_status().clone()
    }

    fn lock_status(&self) -> MutexGuard<'_, SchedulerStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs one cycle now unless one is already in progress.
    pub async fn trigger(&self, shutdown: &watch::Receiver<bool>) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.lock_status().cycles_skipped += 1;
            tracing::info!(target: "scheduler", "cycle still running, skipping this trigger");
            return TriggerOutcome::Skipped;
        }
        let _guard = RunningGuard(&self.running);
        {
            let mut status = self.lock_status();
            status.state = SchedulerState::Running;
            status.last_started_at = Some(Utc::now());
        }

        let result = self.runner.run_cycle(shutdown).await;

        let mut status = self.lock_status();
        status.state = SchedulerState::Idle;
        status.last_finished_at = Some(Utc::now());
        match result {
            Ok(report) => {
                status.cycles_completed += 1;
                status.last_error = None;
                TriggerOutcome::Completed(report)
            }
            Err(err) => {
                status.cycles_failed += 1;
                status.last_error = Some(err.to_string());
                if err.is_fatal() {
                    tracing::error!(target: "scheduler", error = %err, "cycle failed fatally");
                    TriggerOutcome::Fatal(err.to_string())
                } else if err.interaction_required() {
                    tracing::warn!(target: "scheduler", error = %err, "cycle paused, login needs a human");
                    TriggerOutcome::Failed(err.to_string())
                } else {
                    tracing::warn!(target: "scheduler", error = %err, "cycle failed, retrying next period");
                    TriggerOutcome::Failed(err.to_string())
                }
            }
        }
    }

    /// Runs a cycle immediately and then every period until `shutdown` turns `true`.
    ///
    /// An in-flight cycle is awaited before returning; it stops on its own between events.
    pub async fn run_forever(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SchedulerStatus, SchedulerError> {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cycles = JoinSet::new();
        let mut fatal = None;

        tracing::info!(
            target: "scheduler",
            period_secs = self.period.as_secs(),
            "scheduler started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    let this = Arc::clone(&self);
                    let rx = shutdown.clone();
                    cycles.spawn(async move { this.trigger(&rx).await });
                }
                Some(joined) = cycles.join_next() => {
                    match joined {
                        Ok(TriggerOutcome::Fatal(message)) => {
                            fatal = Some(message);
                            break;
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(target: "scheduler", error = %err, "cycle task panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if !cycles.is_empty() {
            tracing::info!(target: "scheduler", "waiting for in-flight cycle to finish");
        }
        while let Some(joined) = cycles.join_next().await {
            if let Ok(TriggerOutcome::Fatal(message)) = joined {
                fatal.get_or_insert(message);
            }
        }

        match fatal {
            Some(message) => Err(SchedulerError::Fatal(message)),
            None => {
                tracing::info!(target: "scheduler", "scheduler stopped");
                Ok(self.status())
            }
        }
    }
}
