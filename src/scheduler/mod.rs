//! Scheduler module: cron-driven probe and asset sweeps plus retention.
//!
//! Each sweep kind has its own running flag. A trigger that fires while the
//! previous run of the same kind is still going is skipped, not queued.

mod retention;

pub use retention::*;

use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::MonitorConfig;
use crate::monitor::Monitor;

const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron { expr: String, reason: String },
}

/// Parse a 5-field (minute-first) or 6/7-field (seconds-first) cron expression.
pub fn parse_schedule(expr: &str) -> Result<Schedule, ScheduleError> {
    let expr = expr.trim();
    let invalid = |reason: String| ScheduleError::InvalidCron {
        expr: expr.to_string(),
        reason,
    };

    let normalized = match expr.split_whitespace().count() {
        5 => format!("0 {}", expr),
        6 | 7 => expr.to_string(),
        n => return Err(invalid(format!("expected 5 to 7 fields, got {}", n))),
    };

    Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))
}

/// Next fire deadline for one schedule. The deadline survives `select!`
/// passes that did not fire it, so coincident schedules both run.
struct CronTimer {
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
}

impl CronTimer {
    fn new(schedule: Schedule, now: DateTime<Utc>) -> Self {
        let next = schedule.after(&now).next();
        Self { schedule, next }
    }

    /// Time left until the pending deadline, zero if it already passed.
    fn delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.next
            .map(|at| (at - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Move past the deadline that just fired. Slots missed while the
    /// process was stalled are not replayed.
    fn advance(&mut self, now: DateTime<Utc>) {
        if let Some(fired) = self.next {
            let from = fired.max(now);
            self.next = self.schedule.after(&from).next();
        }
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

/// Random delay in `0..=max`.
fn jitter_delay(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// A sweep kind with an at-most-one-running flag.
struct Job {
    name: &'static str,
    running: AtomicBool,
}

/// Clears the job's running flag when dropped.
struct RunGuard {
    job: Arc<Job>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.job.running.store(false, Ordering::SeqCst);
    }
}

impl Job {
    fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            running: AtomicBool::new(false),
        })
    }

    fn try_begin(self: &Arc<Self>) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard { job: self.clone() })
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Single-process worker driving all periodic work.
pub struct Worker {
    monitor: Monitor,
    probe_schedule: Schedule,
    asset_schedule: Schedule,
    jitter: Duration,
    shutdown_timeout: Duration,
    retention_days: u32,
    probe_job: Arc<Job>,
    asset_job: Arc<Job>,
}

impl Worker {
    pub fn new(monitor: Monitor, cfg: &MonitorConfig) -> Result<Self, ScheduleError> {
        Ok(Self {
            monitor,
            probe_schedule: parse_schedule(&cfg.cron_schedule)?,
            asset_schedule: parse_schedule(&cfg.asset_cron_schedule)?,
            jitter: cfg.jitter,
            shutdown_timeout: cfg.shutdown_timeout,
            retention_days: cfg.retention_days,
            probe_job: Job::new("probe sweep"),
            asset_job: Job::new("asset sweep"),
        })
    }

    pub fn is_idle(&self) -> bool {
        !self.probe_job.is_running() && !self.asset_job.is_running()
    }

    /// Start a probe sweep in the background. Returns `false` if one is
    /// already running and this trigger was skipped.
    pub fn trigger_probe_sweep(&self) -> bool {
        let monitor = self.monitor.clone();
        self.spawn_job(&self.probe_job, async move {
            if let Err(e) = monitor.run_all_checks().await {
                tracing::error!("Probe sweep failed: {}", e);
            }
        })
    }

    /// Start an asset sweep in the background. Same skip rule as probe sweeps.
    pub fn trigger_asset_sweep(&self) -> bool {
        let monitor = self.monitor.clone();
        self.spawn_job(&self.asset_job, async move {
            if let Err(e) = monitor.run_daily_asset_checks().await {
                tracing::error!("Asset sweep failed: {}", e);
            }
        })
    }

    fn spawn_job<F>(&self, job: &Arc<Job>, work: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(guard) = job.try_begin() else {
            tracing::warn!("Skipping {}: previous run still in progress", job.name);
            return false;
        };

        let delay = jitter_delay(self.jitter);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tracing::debug!("Delaying {} by {:?} (jitter)", guard.job.name, delay);
                tokio::time::sleep(delay).await;
            }
            work.await;
            drop(guard);
        });
        true
    }

    fn spawn_retention(&self) {
        let store = self.monitor.store().clone();
        let days = self.retention_days;
        tokio::spawn(async move {
            if let Err(e) = process_retention(store.as_ref(), days, Utc::now()).await {
                tracing::error!("Retention failed: {}", e);
            }
        });
    }

    /// Run until `shutdown` resolves, then wait (bounded) for in-progress
    /// sweeps to finish. A probe sweep starts immediately.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        tracing::info!(
            "Worker started (jitter {:?}, retention {} days)",
            self.jitter,
            self.retention_days
        );
        self.trigger_probe_sweep();

        let mut retention = tokio::time::interval(RETENTION_INTERVAL);
        retention.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let now = Utc::now();
        let mut probe_timer = CronTimer::new(self.probe_schedule.clone(), now);
        let mut asset_timer = CronTimer::new(self.asset_schedule.clone(), now);

        tokio::pin!(shutdown);
        loop {
            let now = Utc::now();
            tokio::select! {
                _ = &mut shutdown => break,
                _ = sleep_for(probe_timer.delay(now)) => {
                    probe_timer.advance(Utc::now());
                    self.trigger_probe_sweep();
                }
                _ = sleep_for(asset_timer.delay(now)) => {
                    asset_timer.advance(Utc::now());
                    self.trigger_asset_sweep();
                }
                _ = retention.tick() => {
                    self.spawn_retention();
                }
            }
        }

        tracing::info!("Shutdown requested, waiting for running sweeps");
        if self.wait_idle(self.shutdown_timeout).await {
            tracing::info!("Worker stopped cleanly");
        } else {
            tracing::warn!(
                "Sweeps still running after {:?}, exiting anyway",
                self.shutdown_timeout
            );
        }
    }

    /// Wait until no sweep is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let poll = async {
            while !self.is_idle() {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }
}
