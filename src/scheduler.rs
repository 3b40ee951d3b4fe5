//! Periodic build scheduling with single-flight discipline.
//!
//! One in-process ticker drives the orchestrator at the configured
//! interval. An immediate run fires at startup without blocking it. Ticks
//! that land while a build is in flight are dropped with a warning, never
//! queued; a manual trigger takes the same guard and fails fast with `Busy`.
//!
//! The scheduler state (running flag, in-flight flag, counters, last
//! attempt) is the only cross-task mutable state in the service and lives
//! under a single mutex.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::orchestrator::{BuildOutcome, Orchestrator};
use crate::storage::now_millis;

/// A scheduler whose last attempt is older than this multiple of the
/// interval is reported unhealthy.
const STALE_FACTOR: f64 = 1.5;

#[derive(Debug, Default)]
struct State {
    running: bool,
    build_in_progress: bool,
    runs_completed: u64,
    runs_failed: u64,
    ticks_dropped: u64,
    /// Epoch millis of the most recent build attempt (any trigger).
    last_attempt: Option<i64>,
    started_at: Option<i64>,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub build_in_progress: bool,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub ticks_dropped: u64,
    pub last_attempt: Option<i64>,
    pub interval_minutes: u64,
    pub cron_expression: String,
    pub healthy: bool,
}

pub struct Scheduler {
    interval_minutes: u64,
    orchestrator: Arc<Orchestrator>,
    state: Mutex<State>,
    stop_tx: watch::Sender<bool>,
}

/// Clears the in-flight flag on every exit path, including cancellation.
struct FlightGuard<'a>(&'a Scheduler);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.state.lock().build_in_progress = false;
    }
}

impl Scheduler {
    pub fn new(interval_minutes: u64, orchestrator: Arc<Orchestrator>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            interval_minutes,
            orchestrator,
            state: Mutex::new(State::default()),
            stop_tx,
        })
    }

    /// Spawn the ticker task. Returns immediately; the startup build runs
    /// asynchronously inside the task.
    pub fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();

        {
            let mut state = self.state.lock();
            state.running = true;
            state.started_at = Some(now_millis());
        }

        info!(
            interval_minutes = self.interval_minutes,
            cron = %cron_expression(self.interval_minutes),
            "scheduler started"
        );

        tokio::spawn(async move {
            // Immediate first build; startup itself was not blocked.
            scheduler.run_tick("startup").await;

            let mut ticker =
                tokio::time::interval(Duration::from_secs(scheduler.interval_minutes * 60));
            // A delayed tick fires once and the cadence resumes from there.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() yields its first tick immediately; that run just
            // happened above.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        scheduler.run_tick("interval").await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            scheduler.state.lock().running = false;
            info!("scheduler stopped; no further ticks");
        });
    }

    /// Stop issuing ticks. An in-flight build finishes on its own; this
    /// call does not wait for it.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Manual trigger with the same single-flight guard as the ticker.
    /// Fails fast with `Busy` while a build is in flight.
    pub async fn trigger_now(&self) -> Result<BuildOutcome> {
        let _guard = self.try_begin().ok_or(Error::Busy("build"))?;

        let result = self.orchestrator.build_and_sync().await;
        let mut state = self.state.lock();
        match result {
            Ok(outcome) => {
                state.runs_completed += 1;
                Ok(outcome)
            }
            Err(e) => {
                state.runs_failed += 1;
                Err(e)
            }
        }
    }

    async fn run_tick(&self, trigger: &'static str) {
        let Some(_guard) = self.try_begin() else {
            self.state.lock().ticks_dropped += 1;
            metrics::record_tick_dropped();
            warn!(trigger, "build already in progress; dropping tick");
            return;
        };

        match self.orchestrator.build_and_sync().await {
            Ok(outcome) => {
                self.state.lock().runs_completed += 1;
                info!(
                    trigger,
                    root = %outcome.root_hash,
                    written = outcome.written,
                    "scheduled build finished"
                );
            }
            Err(e) => {
                self.state.lock().runs_failed += 1;
                // A failed build never stops the service.
                error!(trigger, kind = e.kind(), error = %e, "scheduled build failed");
            }
        }
    }

    fn try_begin(&self) -> Option<FlightGuard<'_>> {
        let mut state = self.state.lock();
        if state.build_in_progress {
            return None;
        }
        state.build_in_progress = true;
        state.last_attempt = Some(now_millis());
        Some(FlightGuard(self))
    }

    #[must_use]
    pub fn is_build_in_progress(&self) -> bool {
        self.state.lock().build_in_progress
    }

    /// Unhealthy when not running, or when no attempt has landed within
    /// 1.5x the interval.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock();
        self.healthy_locked(&state)
    }

    fn healthy_locked(&self, state: &State) -> bool {
        if !state.running {
            return false;
        }
        let reference = state.last_attempt.or(state.started_at);
        match reference {
            Some(at) => {
                let stale_after =
                    (self.interval_minutes as f64 * 60_000.0 * STALE_FACTOR) as i64;
                now_millis() - at <= stale_after
            }
            None => false,
        }
    }

    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        let state = self.state.lock();
        SchedulerStatus {
            running: state.running,
            build_in_progress: state.build_in_progress,
            runs_completed: state.runs_completed,
            runs_failed: state.runs_failed,
            ticks_dropped: state.ticks_dropped,
            last_attempt: state.last_attempt,
            interval_minutes: self.interval_minutes,
            cron_expression: cron_expression(self.interval_minutes),
            healthy: self.healthy_locked(&state),
        }
    }
}

/// Cron rendering of the scan interval, for status display.
///
/// 1 minute maps to every minute, 2-59 to a minute step, whole hours to an
/// hour step, and anything else falls back to a minute step.
#[must_use]
pub fn cron_expression(interval_minutes: u64) -> String {
    match interval_minutes {
        1 => "* * * * *".to_string(),
        2..=59 => format!("*/{interval_minutes} * * * *"),
        n if n % 60 == 0 => format!("0 */{} * * *", n / 60),
        n => format!("*/{n} * * * *"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TreeCache;
    use crate::storage::memory::MemoryStore;
    use crate::sync::TreeSync;
    use std::io::Write;
    use tempfile::TempDir;

    fn scheduler_over(dir: &TempDir, interval_minutes: u64) -> Arc<Scheduler> {
        let store = Arc::new(MemoryStore::new());
        let cache = TreeCache::disabled();
        let sync = TreeSync::new(cache.clone(), store);
        let orchestrator = Arc::new(Orchestrator::new(
            dir.path().to_path_buf(),
            None,
            sync,
            cache,
        ));
        Scheduler::new(interval_minutes, orchestrator)
    }

    fn populated_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::File::create(dir.path().join("a.txt"))
            .unwrap()
            .write_all(b"alpha")
            .unwrap();
        dir
    }

    #[test]
    fn test_cron_expression_mapping() {
        assert_eq!(cron_expression(1), "* * * * *");
        assert_eq!(cron_expression(2), "*/2 * * * *");
        assert_eq!(cron_expression(59), "*/59 * * * *");
        assert_eq!(cron_expression(60), "0 */1 * * *");
        assert_eq!(cron_expression(180), "0 */3 * * *");
        assert_eq!(cron_expression(90), "*/90 * * * *");
    }

    #[tokio::test]
    async fn test_manual_trigger_builds() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 60);

        let outcome = scheduler.trigger_now().await.unwrap();
        assert!(outcome.written);

        let status = scheduler.status();
        assert_eq!(status.runs_completed, 1);
        assert!(!status.build_in_progress);
        assert!(status.last_attempt.is_some());
    }

    #[tokio::test]
    async fn test_second_concurrent_trigger_is_busy() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 60);

        // Simulate an in-flight build by holding the guard.
        let guard = scheduler.try_begin().unwrap();
        let err = scheduler.trigger_now().await.unwrap_err();
        assert_eq!(err.kind(), "busy");

        drop(guard);
        assert!(scheduler.trigger_now().await.is_ok());
    }

    #[tokio::test]
    async fn test_guard_clears_flag_on_drop() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 60);

        {
            let _guard = scheduler.try_begin().unwrap();
            assert!(scheduler.is_build_in_progress());
        }
        assert!(!scheduler.is_build_in_progress());
    }

    #[tokio::test]
    async fn test_failed_build_counts_and_returns_error() {
        // Empty directory: every build fails with Empty.
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler_over(&dir, 60);

        let err = scheduler.trigger_now().await.unwrap_err();
        assert_eq!(err.kind(), "empty");
        assert_eq!(scheduler.status().runs_failed, 1);
        assert!(!scheduler.is_build_in_progress());
    }

    #[tokio::test]
    async fn test_not_started_is_unhealthy() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 60);
        assert!(!scheduler.is_healthy());
    }

    #[tokio::test]
    async fn test_stale_last_attempt_is_unhealthy() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 1);
        {
            let mut state = scheduler.state.lock();
            state.running = true;
            // Last attempt 10 minutes ago on a 1-minute interval.
            state.last_attempt = Some(now_millis() - 600_000);
        }
        assert!(!scheduler.is_healthy());
    }

    #[tokio::test]
    async fn test_recent_attempt_is_healthy() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 60);
        {
            let mut state = scheduler.state.lock();
            state.running = true;
            state.last_attempt = Some(now_millis());
        }
        assert!(scheduler.is_healthy());
    }

    #[tokio::test]
    async fn test_start_runs_immediately_and_stop_halts() {
        let dir = populated_dir();
        let scheduler = scheduler_over(&dir, 60);
        scheduler.start();

        // The startup build runs asynchronously; poll briefly for it.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while scheduler.status().runs_completed == 0 {
            assert!(std::time::Instant::now() < deadline, "startup build never ran");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scheduler.is_healthy());

        scheduler.stop();
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while scheduler.status().running {
            assert!(std::time::Instant::now() < deadline, "scheduler never stopped");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!scheduler.is_healthy());
    }
}
