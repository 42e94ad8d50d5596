use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::pipeline::{Pipeline, RunSummary};
use crate::EngineError;

#[async_trait]
pub trait PipelineRunner: Send + Sync + 'static {
    async fn run_pipeline(&self) -> Result<RunSummary, EngineError>;
}

#[async_trait]
impl PipelineRunner for Pipeline {
    async fn run_pipeline(&self) -> Result<RunSummary, EngineError> {
        self.run_once().await
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub runs_started: u64,
    pub ticks_skipped: u64,
}

/// Clears the in-flight flag when the run task ends, panics included.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fixed-interval driver with at most one run in flight.
pub struct Scheduler<R: PipelineRunner> {
    runner: Arc<R>,
    interval: Duration,
    shutdown: CancellationToken,
    in_flight: Arc<AtomicBool>,
    runs_started: AtomicU64,
    ticks_skipped: AtomicU64,
}

impl<R: PipelineRunner> Scheduler<R> {
    pub fn new(runner: Arc<R>, interval: Duration, shutdown: CancellationToken) -> Self {
        Self {
            runner,
            interval,
            shutdown,
            in_flight: Arc::new(AtomicBool::new(false)),
            runs_started: AtomicU64::new(0),
            ticks_skipped: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            runs_started: self.runs_started.load(Ordering::Relaxed),
            ticks_skipped: self.ticks_skipped.load(Ordering::Relaxed),
        }
    }

    /// Starts a run unless one is already in flight.
    pub fn try_trigger(&self) -> Option<JoinHandle<()>> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            warn!("previous pipeline run still in progress, skipping tick");
            return None;
        }
        self.runs_started.fetch_add(1, Ordering::Relaxed);

        let guard = InFlightGuard(self.in_flight.clone());
        let runner = self.runner.clone();
        Some(tokio::spawn(async move {
            let _guard = guard;
            let run = tokio::spawn(async move { runner.run_pipeline().await });
            match run.await {
                Ok(Ok(summary)) => info!(
                    run_id = %summary.run_id,
                    groups = summary.groups,
                    delivered = summary.delivered,
                    "scheduled run complete"
                ),
                Ok(Err(err)) => error!(error = %err, "scheduled run failed"),
                Err(join_err) if join_err.is_panic() => error!("scheduled run panicked"),
                Err(join_err) => error!(error = %join_err, "scheduled run aborted"),
            }
        }))
    }

    /// Ticks until the shutdown token fires, then waits for the in-flight run.
    pub async fn start(&self) -> SchedulerStats {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        let mut current: Option<JoinHandle<()>> = None;
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    info!("scheduler received shutdown signal");
                    break;
                }
                _ = ticker.tick() => {
                    if let Some(handle) = self.try_trigger() {
                        current = Some(handle);
                    }
                }
            }
        }

        if let Some(handle) = current.take() {
            if !handle.is_finished() {
                info!("waiting for in-flight pipeline run");
            }
            if let Err(err) = handle.await {
                error!(error = %err, "in-flight run task failed");
            }
        }
        let stats = self.stats();
        info!(
            runs_started = stats.runs_started,
            ticks_skipped = stats.ticks_skipped,
            "scheduler stopped"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    #[derive(Default)]
    struct SlowRunner {
        run_for: Duration,
        calls: AtomicUsize,
        completed: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail_first: bool,
        panic_first: bool,
    }

    #[async_trait]
    impl PipelineRunner for SlowRunner {
        async fn run_pipeline(&self) -> Result<RunSummary, EngineError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.run_for).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.completed.fetch_add(1, Ordering::SeqCst);
            if call == 0 && self.panic_first {
                panic!("boom");
            }
            if call == 0 && self.fail_first {
                return Err(EngineError::SourceUnavailable("db down".into()));
            }
            Ok(RunSummary::new(Uuid::new_v4(), Utc::now()))
        }
    }

    fn cancel_after(token: &CancellationToken, after: Duration) {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            token.cancel();
        });
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_ticks_are_skipped_not_queued() {
        let runner = Arc::new(SlowRunner {
            run_for: Duration::from_secs(12 * 60),
            ..Default::default()
        });
        let token = CancellationToken::new();
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(5 * 60), token.clone());
        cancel_after(&token, Duration::from_secs(16 * 60));

        let stats = scheduler.start().await;

        // Runs start at 0 and 15 minutes; the ticks at 5 and 10 find a run in flight.
        assert_eq!(stats.runs_started, 2);
        assert_eq!(stats.ticks_skipped, 2);
        assert_eq!(runner.max_active.load(Ordering::SeqCst), 1);
        // Shutdown waited for the second run to finish.
        assert_eq!(runner.completed.load(Ordering::SeqCst), 2);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_and_panicking_runs_do_not_stop_the_loop() {
        for (fail_first, panic_first) in [(true, false), (false, true)] {
            let runner = Arc::new(SlowRunner {
                run_for: Duration::from_secs(1),
                fail_first,
                panic_first,
                ..Default::default()
            });
            let token = CancellationToken::new();
            let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(60), token.clone());
            cancel_after(&token, Duration::from_secs(150));

            let stats = scheduler.start().await;
            assert_eq!(stats.runs_started, 3);
            assert_eq!(stats.ticks_skipped, 0);
            assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_start_returns_without_running() {
        let runner = Arc::new(SlowRunner::default());
        let token = CancellationToken::new();
        token.cancel();
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(60), token);

        let stats = scheduler.start().await;
        assert_eq!(stats, SchedulerStats::default());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn trigger_is_single_flight() {
        let runner = Arc::new(SlowRunner {
            run_for: Duration::from_millis(50),
            ..Default::default()
        });
        let scheduler = Scheduler::new(runner.clone(), Duration::from_secs(60), CancellationToken::new());

        let first = scheduler.try_trigger().expect("first trigger runs");
        assert!(scheduler.is_running());
        assert!(scheduler.try_trigger().is_none());
        first.await.unwrap();
        assert!(!scheduler.is_running());
        assert!(scheduler.try_trigger().is_some());
    }
}
