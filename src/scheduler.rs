//! Candle-aligned recurring action scheduler
//!
//! Fires an action at every interval boundary between a window's start and
//! end time. Boundaries are always recomputed from the wall clock, so a slow
//! action never shifts later firings. Once no boundary is left for today the
//! chain ends; it does not resume on the next day.

use chrono::{Duration, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("no action provided to the scheduler")]
    MissingAction,
}

/// Window and cadence of a schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerParams {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    /// Minutes between boundaries
    pub interval: u32,
}

/// Next boundary strictly after `now`, or `None` when today's window is done.
pub fn next_run_time(now: NaiveDateTime, params: &SchedulerParams) -> Option<NaiveDateTime> {
    let today = now.date();
    let start = today.and_time(params.start_time);
    let end = today.and_time(params.end_time);

    if now < start {
        return Some(start);
    }
    if now > end {
        return None;
    }

    let interval = i64::from(params.interval.max(1));
    let minutes_since_start = (now - start).num_minutes();
    let next_multiple = (minutes_since_start / interval + 1) * interval;
    let next = start + Duration::minutes(next_multiple);

    (next <= end).then_some(next)
}

/// Source of "now" in the venue's local time
pub type Clock = Arc<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// Wall clock in the given timezone
pub fn wall_clock(tz: Tz) -> Clock {
    Arc::new(move || Utc::now().with_timezone(&tz).naive_local())
}

/// Cloneable handle that stops a running schedule
#[derive(Clone)]
pub struct ShutdownSignal(Arc<watch::Sender<bool>>);

impl ShutdownSignal {
    pub fn trigger(&self) {
        let _ = self.0.send(true);
    }
}

/// Self-rescheduling one-shot timer chain
pub struct ActionScheduler {
    params: SchedulerParams,
    clock: Clock,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl ActionScheduler {
    pub fn new(params: SchedulerParams, tz: Tz) -> Self {
        Self::with_clock(params, wall_clock(tz))
    }

    pub fn with_clock(params: SchedulerParams, clock: Clock) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            params,
            clock,
            shutdown_tx: Arc::new(shutdown_tx),
        }
    }

    pub fn params(&self) -> &SchedulerParams {
        &self.params
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal(self.shutdown_tx.clone())
    }

    /// Run the chain until today's window is exhausted or shutdown is
    /// signalled. Each firing runs on its own task.
    pub async fn schedule<F, Fut>(&self, action: Option<F>) -> Result<(), SchedulerError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(action) = action else {
            error!("No action provided to the scheduler");
            return Err(SchedulerError::MissingAction);
        };

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut last_fired: Option<NaiveDateTime> = None;

        loop {
            if *shutdown_rx.borrow() {
                info!("Scheduler stopped");
                return Ok(());
            }

            let now = (self.clock)();
            // Never fire the same boundary twice if the timer woke early
            let from = match last_fired {
                Some(last) if now <= last => last,
                _ => now,
            };

            let Some(next_run) = next_run_time(from, &self.params) else {
                info!(
                    "Market closed or no next run scheduled today. \
                     Restart the application before tomorrow's market open"
                );
                return Ok(());
            };

            let wait = (next_run - now).to_std().unwrap_or_default();
            info!(
                "Next run scheduled at {} (in {:.1}s)",
                next_run.format("%H:%M:%S"),
                wait.as_secs_f64()
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Scheduler stopped");
                        return Ok(());
                    }
                    continue;
                }
            }

            last_fired = Some(next_run);
            debug!("Firing scheduled action for {}", next_run.format("%H:%M"));
            tokio::spawn(action());
        }
    }
}
