//! Request aggregation and the coalesced polling timer.
//!
//! Every live update request contributes an [`IntervalDemand`]. The demands
//! fold into one [`IntervalPlan`]: the shortest periodic interval (never below
//! the floor) and whether a single-shot request wants an immediate poll.
//! [`IntervalScheduler`] installs that plan as one timer driving a
//! [`PollTarget`].

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Polling floor applied to every periodic request.
pub const MIN_INTERVAL: Duration = Duration::from_millis(2_500);

/// What one request asks of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalDemand {
    /// Requested interval; zero or negative means "as soon as possible"
    pub interval_ms: i64,
    /// Updates still owed to the request
    pub pending: u32,
}

/// The coalesced schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IntervalPlan {
    /// Periodic interval, `None` disables the timer
    pub interval: Option<Duration>,
    /// A single-shot request is waiting
    pub request_now: bool,
}

/// Folds request demands into one plan.
///
/// Single-shot requests (interval <= 0, exactly one update pending) ask for
/// an immediate poll and do not take part in the periodic minimum. Every other
/// request with pending updates contributes `max(interval, floor)`.
pub fn plan_interval<I>(demands: I, floor: Duration) -> IntervalPlan
where
    I: IntoIterator<Item = IntervalDemand>,
{
    let mut plan = IntervalPlan::default();
    for demand in demands {
        if demand.pending == 0 {
            continue;
        }
        if demand.interval_ms <= 0 && demand.pending == 1 {
            plan.request_now = true;
            continue;
        }
        let requested = Duration::from_millis(demand.interval_ms.max(0) as u64);
        let effective = requested.max(floor).max(Duration::from_millis(1));
        plan.interval = Some(match plan.interval {
            Some(current) => current.min(effective),
            None => effective,
        });
    }
    plan
}

/// Initial delay for a new timer so the time already waited since the last
/// tick still counts. A timer that never ticked fires immediately.
pub fn phase_delay(interval: Duration, since_last_tick: Option<Duration>) -> Duration {
    match since_last_tick {
        Some(elapsed) => interval.saturating_sub(elapsed),
        None => Duration::ZERO,
    }
}

/// Something the scheduler polls.
#[async_trait]
pub trait PollTarget: Send + Sync + 'static {
    async fn poll(&self);
}

#[derive(Default)]
struct Timer {
    interval: Option<Duration>,
    task: Option<JoinHandle<()>>,
}

/// Drives a [`PollTarget`] from the current [`IntervalPlan`].
pub struct IntervalScheduler {
    target: Arc<dyn PollTarget>,
    timer: Mutex<Timer>,
    last_tick: Arc<Mutex<Option<Instant>>>,
    cancel: CancellationToken,
}

impl IntervalScheduler {
    pub fn new(target: Arc<dyn PollTarget>) -> Self {
        Self {
            target,
            timer: Mutex::new(Timer::default()),
            last_tick: Arc::new(Mutex::new(None)),
            cancel: CancellationToken::new(),
        }
    }

    /// Installs `plan`. Returns true if the periodic timer was replaced.
    ///
    /// Must be called from within a tokio runtime.
    pub fn apply(&self, plan: IntervalPlan) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        if plan.request_now {
            self.trigger_now();
        }

        let mut timer = self.timer.lock();
        if timer.interval == plan.interval {
            return false;
        }
        if let Some(task) = timer.task.take() {
            task.abort();
        }
        timer.interval = plan.interval;

        match plan.interval {
            Some(interval) => {
                let since_last_tick = self.last_tick.lock().map(|tick| tick.elapsed());
                let delay = phase_delay(interval, since_last_tick);
                timer.task = Some(self.spawn_timer(interval, delay));
                info!(
                    interval_ms = interval.as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    "Polling interval changed"
                );
            }
            None => info!("Periodic polling disabled"),
        }
        true
    }

    /// Polls the target once, right away.
    pub fn trigger_now(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        debug!("Immediate poll requested");
        let target = Arc::clone(&self.target);
        tokio::spawn(async move { target.poll().await });
    }

    pub fn current_interval(&self) -> Option<Duration> {
        self.timer.lock().interval
    }

    /// Stops the timer for good; later plans are ignored.
    pub fn stop(&self) {
        self.cancel.cancel();
        let mut timer = self.timer.lock();
        if let Some(task) = timer.task.take() {
            task.abort();
        }
        timer.interval = None;
    }

    fn spawn_timer(&self, interval: Duration, delay: Duration) -> JoinHandle<()> {
        let target = Arc::clone(&self.target);
        let last_tick = Arc::clone(&self.last_tick);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + delay, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        *last_tick.lock() = Some(Instant::now());
                        // Polls run detached so replacing the timer never
                        // interrupts a cycle.
                        let target = Arc::clone(&target);
                        tokio::spawn(async move { target.poll().await });
                    }
                }
            }
        })
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
