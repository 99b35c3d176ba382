//! Interval scheduler
//!
//! Raises a tick after an initial delay and then at a fixed interval, for a
//! bounded or unbounded number of repetitions. Pausing keeps the time already
//! spent waiting, so a resumed scheduler fires exactly when it would have
//! without the pause.
//!
//! Deadlines advance by whole intervals from the previous deadline rather
//! than from the moment a tick was handled, so slow listeners do not make
//! the cadence drift.

use common::{Observers, Result, ScanError, SubscriptionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// How many ticks a run produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Repetitions {
    #[default]
    Unbounded,
    Limited(u64),
}

impl From<u64> for Repetitions {
    /// Zero means unbounded
    fn from(count: u64) -> Self {
        match count {
            0 => Repetitions::Unbounded,
            n => Repetitions::Limited(n),
        }
    }
}

/// One scheduler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based repetition number
    pub repetition: u64,
    /// Time since the run was started
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running,
    Paused,
}

#[derive(Default)]
struct TimerState {
    armed: bool,
    paused: bool,
    interval: Duration,
    limit: Repetitions,
    count: u64,
    started: Option<Instant>,
    /// Start and length of the wait currently in progress
    period_started: Option<Instant>,
    period: Duration,
    remaining: Option<Duration>,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl TimerState {
    fn disarm(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn reset(&mut self) {
        self.disarm();
        self.armed = false;
        self.paused = false;
        self.count = 0;
        self.started = None;
        self.period_started = None;
        self.remaining = None;
    }
}

enum Fired {
    Tick(Tick),
    Complete,
    Stale,
}

struct Inner {
    runtime: Handle,
    state: Mutex<TimerState>,
    ticks: Observers<Tick>,
    completions: Observers<()>,
    disposed: AtomicBool,
}

/// Pausable repeating timer driving capture cycles
pub struct IntervalScheduler {
    inner: Arc<Inner>,
}

impl IntervalScheduler {
    /// Create a scheduler bound to the current Tokio runtime
    pub fn new() -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ScanError::Config(format!("scheduler needs a Tokio runtime: {}", e)))?;
        Ok(Self::with_runtime(runtime))
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                state: Mutex::new(TimerState::default()),
                ticks: Observers::new(),
                completions: Observers::new(),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Arm the timer
    ///
    /// The first tick follows `delay` (immediately when zero) and later ones
    /// every `interval`. A scheduler that is already armed is stopped first,
    /// which raises `complete`.
    pub fn start(
        &self,
        delay: Duration,
        interval: Duration,
        repetitions: Repetitions,
    ) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(ScanError::Config("scheduler has been disposed".to_string()));
        }
        if interval.is_zero() {
            return Err(ScanError::Config("interval must be greater than zero".to_string()));
        }

        if self.state() != SchedulerState::Stopped {
            self.stop();
        }

        let mut state = self.inner.lock();
        state.interval = interval;
        state.limit = repetitions;
        state.started = Some(Instant::now());
        state.armed = true;
        Inner::arm(&self.inner, &mut state, delay);
        debug!(
            "Scheduler started: delay {:?}, interval {:?}, {:?}",
            delay, interval, repetitions
        );
        Ok(())
    }

    /// Freeze the clock, remembering how long the current wait had left
    pub fn pause(&self) {
        let mut state = self.inner.lock();
        if !state.armed || state.paused {
            return;
        }

        state.disarm();
        let spent = state
            .period_started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let remaining = state.period.saturating_sub(spent);
        state.remaining = Some(remaining);
        state.paused = true;
        debug!("Scheduler paused with {:?} until the next tick", remaining);
    }

    /// Restart the clock after [`pause`](Self::pause)
    ///
    /// The remaining time captured by the pause is used once; without one
    /// the full interval is used.
    pub fn resume(&self) {
        let mut state = self.inner.lock();
        if !state.armed || !state.paused {
            return;
        }

        let wait = state.remaining.take().unwrap_or(state.interval);
        state.paused = false;
        Inner::arm(&self.inner, &mut state, wait);
        debug!("Scheduler resumed; next tick in {:?}", wait);
    }

    /// Disarm and reset; always raises `complete`
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Drop every listener and the timer; safe to call more than once
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.ticks.clear();
        self.inner.completions.clear();
        self.inner.lock().reset();
        debug!("Scheduler disposed");
    }

    pub fn state(&self) -> SchedulerState {
        let state = self.inner.lock();
        match (state.armed, state.paused) {
            (false, _) => SchedulerState::Stopped,
            (true, true) => SchedulerState::Paused,
            (true, false) => SchedulerState::Running,
        }
    }

    /// Ticks raised since the last start
    pub fn repetitions_done(&self) -> u64 {
        self.inner.lock().count
    }

    pub fn on_tick<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Tick) + Send + Sync + 'static,
    {
        self.inner.ticks.subscribe(listener)
    }

    pub fn on_complete<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&()) + Send + Sync + 'static,
    {
        self.inner.completions.subscribe(listener)
    }

    pub fn tick_channel(&self, capacity: usize) -> (SubscriptionId, async_channel::Receiver<Tick>) {
        self.inner.ticks.subscribe_channel(capacity)
    }

    pub fn complete_channel(&self, capacity: usize) -> (SubscriptionId, async_channel::Receiver<()>) {
        self.inner.completions.subscribe_channel(capacity)
    }

    pub fn unsubscribe_tick(&self, id: SubscriptionId) -> bool {
        self.inner.ticks.unsubscribe(id)
    }

    pub fn unsubscribe_complete(&self, id: SubscriptionId) -> bool {
        self.inner.completions.unsubscribe(id)
    }
}

impl Drop for IntervalScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn a timer task whose first deadline is `first` from now
    fn arm(this: &Arc<Self>, state: &mut TimerState, first: Duration) {
        state.disarm();
        let now = Instant::now();
        state.period_started = Some(now);
        state.period = first;

        let generation = state.generation;
        let interval = state.interval;
        let weak = Arc::downgrade(this);
        state.task = Some(
            this.runtime
                .spawn(run_timer(weak, generation, now + first, interval)),
        );
    }

    fn fire(&self, generation: u64, deadline: Instant) -> bool {
        let fired = {
            let mut state = self.lock();
            if state.generation != generation || !state.armed || state.paused {
                Fired::Stale
            } else {
                let within_limit = match state.limit {
                    Repetitions::Unbounded => true,
                    Repetitions::Limited(limit) => state.count < limit,
                };
                if within_limit {
                    state.count += 1;
                    state.period_started = Some(deadline);
                    state.period = state.interval;
                    Fired::Tick(Tick {
                        repetition: state.count,
                        elapsed: state
                            .started
                            .map(|started| deadline.saturating_duration_since(started))
                            .unwrap_or_default(),
                    })
                } else {
                    Fired::Complete
                }
            }
        };

        match fired {
            Fired::Tick(tick) => {
                trace!("Tick {} at {:?}", tick.repetition, tick.elapsed);
                self.ticks.notify(&tick);
                true
            }
            Fired::Complete => {
                self.stop();
                false
            }
            Fired::Stale => false,
        }
    }

    fn stop(&self) {
        self.lock().reset();
        debug!("Scheduler stopped");
        self.completions.notify(&());
    }
}

async fn run_timer(inner: Weak<Inner>, generation: u64, first: Instant, interval: Duration) {
    let mut deadline = first;
    loop {
        tokio::time::sleep_until(deadline).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.fire(generation, deadline) {
            return;
        }
        deadline += interval;
    }
}
