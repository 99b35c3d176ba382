//! Orchestrating service
//!
//! Wires the scheduler's ticks to capture-and-save cycles and keeps the
//! device registry fresh with a periodic refresh loop. Failures of a single
//! cycle or refresh are logged and counted; they never stop the service.

use crate::config::ServiceConfig;
use crate::scanner::{Coordinator, DeviceRegistry};
use crate::scheduler::{IntervalScheduler, Repetitions, SchedulerState, Tick};
use crate::storage::ImageStore;
use chrono::Local;
use common::Result;
use driver::ScanDriver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Counters reported by [`AutoScanService::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceStats {
    /// Capture cycles started
    pub cycles: u64,
    pub images_saved: u64,
    /// Failed batches, refreshes and saves
    pub failures: u64,
    pub refreshes: u64,
}

#[derive(Default)]
struct Counters {
    cycles: AtomicU64,
    images_saved: AtomicU64,
    failures: AtomicU64,
    refreshes: AtomicU64,
}

struct Shared {
    coordinator: Arc<Coordinator>,
    store: Arc<ImageStore>,
    counters: Counters,
    use_highest_resolution: bool,
    enable_new_devices: bool,
    cancel: CancellationToken,
}

struct Schedule {
    delay: Duration,
    interval: Duration,
    repetitions: Repetitions,
    refresh_interval: Duration,
}

/// Periodic capture service
pub struct AutoScanService {
    shared: Arc<Shared>,
    scheduler: IntervalScheduler,
    schedule: Schedule,
    done: watch::Receiver<bool>,
    done_tx: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AutoScanService {
    /// Build a service around `driver`; must be called inside a runtime
    pub fn new(driver: Arc<dyn ScanDriver>, config: &ServiceConfig) -> Result<Self> {
        let coordinator = Coordinator::new(
            driver,
            Arc::new(DeviceRegistry::new()),
            config.capture.settings(),
        );
        let store = ImageStore::new(config.output.directory(), config.output.format);
        let (done_tx, done) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(Shared {
                coordinator: Arc::new(coordinator),
                store: Arc::new(store),
                counters: Counters::default(),
                use_highest_resolution: config.capture.use_highest_resolution,
                enable_new_devices: config.devices.enable_new_devices,
                cancel: CancellationToken::new(),
            }),
            scheduler: IntervalScheduler::new()?,
            schedule: Schedule {
                delay: config.capture.delay,
                interval: config.capture.interval,
                repetitions: config.capture.repetitions(),
                refresh_interval: config.devices.refresh_interval,
            },
            done,
            done_tx: Arc::new(done_tx),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.shared.coordinator
    }

    pub fn scheduler(&self) -> &IntervalScheduler {
        &self.scheduler
    }

    /// Refresh once, then start the refresh loop and the capture schedule
    pub async fn start(&self) -> Result<()> {
        info!(
            "Starting capture service: every {:?} after {:?}, {:?}",
            self.schedule.interval, self.schedule.delay, self.schedule.repetitions
        );
        run_refresh(&self.shared).await;

        let refresh = tokio::spawn(refresh_loop(
            self.shared.clone(),
            self.schedule.refresh_interval,
        ));

        // One pending tick at most; ticks arriving mid-cycle are skipped
        let (tick_tx, tick_rx) = async_channel::bounded::<Tick>(1);
        let sender = tick_tx.clone();
        self.scheduler.on_tick(move |tick| {
            if sender.try_send(*tick).is_err() {
                debug!("Cycle still running, skipping tick {}", tick.repetition);
            }
        });
        let done_tx = self.done_tx.clone();
        self.scheduler.on_complete(move |_| {
            tick_tx.close();
            done_tx.send_replace(true);
        });

        let capture = tokio::spawn(capture_loop(self.shared.clone(), tick_rx));
        self.lock_tasks().extend([refresh, capture]);

        self.scheduler.start(
            self.schedule.delay,
            self.schedule.interval,
            self.schedule.repetitions,
        )
    }

    pub fn pause(&self) {
        self.scheduler.pause();
        info!("Capture schedule paused");
    }

    pub fn resume(&self) {
        self.scheduler.resume();
        info!("Capture schedule resumed");
    }

    pub fn state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    /// Wait until the schedule has run out and the last cycle has finished
    pub async fn wait_complete(&self) {
        let mut done = self.done.clone();
        if done.wait_for(|finished| *finished).await.is_err() {
            return;
        }
        let capture = self.lock_tasks().pop();
        if let Some(capture) = capture
            && let Err(e) = capture.await
        {
            error!("Capture loop failed: {}", e);
        }
    }

    /// Stop the schedule and the refresh loop, then release the hardware
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping capture service");
        self.shared.cancel.cancel();
        self.scheduler.stop();

        let tasks: Vec<_> = self.lock_tasks().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Service task failed: {}", e);
            }
        }

        self.shared
            .coordinator
            .await_idle(&CancellationToken::new())
            .await?;
        self.shared.coordinator.shutdown().await
    }

    pub fn stats(&self) -> ServiceStats {
        let c = &self.shared.counters;
        ServiceStats {
            cycles: c.cycles.load(Ordering::SeqCst),
            images_saved: c.images_saved.load(Ordering::SeqCst),
            failures: c.failures.load(Ordering::SeqCst),
            refreshes: c.refreshes.load(Ordering::SeqCst),
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn refresh_loop(shared: Arc<Shared>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately and start() already refreshed
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => run_refresh(&shared).await,
        }
    }
    debug!("Refresh loop stopped");
}

async fn run_refresh(shared: &Shared) {
    match shared
        .coordinator
        .refresh(shared.enable_new_devices, &shared.cancel)
        .await
    {
        Ok(summary) => {
            shared.counters.refreshes.fetch_add(1, Ordering::SeqCst);
            debug!("Registry holds {} device(s)", shared.coordinator.registry().len());
            if !summary.disconnected.is_empty() {
                warn!("Devices disconnected: {:?}", summary.disconnected);
            }
        }
        Err(e) if e.is_cancelled() => debug!("Refresh cancelled"),
        Err(e) => {
            shared.counters.failures.fetch_add(1, Ordering::SeqCst);
            warn!("Device refresh failed: {}", e);
        }
    }
}

async fn capture_loop(shared: Arc<Shared>, ticks: async_channel::Receiver<Tick>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            tick = ticks.recv() => match tick {
                Ok(tick) => run_cycle(&shared, tick).await,
                Err(_) => break,
            },
        }
    }
    debug!("Capture loop stopped");
}

async fn run_cycle(shared: &Shared, tick: Tick) {
    shared.counters.cycles.fetch_add(1, Ordering::SeqCst);
    info!("Capture cycle {} ({:?} in)", tick.repetition, tick.elapsed);

    let images = match shared
        .coordinator
        .capture_batch(shared.use_highest_resolution, &shared.cancel)
        .await
    {
        Ok(images) => images,
        Err(e) if e.is_cancelled() => {
            debug!("Capture cycle {} cancelled", tick.repetition);
            return;
        }
        Err(e) => {
            shared.counters.failures.fetch_add(1, Ordering::SeqCst);
            error!("Capture cycle {} failed: {}", tick.repetition, e);
            return;
        }
    };

    let timestamp = Local::now().naive_local();
    for image in images {
        let store = shared.store.clone();
        let device_id = image.device_id.clone();
        match tokio::task::spawn_blocking(move || store.save(&image, timestamp)).await {
            Ok(Ok(path)) => {
                shared.counters.images_saved.fetch_add(1, Ordering::SeqCst);
                debug!("Saved {} image to {}", device_id, path.display());
            }
            Ok(Err(e)) => {
                shared.counters.failures.fetch_add(1, Ordering::SeqCst);
                warn!("Saving image from {} failed: {}", device_id, e);
            }
            Err(e) => {
                shared.counters.failures.fetch_add(1, Ordering::SeqCst);
                error!("Save task for {} failed: {}", device_id, e);
            }
        }
    }
}
