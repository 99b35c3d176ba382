//! Capture and refresh coordination
//!
//! Every hardware-touching operation funnels through one binary semaphore,
//! so a capture batch and a refresh never overlap, nor do two of either.
//! Refreshes run on a persistent worker thread; each capture batch gets a
//! fresh worker that is torn down (and its driver handles released) as soon
//! as the batch ends.
//!
//! The hardware section of each operation runs in a spawned task that owns
//! the semaphore permit. Dropping the caller's future therefore never frees
//! the lock while a blocking driver call is still in flight.

use crate::scanner::device::Device;
use crate::scanner::registry::{DeviceRegistry, RefreshSummary};
use crate::scanner::worker::DriverWorker;
use common::{Result, ScanError};
use driver::{CaptureConfig, DeviceId, ImageFormat, ScanDriver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REFRESH_WORKER_NAME: &str = "driver-refresh";

/// Capture parameters applied to every device in a batch
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureSettings {
    pub capture: CaptureConfig,
    /// Transfer format requested from the driver
    pub format: ImageFormat,
    /// Extra attempts after a communication fault
    pub retry_budget: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            format: ImageFormat::Bmp,
            retry_budget: 0,
        }
    }
}

/// One image produced by a capture batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub device_id: DeviceId,
    /// Zero-based page index within this device's capture
    pub index: usize,
    pub format: ImageFormat,
    pub data: Vec<u8>,
}

/// Serialises driver access for capture batches and registry refreshes
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    driver: Arc<dyn ScanDriver>,
    registry: Arc<DeviceRegistry>,
    settings: RwLock<CaptureSettings>,
    hardware: Arc<Semaphore>,
    refresh_worker: Mutex<Option<DriverWorker>>,
    batches: AtomicU64,
}

impl Coordinator {
    pub fn new(
        driver: Arc<dyn ScanDriver>,
        registry: Arc<DeviceRegistry>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                registry,
                settings: RwLock::new(settings),
                hardware: Arc::new(Semaphore::new(1)),
                refresh_worker: Mutex::new(None),
                batches: AtomicU64::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> CaptureSettings {
        self.inner.settings()
    }

    /// Replace the capture settings; takes effect from the next batch
    pub fn update_config(&self, settings: CaptureSettings) {
        info!(
            "Capture settings updated: {} dpi, {}, retry budget {}",
            settings.capture.resolution, settings.format, settings.retry_budget
        );
        *self
            .inner
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = settings;
    }

    /// Capture once from every connected, enabled, idle device
    ///
    /// Devices are visited in ascending identifier order. A driver fault on
    /// one device is logged and the batch moves on; that device is already
    /// marked disconnected. Cancellation is honoured before the lock is
    /// taken and between devices.
    pub async fn capture_batch(
        &self,
        use_highest_resolution: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CapturedImage>> {
        let permit = self.inner.acquire(cancel).await?;
        let inner = self.inner.clone();
        let cancel = cancel.clone();
        detach(async move {
            let result = inner.run_capture_batch(use_highest_resolution, &cancel).await;
            drop(permit);
            result
        })
        .await
    }

    /// Reconcile the registry against the driver's current listing
    pub async fn refresh(
        &self,
        enable_new_devices: bool,
        cancel: &CancellationToken,
    ) -> Result<RefreshSummary> {
        let permit = self.inner.acquire(cancel).await?;
        let inner = self.inner.clone();
        detach(async move {
            let result = inner.run_refresh(enable_new_devices).await;
            drop(permit);
            result
        })
        .await
    }

    /// Wait until no capture or refresh is in flight
    pub async fn await_idle(&self, cancel: &CancellationToken) -> Result<()> {
        let permit = self.inner.acquire(cancel).await?;
        drop(permit);
        Ok(())
    }

    /// Stop the persistent refresh worker once the hardware is idle
    pub async fn shutdown(&self) -> Result<()> {
        let permit = self.inner.acquire(&CancellationToken::new()).await?;
        let worker = self.inner.refresh_worker.lock().await.take();
        let result = match worker {
            Some(worker) => worker.shutdown().await,
            None => Ok(()),
        };
        drop(permit);
        info!("Coordinator shut down");
        result
    }
}

impl Inner {
    fn settings(&self) -> CaptureSettings {
        *self
            .settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ScanError::Cancelled),
            permit = self.hardware.clone().acquire_owned() => {
                permit.map_err(|e| ScanError::Channel(e.to_string()))
            }
        }
    }

    async fn run_capture_batch(
        &self,
        use_highest_resolution: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CapturedImage>> {
        let batch = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        let settings = self.settings();

        let mut devices = self.registry.snapshot();
        devices.sort_by(|a, b| a.id().cmp(b.id()));

        let worker =
            DriverWorker::start(format!("driver-capture-{}", batch), self.driver.clone()).await?;
        debug!(
            "Batch {} started on {} with {} registered device(s)",
            batch,
            worker.context(),
            devices.len()
        );

        let result = self
            .capture_devices(&worker, &devices, settings, use_highest_resolution, cancel)
            .await;

        // The batch's context is gone before any outcome reaches the caller
        if let Err(e) = worker.shutdown().await {
            error!("Tearing down batch {} worker failed: {}", batch, e);
        }

        match &result {
            Ok(images) => info!("Batch {} captured {} image(s)", batch, images.len()),
            Err(e) => warn!("Batch {} ended early: {}", batch, e),
        }
        result
    }

    async fn capture_devices(
        &self,
        worker: &DriverWorker,
        devices: &[Arc<Device>],
        settings: CaptureSettings,
        use_highest_resolution: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<CapturedImage>> {
        let mut captured = Vec::new();

        for device in devices {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            if !device.is_connected() || !device.is_enabled() || device.is_imaging() {
                debug!(
                    "Skipping {} (connected={}, enabled={}, imaging={})",
                    device.id(),
                    device.is_connected(),
                    device.is_enabled(),
                    device.is_imaging()
                );
                continue;
            }

            let config = if use_highest_resolution {
                settings
                    .capture
                    .with_resolution(device.descriptor().highest_resolution())
            } else {
                settings.capture
            };
            device.set_config(Some(config));
            device.set_retry_budget(settings.retry_budget);

            let job_device = device.clone();
            let driver = self.driver.clone();
            let format = settings.format;
            let outcome = worker
                .run(move || job_device.capture(driver.as_ref(), format))
                .await?;

            match outcome {
                Ok(_) => {
                    captured.extend(device.images().into_iter().enumerate().map(
                        |(index, image)| CapturedImage {
                            device_id: device.id().clone(),
                            index,
                            format: image.format,
                            data: image.data,
                        },
                    ));
                }
                Err(e @ ScanError::Driver(_)) => {
                    warn!("Device {} dropped out of the batch: {}", device.id(), e);
                }
                Err(e @ (ScanError::UnsupportedFormat { .. } | ScanError::NotConnected { .. })) => {
                    warn!("Skipping {}: {}", device.id(), e);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(captured)
    }

    async fn run_refresh(&self, enable_new_devices: bool) -> Result<RefreshSummary> {
        let mut slot = self.refresh_worker.lock().await;
        if slot.as_ref().is_none_or(DriverWorker::is_closed) {
            if let Some(stale) = slot.take() {
                warn!("Refresh worker {} stopped; starting a new one", stale.name());
                if let Err(e) = stale.shutdown().await {
                    debug!("Stale refresh worker: {}", e);
                }
            }
            *slot = Some(DriverWorker::start(REFRESH_WORKER_NAME, self.driver.clone()).await?);
        }
        let Some(worker) = slot.as_ref() else {
            return Err(ScanError::Channel("refresh worker unavailable".to_string()));
        };

        let registry = self.registry.clone();
        let driver = self.driver.clone();
        let config = self.settings().capture;
        let summary = worker
            .run(move || registry.refresh(driver.as_ref(), &config, enable_new_devices))
            .await??;

        if !summary.is_unchanged() {
            info!(
                "Refresh: {} added, {} reconnected, {} disconnected",
                summary.added.len(),
                summary.reconnected.len(),
                summary.disconnected.len()
            );
        }
        Ok(summary)
    }
}

/// Run a hardware section to completion even if the caller goes away
async fn detach<T, F>(section: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    match tokio::spawn(section).await {
        Ok(result) => result,
        Err(e) if e.is_cancelled() => Err(ScanError::Cancelled),
        Err(e) => Err(ScanError::WorkerPanicked(e.to_string())),
    }
}
