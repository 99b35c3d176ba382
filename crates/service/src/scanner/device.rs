//! Imaging device abstraction
//!
//! A [`Device`] wraps the capability descriptor read from the driver with
//! the live status the rest of the service observes: whether the device is
//! reachable, whether the operator enabled it, and whether a capture is in
//! flight. Status flags are atomics so observers can read them while a
//! capture blocks on a worker thread.

use common::{Observers, Result, ScanError, SubscriptionId};
use driver::{CaptureConfig, DeviceDescriptor, DeviceId, ImageFormat, ScanDriver};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Observable device property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceProperty {
    Connected,
    Enabled,
    Imaging,
}

/// Property-change notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device_id: DeviceId,
    pub property: DeviceProperty,
    pub value: bool,
}

/// One captured page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    /// Encoding of `data`; PNG once normalised
    pub format: ImageFormat,
    pub data: Vec<u8>,
}

/// A physical imaging device and its live status
pub struct Device {
    descriptor: DeviceDescriptor,
    short_id: u32,
    connected: AtomicBool,
    enabled: AtomicBool,
    imaging: AtomicBool,
    retry_budget: AtomicU32,
    config: Mutex<Option<CaptureConfig>>,
    images: Mutex<Vec<ImageBuffer>>,
    observers: Observers<DeviceEvent>,
}

impl Device {
    /// Create a device from a freshly read descriptor
    ///
    /// New devices start connected, disabled and idle.
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        let short_id = derive_short_id(descriptor.id.as_str());

        Self {
            descriptor,
            short_id,
            connected: AtomicBool::new(true),
            enabled: AtomicBool::new(false),
            imaging: AtomicBool::new(false),
            retry_budget: AtomicU32::new(0),
            config: Mutex::new(None),
            images: Mutex::new(Vec::new()),
            observers: Observers::new(),
        }
    }

    pub fn id(&self) -> &DeviceId {
        &self.descriptor.id
    }

    /// Non-unique numeric identifier for display
    pub fn short_id(&self) -> u32 {
        self.short_id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_imaging(&self) -> bool {
        self.imaging.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        if self.connected.swap(connected, Ordering::SeqCst) != connected {
            if connected {
                info!("Device {} connected", self.id());
            } else {
                info!("Device {} disconnected", self.id());
            }
            self.emit(DeviceProperty::Connected, connected);
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) != enabled {
            debug!("Device {} enabled={}", self.id(), enabled);
            self.emit(DeviceProperty::Enabled, enabled);
        }
    }

    fn set_imaging(&self, imaging: bool) {
        if self.imaging.swap(imaging, Ordering::SeqCst) != imaging {
            self.emit(DeviceProperty::Imaging, imaging);
        }
    }

    /// Extra attempts granted to a capture that hits a communication error
    pub fn retry_budget(&self) -> u32 {
        self.retry_budget.load(Ordering::SeqCst)
    }

    pub fn set_retry_budget(&self, budget: u32) {
        self.retry_budget.store(budget, Ordering::SeqCst);
    }

    /// Device-level capture configuration, if one was applied
    pub fn config(&self) -> Option<CaptureConfig> {
        *lock(&self.config)
    }

    pub fn set_config(&self, config: Option<CaptureConfig>) {
        *lock(&self.config) = config;
    }

    /// Configuration actually sent to the driver
    ///
    /// Without a device-level configuration the highest supported resolution
    /// is used. A configured resolution the device does not support is
    /// replaced by the closest supported one.
    pub fn effective_config(&self) -> CaptureConfig {
        match self.config() {
            Some(config) => {
                let resolution = self.descriptor.closest_resolution(config.resolution);
                config.with_resolution(resolution).clamped()
            }
            None => CaptureConfig::default().with_resolution(self.descriptor.highest_resolution()),
        }
    }

    /// Images from the last successful capture
    pub fn images(&self) -> Vec<ImageBuffer> {
        lock(&self.images).clone()
    }

    pub fn clear_images(&self) {
        lock(&self.images).clear();
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Capture from this device
    ///
    /// Must be called from a thread carrying the driver's context identity.
    /// Returns the number of pages captured. A driver fault marks the device
    /// disconnected before it is returned; `imaging` is always false again
    /// when this returns.
    pub fn capture(&self, driver: &dyn ScanDriver, format: ImageFormat) -> Result<usize> {
        if !self.is_connected() {
            return Err(ScanError::NotConnected {
                device_id: self.id().clone(),
            });
        }
        if !self.descriptor.supports_format(format) {
            return Err(ScanError::UnsupportedFormat {
                device_id: self.id().clone(),
                format,
            });
        }

        let _imaging = ImagingGuard::start(self);
        self.acquire(driver, format)
    }

    fn acquire(&self, driver: &dyn ScanDriver, format: ImageFormat) -> Result<usize> {
        self.clear_images();
        let config = self.effective_config();
        let mut retries_left = self.retry_budget();

        debug!(
            "Capturing from {} at {} dpi as {}",
            self.id(),
            config.resolution,
            format
        );

        let pages = loop {
            match driver.capture(self.id(), &config, format) {
                Ok(pages) => break pages,
                Err(fault) if fault.is_transient() && retries_left > 0 => {
                    retries_left -= 1;
                    warn!(
                        "Capture from {} failed ({}), retrying ({} left)",
                        self.id(),
                        fault,
                        retries_left
                    );
                }
                Err(fault) => {
                    warn!("Capture from {} failed: {}", self.id(), fault);
                    self.set_connected(false);
                    return Err(fault.into());
                }
            }
        };

        let normalised: Vec<ImageBuffer> = pages
            .into_iter()
            .map(|data| normalise(data, format))
            .collect();
        let count = normalised.len();
        *lock(&self.images) = normalised;

        debug!("Captured {} page(s) from {}", count, self.id());
        Ok(count)
    }

    fn emit(&self, property: DeviceProperty, value: bool) {
        self.observers.notify(&DeviceEvent {
            device_id: self.id().clone(),
            property,
            value,
        });
    }
}

/// Holds `imaging` true for its lifetime, including while unwinding
struct ImagingGuard<'a> {
    device: &'a Device,
}

impl<'a> ImagingGuard<'a> {
    fn start(device: &'a Device) -> Self {
        device.set_imaging(true);
        Self { device }
    }
}

impl Drop for ImagingGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Capture from {} unwound", self.device.id());
        }
        self.device.set_imaging(false);
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Device {}

impl Hash for Device {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", self.id())
            .field("connected", &self.is_connected())
            .field("enabled", &self.is_enabled())
            .field("imaging", &self.is_imaging())
            .finish()
    }
}

/// Re-encode a page as PNG, keeping the original bytes if that fails
fn normalise(data: Vec<u8>, format: ImageFormat) -> ImageBuffer {
    if format == ImageFormat::Png {
        return ImageBuffer { format, data };
    }

    let decoded = match image::load_from_memory(&data) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!("Keeping {} page as captured: {}", format, e);
            return ImageBuffer { format, data };
        }
    };

    let mut png = Cursor::new(Vec::new());
    match decoded.write_to(&mut png, image::ImageFormat::Png) {
        Ok(()) => ImageBuffer {
            format: ImageFormat::Png,
            data: png.into_inner(),
        },
        Err(e) => {
            debug!("Keeping {} page as captured: {}", format, e);
            ImageBuffer { format, data }
        }
    }
}

/// Numeric display id from the identifier's last four characters
fn derive_short_id(id: &str) -> u32 {
    let tail: String = {
        let chars: Vec<char> = id.chars().collect();
        chars[chars.len().saturating_sub(4)..].iter().collect()
    };

    if !tail.is_empty() && tail.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(n) = tail.parse() {
            return n;
        }
    }

    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    (hasher.finish() % 10_000) as u32
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
