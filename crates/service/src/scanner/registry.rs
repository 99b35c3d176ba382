//! Device registry
//!
//! Keeps the set of every device ever observed and reconciles it against
//! the driver's lightweight listing. Devices are never dropped because they
//! vanished from a listing; they are marked disconnected instead, so the
//! operator's enabled/disabled choice survives a power cycle.
//!
//! Driver calls made here must run on a thread carrying the driver's
//! context identity. The coordinator guarantees that and serialises
//! refreshes with captures; the internal lock only protects readers that
//! iterate the registry while a refresh restructures it.

use crate::scanner::device::{Device, DeviceEvent};
use common::{Observers, Result, ScanError, SubscriptionId};
use driver::{CaptureConfig, DeviceDescriptor, DeviceId, DeviceListing, ScanDriver};
use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Registry-level notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// A device joined the registry
    Added(DeviceId),
    /// A device left the registry (only ever as part of a replacement)
    Removed(DeviceId),
    /// A member device changed one of its properties
    Property(DeviceEvent),
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    /// Identifiers seen for the first time
    pub added: Vec<DeviceId>,
    /// Disconnected devices rebuilt after reappearing
    pub reconnected: Vec<DeviceId>,
    /// Devices newly marked disconnected
    pub disconnected: Vec<DeviceId>,
}

impl RefreshSummary {
    pub fn is_unchanged(&self) -> bool {
        self.added.is_empty() && self.reconnected.is_empty() && self.disconnected.is_empty()
    }
}

struct Entry {
    device: Arc<Device>,
    forward: SubscriptionId,
}

/// Persistent, order-stable collection of devices keyed by identifier
pub struct DeviceRegistry {
    entries: RwLock<Vec<Entry>>,
    observers: Arc<Observers<RegistryEvent>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            observers: Arc::new(Observers::new()),
        }
    }

    /// Full enumeration with capability data
    pub fn enumerate_candidate_devices(
        &self,
        driver: &dyn ScanDriver,
        config: &CaptureConfig,
    ) -> Result<Vec<DeviceDescriptor>> {
        Ok(driver.enumerate_devices(config)?)
    }

    /// Cheap listing of identifiers and raw properties
    pub fn list_lightweight_identifiers(&self, driver: &dyn ScanDriver) -> Result<Vec<DeviceListing>> {
        Ok(driver.list_devices()?)
    }

    /// Append a device; fails if its identifier is already registered
    pub fn add(&self, device: Arc<Device>) -> Result<()> {
        let id = device.id().clone();
        {
            let mut entries = self.write();
            if entries.iter().any(|e| e.device.id() == &id) {
                return Err(ScanError::DuplicateDevice { device_id: id });
            }
            let forward = self.forward_events(&device);
            entries.push(Entry { device, forward });
        }

        debug!("Registered device {}", id);
        self.observers.notify(&RegistryEvent::Added(id));
        Ok(())
    }

    pub fn get(&self, id: &DeviceId) -> Option<Arc<Device>> {
        self.read()
            .iter()
            .find(|e| e.device.id() == id)
            .map(|e| e.device.clone())
    }

    /// Devices in registration order
    pub fn snapshot(&self) -> Vec<Arc<Device>> {
        self.read().iter().map(|e| e.device.clone()).collect()
    }

    pub fn ids(&self) -> Vec<DeviceId> {
        self.read().iter().map(|e| e.device.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn enable_all(&self) {
        for device in self.snapshot() {
            device.set_enabled(true);
        }
    }

    pub fn disable_all(&self) {
        for device in self.snapshot() {
            device.set_enabled(false);
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&RegistryEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn subscribe_channel(
        &self,
        capacity: usize,
    ) -> (SubscriptionId, async_channel::Receiver<RegistryEvent>) {
        self.observers.subscribe_channel(capacity)
    }

    /// Reconcile the registry against a fresh driver listing
    ///
    /// - An empty listing marks every device disconnected and removes none.
    /// - Unknown identifiers are connected, registered with `config` as their
    ///   device configuration, and enabled when `enable_new_devices` is set.
    /// - Known but disconnected identifiers are reconnected and replace the
    ///   old entry in place, keeping its enabled flag, retry budget and
    ///   configuration.
    /// - Known connected identifiers are left alone.
    /// - Registered identifiers missing from the listing are marked
    ///   disconnected.
    ///
    /// Identifiers are matched by exact string equality. Any driver fault
    /// propagates; a failed reconnection leaves the old entry in place.
    pub fn refresh(
        &self,
        driver: &dyn ScanDriver,
        config: &CaptureConfig,
        enable_new_devices: bool,
    ) -> Result<RefreshSummary> {
        let listings = self.list_lightweight_identifiers(driver)?;
        let mut summary = RefreshSummary::default();

        if listings.is_empty() {
            for device in self.snapshot() {
                if device.is_connected() {
                    device.set_connected(false);
                    summary.disconnected.push(device.id().clone());
                }
            }
            info!(
                "Driver reported no devices; {} marked disconnected",
                summary.disconnected.len()
            );
            return Ok(summary);
        }

        debug!(
            "Refreshing {} registered device(s) against {} listing(s)",
            self.len(),
            listings.len()
        );

        for listing in &listings {
            match self.get(&listing.id) {
                None => {
                    let device = Arc::new(Device::new(driver.connect(&listing.id)?));
                    device.set_config(Some(*config));
                    self.add(device.clone())?;
                    device.set_enabled(enable_new_devices);
                    info!("New device {} (enabled={})", listing.id, enable_new_devices);
                    summary.added.push(listing.id.clone());
                }
                Some(existing) if !existing.is_connected() => {
                    let device = Arc::new(Device::new(driver.connect(&listing.id)?));
                    device.set_enabled(existing.is_enabled());
                    device.set_retry_budget(existing.retry_budget());
                    device.set_config(existing.config().or(Some(*config)));
                    self.replace(device);
                    info!("Device {} reconnected", listing.id);
                    summary.reconnected.push(listing.id.clone());
                }
                Some(_) => {}
            }
        }

        let present: HashSet<&DeviceId> = listings.iter().map(|l| &l.id).collect();
        for device in self.snapshot() {
            if !present.contains(device.id()) && device.is_connected() {
                device.set_connected(false);
                summary.disconnected.push(device.id().clone());
            }
        }

        Ok(summary)
    }

    /// Swap the entry with the same identifier for `device`
    fn replace(&self, device: Arc<Device>) {
        let id = device.id().clone();
        let replaced = {
            let mut entries = self.write();
            match entries.iter().position(|e| e.device.id() == &id) {
                Some(index) => {
                    let forward = self.forward_events(&device);
                    let old = std::mem::replace(&mut entries[index], Entry { device, forward });
                    old.device.unsubscribe(old.forward);
                    true
                }
                None => {
                    let forward = self.forward_events(&device);
                    entries.push(Entry { device, forward });
                    false
                }
            }
        };

        if replaced {
            self.observers.notify(&RegistryEvent::Removed(id.clone()));
        }
        self.observers.notify(&RegistryEvent::Added(id));
    }

    fn forward_events(&self, device: &Device) -> SubscriptionId {
        let observers = self.observers.clone();
        device.subscribe(move |event| observers.notify(&RegistryEvent::Property(event.clone())))
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Entry>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Entry>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
