//! Simulated driver backend
//!
//! An in-process stand-in for the native imaging layer. It behaves like the
//! real thing where the capture core cares: calls block, calls from outside
//! an initialised context are rejected, and faults can be scripted per
//! operation and per device. Every call is recorded with its entry and exit
//! instants so tests can prove that hardware access was serialised.

use crate::context::{self, ContextId};
use crate::error::{DriverFault, DriverResult};
use crate::scan::ScanDriver;
use crate::types::{
    CaptureConfig, DeviceDescriptor, DeviceId, DeviceListing, ImageFormat, Properties,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Driver operation, used to script faults and label call records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Enumerate,
    List,
    Connect,
    Capture,
}

/// One recorded driver call
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub operation: Operation,
    pub device: Option<DeviceId>,
    pub context: ContextId,
    pub started: Instant,
    pub finished: Instant,
}

impl CallRecord {
    /// Whether two calls were executing at the same time
    pub fn overlaps(&self, other: &CallRecord) -> bool {
        self.started < other.finished && other.started < self.finished
    }
}

/// A scripted device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulatedDevice {
    pub id: DeviceId,
    #[serde(default = "SimulatedDevice::default_name")]
    pub name: String,
    #[serde(default = "SimulatedDevice::default_resolutions")]
    pub resolutions: Vec<u32>,
    #[serde(default = "SimulatedDevice::default_formats")]
    pub formats: Vec<ImageFormat>,
    #[serde(default)]
    pub has_duplex: bool,
    #[serde(default = "SimulatedDevice::default_flatbed")]
    pub has_flatbed: bool,
    #[serde(default)]
    pub has_feeder: bool,
    /// Pages returned per capture
    #[serde(default = "SimulatedDevice::default_pages")]
    pub pages: usize,
    /// Raw bytes returned for every page; generated BMP data when absent
    #[serde(skip)]
    pub page_data: Option<Vec<u8>>,
}

impl SimulatedDevice {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: Self::default_name(),
            resolutions: Self::default_resolutions(),
            formats: Self::default_formats(),
            has_duplex: false,
            has_flatbed: Self::default_flatbed(),
            has_feeder: false,
            pages: Self::default_pages(),
            page_data: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_resolutions(mut self, resolutions: Vec<u32>) -> Self {
        self.resolutions = resolutions;
        self
    }

    pub fn with_formats(mut self, formats: Vec<ImageFormat>) -> Self {
        self.formats = formats;
        self
    }

    pub fn with_pages(mut self, pages: usize) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_page_data(mut self, data: Vec<u8>) -> Self {
        self.page_data = Some(data);
        self
    }

    fn default_name() -> String {
        "Simulated Scanner".to_string()
    }

    fn default_resolutions() -> Vec<u32> {
        vec![75, 150, 300, 600]
    }

    fn default_formats() -> Vec<ImageFormat> {
        vec![ImageFormat::Bmp, ImageFormat::Png]
    }

    fn default_flatbed() -> bool {
        true
    }

    fn default_pages() -> usize {
        1
    }

    fn descriptor(&self) -> DeviceDescriptor {
        let mut properties = Properties::new();
        properties.insert("Name".to_string(), self.name.clone());
        properties.insert("Type".to_string(), "Scanner".to_string());

        DeviceDescriptor {
            id: self.id.clone(),
            name: self.name.clone(),
            resolutions: self.resolutions.clone(),
            formats: self.formats.clone(),
            has_duplex: self.has_duplex,
            has_flatbed: self.has_flatbed,
            has_feeder: self.has_feeder,
            properties,
        }
    }

    fn listing(&self) -> DeviceListing {
        let mut listing = DeviceListing::new(self.id.clone());
        listing
            .properties
            .insert("Name".to_string(), self.name.clone());
        listing
    }
}

type FaultKey = (Operation, Option<DeviceId>);

/// Simulated imaging driver
pub struct SimulatedDriver {
    devices: Mutex<Vec<SimulatedDevice>>,
    one_shot_faults: Mutex<HashMap<FaultKey, VecDeque<DriverFault>>>,
    persistent_faults: Mutex<HashMap<FaultKey, DriverFault>>,
    panics: Mutex<HashMap<FaultKey, usize>>,
    latency: Mutex<HashMap<Operation, Duration>>,
    calls: Mutex<Vec<CallRecord>>,
    contexts: Mutex<HashSet<ContextId>>,
    contexts_entered: AtomicUsize,
    contexts_left: AtomicUsize,
    handle_releases: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    captures: AtomicUsize,
}

impl SimulatedDriver {
    pub fn new(devices: Vec<SimulatedDevice>) -> Self {
        Self {
            devices: Mutex::new(devices),
            one_shot_faults: Mutex::new(HashMap::new()),
            persistent_faults: Mutex::new(HashMap::new()),
            panics: Mutex::new(HashMap::new()),
            latency: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            contexts: Mutex::new(HashSet::new()),
            contexts_entered: AtomicUsize::new(0),
            contexts_left: AtomicUsize::new(0),
            handle_releases: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            captures: AtomicUsize::new(0),
        }
    }

    /// Make a device reachable (or replace its script)
    pub fn plug(&self, device: SimulatedDevice) {
        let mut devices = lock(&self.devices);
        devices.retain(|d| d.id != device.id);
        debug!("Simulated device plugged: {}", device.id);
        devices.push(device);
    }

    /// Make a device unreachable
    pub fn unplug(&self, id: &DeviceId) -> bool {
        let mut devices = lock(&self.devices);
        let before = devices.len();
        devices.retain(|d| &d.id != id);
        debug!("Simulated device unplugged: {}", id);
        devices.len() != before
    }

    /// Make every device unreachable
    pub fn unplug_all(&self) {
        lock(&self.devices).clear();
    }

    /// Fail the next matching call once
    ///
    /// `device` of `None` matches calls that do not target a device
    /// (enumeration and listing).
    pub fn fail_next(&self, operation: Operation, device: Option<DeviceId>, fault: DriverFault) {
        lock(&self.one_shot_faults)
            .entry((operation, device))
            .or_default()
            .push_back(fault);
    }

    /// Fail every matching call until [`clear_faults`](Self::clear_faults)
    pub fn fail_always(&self, operation: Operation, device: Option<DeviceId>, fault: DriverFault) {
        lock(&self.persistent_faults).insert((operation, device), fault);
    }

    /// Unwind out of the next matching call instead of returning
    pub fn panic_next(&self, operation: Operation, device: Option<DeviceId>) {
        *lock(&self.panics).entry((operation, device)).or_default() += 1;
    }

    pub fn clear_faults(&self) {
        lock(&self.one_shot_faults).clear();
        lock(&self.persistent_faults).clear();
        lock(&self.panics).clear();
    }

    /// Block every call of `operation` for `latency`
    pub fn set_latency(&self, operation: Operation, latency: Duration) {
        lock(&self.latency).insert(operation, latency);
    }

    pub fn calls(&self) -> Vec<CallRecord> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, operation: Operation) -> Vec<CallRecord> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Highest number of driver calls ever executing at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn contexts_entered(&self) -> usize {
        self.contexts_entered.load(Ordering::SeqCst)
    }

    pub fn contexts_left(&self) -> usize {
        self.contexts_left.load(Ordering::SeqCst)
    }

    pub fn handle_releases(&self) -> usize {
        self.handle_releases.load(Ordering::SeqCst)
    }

    /// Run one driver call with affinity checks, fault injection and
    /// instrumentation
    fn call<T>(
        &self,
        operation: Operation,
        device: Option<&DeviceId>,
        body: impl FnOnce() -> DriverResult<T>,
    ) -> DriverResult<T> {
        let context = context::current().ok_or_else(|| {
            DriverFault::InvalidState("driver called outside a dedicated context".to_string())
        })?;
        if !lock(&self.contexts).contains(&context) {
            return Err(DriverFault::InvalidState(format!(
                "context {} was not initialised for driver access",
                context
            )));
        }

        if self.take_panic(operation, device) {
            panic!("simulated driver crash in {:?} on {:?}", operation, device);
        }

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let started = Instant::now();

        let latency = lock(&self.latency).get(&operation).copied();
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }

        let result = match self.scripted_fault(operation, device) {
            Some(fault) => Err(fault),
            None => body(),
        };

        let finished = Instant::now();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        lock(&self.calls).push(CallRecord {
            operation,
            device: device.cloned(),
            context,
            started,
            finished,
        });
        trace!("{:?} on {:?} in {}: ok={}", operation, device, context, result.is_ok());
        result
    }

    fn scripted_fault(&self, operation: Operation, device: Option<&DeviceId>) -> Option<DriverFault> {
        let key = (operation, device.cloned());
        if let Some(fault) = lock(&self.one_shot_faults)
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
        {
            return Some(fault);
        }
        lock(&self.persistent_faults).get(&key).cloned()
    }

    fn take_panic(&self, operation: Operation, device: Option<&DeviceId>) -> bool {
        let mut panics = lock(&self.panics);
        match panics.get_mut(&(operation, device.cloned())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn find(&self, id: &DeviceId) -> DriverResult<SimulatedDevice> {
        lock(&self.devices)
            .iter()
            .find(|d| &d.id == id)
            .cloned()
            .ok_or_else(|| DriverFault::CommunicationError(format!("device {} not reachable", id)))
    }
}

impl ScanDriver for SimulatedDriver {
    fn enter_context(&self, context: ContextId) -> DriverResult<()> {
        lock(&self.contexts).insert(context);
        self.contexts_entered.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated driver entered {}", context);
        Ok(())
    }

    fn leave_context(&self, context: ContextId) {
        lock(&self.contexts).remove(&context);
        self.contexts_left.fetch_add(1, Ordering::SeqCst);
        debug!("Simulated driver left {}", context);
    }

    fn release_handles(&self, context: ContextId) {
        self.handle_releases.fetch_add(1, Ordering::SeqCst);
        trace!("Released handles for {}", context);
    }

    fn enumerate_devices(&self, _config: &CaptureConfig) -> DriverResult<Vec<DeviceDescriptor>> {
        self.call(Operation::Enumerate, None, || {
            Ok(lock(&self.devices)
                .iter()
                .map(SimulatedDevice::descriptor)
                .collect())
        })
    }

    fn list_devices(&self) -> DriverResult<Vec<DeviceListing>> {
        self.call(Operation::List, None, || {
            Ok(lock(&self.devices)
                .iter()
                .map(SimulatedDevice::listing)
                .collect())
        })
    }

    fn connect(&self, id: &DeviceId) -> DriverResult<DeviceDescriptor> {
        self.call(Operation::Connect, Some(id), || {
            Ok(self.find(id)?.descriptor())
        })
    }

    fn capture(
        &self,
        id: &DeviceId,
        config: &CaptureConfig,
        format: ImageFormat,
    ) -> DriverResult<Vec<Vec<u8>>> {
        self.call(Operation::Capture, Some(id), || {
            let device = self.find(id)?;
            if !device.formats.contains(&format) {
                return Err(DriverFault::InvalidState(format!(
                    "format {} not supported by {}",
                    format, id
                )));
            }
            if !device.resolutions.contains(&config.resolution) {
                return Err(DriverFault::InvalidState(format!(
                    "resolution {} not supported by {}",
                    config.resolution, id
                )));
            }

            let sequence = self.captures.fetch_add(1, Ordering::SeqCst);
            let pages = (0..device.pages)
                .map(|page| match &device.page_data {
                    Some(data) => data.clone(),
                    None => solid_bmp(4, 4, ((sequence + page) % 256) as u8),
                })
                .collect();
            Ok(pages)
        })
    }
}

/// Encode a solid grey 24-bit BMP
pub fn solid_bmp(width: u32, height: u32, shade: u8) -> Vec<u8> {
    let row_len = (width * 3).div_ceil(4) * 4;
    let pixel_bytes = row_len * height;
    let file_len = 54 + pixel_bytes;

    let mut bmp = Vec::with_capacity(file_len as usize);
    // BITMAPFILEHEADER
    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&file_len.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&54u32.to_le_bytes());
    // BITMAPINFOHEADER
    bmp.extend_from_slice(&40u32.to_le_bytes());
    bmp.extend_from_slice(&(width as i32).to_le_bytes());
    bmp.extend_from_slice(&(height as i32).to_le_bytes());
    bmp.extend_from_slice(&1u16.to_le_bytes());
    bmp.extend_from_slice(&24u16.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&pixel_bytes.to_le_bytes());
    bmp.extend_from_slice(&2835u32.to_le_bytes());
    bmp.extend_from_slice(&2835u32.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());
    bmp.extend_from_slice(&0u32.to_le_bytes());

    for _ in 0..height {
        let mut row = vec![shade; (width * 3) as usize];
        row.resize(row_len as usize, 0);
        bmp.extend_from_slice(&row);
    }
    bmp
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextGuard;

    fn entered(driver: &SimulatedDriver) -> ContextGuard {
        let guard = ContextGuard::enter();
        driver.enter_context(guard.id()).unwrap();
        guard
    }

    #[test]
    fn test_rejects_calls_without_context() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a")]);
        let err = driver.list_devices().unwrap_err();
        assert!(matches!(err, DriverFault::InvalidState(_)));
    }

    #[test]
    fn test_rejects_uninitialised_context() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a")]);
        let _guard = ContextGuard::enter();
        assert!(driver.list_devices().is_err());
    }

    #[test]
    fn test_list_and_connect() {
        let driver = SimulatedDriver::new(vec![
            SimulatedDevice::new("a").with_name("Alpha"),
            SimulatedDevice::new("b"),
        ]);
        let _guard = entered(&driver);

        let listings = driver.list_devices().unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[0].properties.get("Name").unwrap(), "Alpha");

        let desc = driver.connect(&DeviceId::from("a")).unwrap();
        assert_eq!(desc.name, "Alpha");
        assert!(driver.connect(&DeviceId::from("zzz")).is_err());
    }

    #[test]
    fn test_capture_produces_pages() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a").with_pages(2)]);
        let _guard = entered(&driver);

        let pages = driver
            .capture(&DeviceId::from("a"), &CaptureConfig::default(), ImageFormat::Bmp)
            .unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(&pages[0][..2], b"BM");
    }

    #[test]
    fn test_capture_rejects_unsupported_resolution() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a").with_resolutions(vec![200])]);
        let _guard = entered(&driver);

        let result = driver.capture(
            &DeviceId::from("a"),
            &CaptureConfig::default().with_resolution(300),
            ImageFormat::Bmp,
        );
        assert!(matches!(result, Err(DriverFault::InvalidState(_))));
    }

    #[test]
    fn test_one_shot_fault() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a")]);
        let _guard = entered(&driver);
        let id = DeviceId::from("a");

        driver.fail_next(
            Operation::Capture,
            Some(id.clone()),
            DriverFault::CommunicationError("glitch".to_string()),
        );
        let config = CaptureConfig::default();
        assert!(driver.capture(&id, &config, ImageFormat::Bmp).is_err());
        assert!(driver.capture(&id, &config, ImageFormat::Bmp).is_ok());
    }

    #[test]
    fn test_scripted_panic_fires_once() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a")]);
        let _guard = entered(&driver);
        let id = DeviceId::from("a");
        let config = CaptureConfig::default();

        driver.panic_next(Operation::Capture, Some(id.clone()));
        let unwound = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            driver.capture(&id, &config, ImageFormat::Bmp)
        }));
        assert!(unwound.is_err());
        assert!(driver.capture(&id, &config, ImageFormat::Bmp).is_ok());
        assert_eq!(driver.max_in_flight(), 1);
    }

    #[test]
    fn test_unplug_and_records() {
        let driver = SimulatedDriver::new(vec![SimulatedDevice::new("a"), SimulatedDevice::new("b")]);
        let _guard = entered(&driver);

        assert!(driver.unplug(&DeviceId::from("a")));
        assert!(!driver.unplug(&DeviceId::from("a")));
        assert_eq!(driver.list_devices().unwrap().len(), 1);
        assert_eq!(driver.calls_for(Operation::List).len(), 1);
        assert_eq!(driver.max_in_flight(), 1);
    }

    #[test]
    fn test_solid_bmp_layout() {
        let bmp = solid_bmp(3, 2, 0x7f);
        // 3 pixels * 3 bytes = 9, padded to 12 per row
        assert_eq!(bmp.len(), 54 + 12 * 2);
        assert_eq!(u32::from_le_bytes([bmp[2], bmp[3], bmp[4], bmp[5]]) as usize, bmp.len());
    }

    #[test]
    fn test_call_overlap() {
        let start = Instant::now();
        let record = |from: u64, to: u64| CallRecord {
            operation: Operation::List,
            device: None,
            context: ContextId(1),
            started: start + Duration::from_millis(from),
            finished: start + Duration::from_millis(to),
        };
        assert!(record(0, 10).overlaps(&record(5, 15)));
        assert!(!record(0, 10).overlaps(&record(10, 20)));
    }
}
