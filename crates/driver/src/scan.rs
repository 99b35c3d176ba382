//! Blocking driver trait

use crate::context::ContextId;
use crate::error::DriverResult;
use crate::types::{CaptureConfig, DeviceDescriptor, DeviceId, DeviceListing, ImageFormat};

/// Blocking interface to the native imaging layer
///
/// Every method may block for a long time and cannot be interrupted. All
/// calls must originate from a thread that has installed a context identity
/// (see [`crate::context`]); implementations are free to reject calls that
/// do not. Any call may fail with a [`crate::DriverFault`], including
/// spuriously on a healthy device.
pub trait ScanDriver: Send + Sync + 'static {
    /// Called once on a worker thread right after its context is installed
    fn enter_context(&self, _context: ContextId) -> DriverResult<()> {
        Ok(())
    }

    /// Called once on a worker thread right before it exits
    fn leave_context(&self, _context: ContextId) {}

    /// Forcibly release per-call resources accumulated by this context
    fn release_handles(&self, _context: ContextId) {}

    /// Full enumeration of reachable devices with capability data
    fn enumerate_devices(&self, config: &CaptureConfig) -> DriverResult<Vec<DeviceDescriptor>>;

    /// Lightweight listing of identifiers and raw properties
    fn list_devices(&self) -> DriverResult<Vec<DeviceListing>>;

    /// Open a full connection to one device and read its capabilities
    fn connect(&self, id: &DeviceId) -> DriverResult<DeviceDescriptor>;

    /// Capture images from one device
    ///
    /// Returns one buffer per acquired page, encoded in `format`.
    fn capture(
        &self,
        id: &DeviceId,
        config: &CaptureConfig,
        format: ImageFormat,
    ) -> DriverResult<Vec<Vec<u8>>>;
}
