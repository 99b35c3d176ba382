//! Common error types

use driver::{DeviceId, DriverFault, ImageFormat};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    /// Capture attempted on a device currently marked disconnected
    #[error("Device not connected: {device_id}")]
    NotConnected { device_id: DeviceId },

    /// Requested transfer format is not in the device's capability set
    #[error("Format {format} not supported by device {device_id}")]
    UnsupportedFormat {
        device_id: DeviceId,
        format: ImageFormat,
    },

    /// A device with the same identifier is already registered
    #[error("Device already registered: {device_id}")]
    DuplicateDevice { device_id: DeviceId },

    /// Communication or invalid-state fault raised by the driver
    #[error(transparent)]
    Driver(#[from] DriverFault),

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ScanError {
    pub fn is_driver_fault(&self) -> bool {
        matches!(self, ScanError::Driver(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ScanError::Cancelled)
    }

    /// The driver fault carried by this error, if any
    pub fn driver_fault(&self) -> Option<&DriverFault> {
        match self {
            ScanError::Driver(fault) => Some(fault),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
