//! Imaging driver boundary for rust-autoscan
//!
//! This crate defines everything the capture core knows about the native
//! imaging layer: device identifiers and capability descriptors, capture
//! configuration, the closed set of driver faults, the blocking
//! [`ScanDriver`] trait, and the execution-context identity that every
//! driver call must carry.
//!
//! The native layer only tolerates calls from a dedicated thread with a
//! fixed context identity. Workers install that identity with
//! [`context::ContextGuard`] before touching a driver.
//!
//! # Example
//!
//! ```
//! use driver::sim::{SimulatedDevice, SimulatedDriver};
//! use driver::{ContextGuard, ScanDriver};
//!
//! let driver = SimulatedDriver::new(vec![SimulatedDevice::new("scanner\\0001")]);
//!
//! // Outside a dedicated context the driver refuses to work
//! assert!(driver.list_devices().is_err());
//!
//! let guard = ContextGuard::enter();
//! driver.enter_context(guard.id()).unwrap();
//! let listings = driver.list_devices().unwrap();
//! assert_eq!(listings.len(), 1);
//! ```

pub mod context;
pub mod error;
pub mod scan;
pub mod sim;
pub mod types;

pub use context::{ContextGuard, ContextId};
pub use error::{DriverFault, DriverResult};
pub use scan::ScanDriver;
pub use types::{
    CaptureConfig, ColorMode, DEFAULT_RESOLUTION, DeviceDescriptor, DeviceId, DeviceListing,
    ImageFormat, Properties,
};
