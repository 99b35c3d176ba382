//! Scanner subsystem
//!
//! Tracks imaging devices and serialises every driver call.
//!
//! This module implements the capture core:
//! - Per-device state (connected, enabled, imaging) and single captures
//! - The device registry and its reconciliation against driver snapshots
//! - Dedicated worker threads carrying the driver's context identity
//! - The coordinator that multiplexes capture batches and refreshes onto
//!   those workers under a single hardware lock
//!
//! The native driver only tolerates calls from a dedicated thread, so no
//! driver call ever runs on a Tokio worker.

pub mod coordinator;
pub mod device;
pub mod registry;
pub mod worker;

pub use coordinator::{CaptureSettings, CapturedImage, Coordinator};
pub use device::{Device, DeviceEvent, DeviceProperty, ImageBuffer};
pub use registry::{DeviceRegistry, RefreshSummary, RegistryEvent};
pub use worker::DriverWorker;
