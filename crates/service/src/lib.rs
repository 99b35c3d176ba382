//! Periodic capture from thread-affine imaging devices
//!
//! The [`scanner`] module holds the capture core: per-device state, the
//! device registry, dedicated driver worker threads and the coordinator that
//! serialises hardware access. [`scheduler`] drives capture cycles,
//! [`storage`] decides where images land, and [`service`] ties everything
//! together for the `autoscan` binary.

pub mod config;
pub mod scanner;
pub mod scheduler;
pub mod service;
pub mod storage;

pub use config::ServiceConfig;
pub use scanner::{
    CaptureSettings, CapturedImage, Coordinator, Device, DeviceEvent, DeviceProperty,
    DeviceRegistry, DriverWorker, RefreshSummary, RegistryEvent,
};
pub use scheduler::{IntervalScheduler, Repetitions, SchedulerState, Tick};
pub use service::{AutoScanService, ServiceStats};
pub use storage::{FileImageSink, ImageSink, ImageStore, image_path};
