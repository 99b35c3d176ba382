//! Common utilities for rust-autoscan
//!
//! This crate provides functionality shared by the capture core and its
//! shells: the error taxonomy, logging setup, the async channel bridge to
//! dedicated driver worker threads, and observer registration for
//! property-change notifications.

pub mod channel;
pub mod error;
pub mod logging;
pub mod observer;
pub mod test_utils;

pub use channel::{Job, WorkerBridge, WorkerCommand, WorkerEndpoint, create_worker_bridge};
pub use error::{Result, ScanError};
pub use logging::setup_logging;
pub use observer::{Observers, SubscriptionId};
