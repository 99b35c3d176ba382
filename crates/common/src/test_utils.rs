//! Test utilities for rust-autoscan
//!
//! Provides mock descriptors, simulated device sets, and helper functions
//! for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_descriptor, mock_device_id};
//!
//! # fn main() {
//! let desc = create_mock_descriptor(1);
//! assert_eq!(desc.id, mock_device_id(1));
//! # }
//! ```

use driver::sim::SimulatedDevice;
use driver::{DeviceDescriptor, DeviceId, DeviceListing, ImageFormat, Properties};
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Device identifier shaped like the ones the native layer hands out
pub fn mock_device_id(n: u32) -> DeviceId {
    DeviceId(format!("{{6BDD1FC6-810F-11D0-BEC7-08002BE2092F}}\\{:04}", n))
}

/// Create a mock descriptor with default capabilities
pub fn create_mock_descriptor(n: u32) -> DeviceDescriptor {
    create_mock_descriptor_with(
        mock_device_id(n),
        vec![100, 200, 300, 600],
        vec![ImageFormat::Bmp, ImageFormat::Png],
    )
}

/// Create a mock descriptor with specific resolutions and formats
pub fn create_mock_descriptor_with(
    id: DeviceId,
    resolutions: Vec<u32>,
    formats: Vec<ImageFormat>,
) -> DeviceDescriptor {
    let mut properties = Properties::new();
    properties.insert("Name".to_string(), format!("Test Scanner {}", id));

    DeviceDescriptor {
        name: format!("Test Scanner {}", id),
        id,
        resolutions,
        formats,
        has_duplex: false,
        has_flatbed: true,
        has_feeder: false,
        properties,
    }
}

pub fn create_mock_listing(n: u32) -> DeviceListing {
    DeviceListing::new(mock_device_id(n))
}

/// Simulated devices `1..=count` using [`mock_device_id`]
pub fn simulated_devices(count: u32) -> Vec<SimulatedDevice> {
    (1..=count)
        .map(|n| SimulatedDevice::new(mock_device_id(n)).with_name(format!("Simulated {}", n)))
        .collect()
}

/// Run a future with a timeout
///
/// # Example
/// ```
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// # #[tokio::main]
/// # async fn main() {
/// let value = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
/// assert_eq!(value, 42);
/// # }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

#[derive(Debug)]
pub struct TimeoutError {
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_device_id_shape() {
        let id = mock_device_id(7);
        assert!(id.as_str().ends_with("\\0007"));
        assert_ne!(mock_device_id(1), mock_device_id(2));
    }

    #[test]
    fn test_create_mock_descriptor() {
        let desc = create_mock_descriptor(3);
        assert_eq!(desc.highest_resolution(), 600);
        assert!(desc.supports_format(ImageFormat::Png));
        assert!(desc.has_flatbed);
    }

    #[test]
    fn test_simulated_devices() {
        let devices = simulated_devices(3);
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].id, mock_device_id(3));
    }

    #[tokio::test]
    async fn test_with_timeout_success() {
        let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await;

        assert!(result.is_ok());
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }
}
