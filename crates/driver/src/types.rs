//! Device and capture type definitions
//!
//! This module defines the data exchanged across the driver boundary:
//! device identifiers, lightweight listings, full capability descriptors,
//! and capture configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Resolution used when a device reports no resolutions at all
pub const DEFAULT_RESOLUTION: u32 = 300;

/// Lower and upper bound for brightness and contrast adjustments
pub const ADJUSTMENT_RANGE: (i32, i32) = (-1000, 1000);

/// Raw device property list as reported by the driver
pub type Properties = BTreeMap<String, String>;

/// Unique device identifier (driver-assigned)
///
/// Opaque and stable: the driver never reassigns an identifier once it has
/// been observed. Identifiers are compared by exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Image transfer formats understood by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Bmp,
    Png,
    Jpeg,
    Tiff,
    Gif,
}

impl ImageFormat {
    /// File extension without the leading dot
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Bmp => "bmp",
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Gif => "gif",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::Gif => "image/gif",
        }
    }

    /// Whether the format preserves pixel data exactly
    pub fn is_lossless(self) -> bool {
        !matches!(self, ImageFormat::Jpeg)
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Color mode requested from the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorMode {
    #[default]
    Color,
    Grayscale,
    BlackWhite,
}

/// Capture configuration passed to the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Resolution in dots per inch
    pub resolution: u32,
    /// Brightness adjustment (-1000..=1000)
    #[serde(default)]
    pub brightness: i32,
    /// Contrast adjustment (-1000..=1000)
    #[serde(default)]
    pub contrast: i32,
    #[serde(default)]
    pub color_mode: ColorMode,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            brightness: 0,
            contrast: 0,
            color_mode: ColorMode::Color,
        }
    }
}

impl CaptureConfig {
    /// Copy of this configuration with a different resolution
    pub fn with_resolution(self, resolution: u32) -> Self {
        Self { resolution, ..self }
    }

    /// Copy of this configuration with adjustments clamped to the driver range
    pub fn clamped(self) -> Self {
        let (min, max) = ADJUSTMENT_RANGE;
        Self {
            brightness: self.brightness.clamp(min, max),
            contrast: self.contrast.clamp(min, max),
            ..self
        }
    }
}

/// Lightweight listing entry
///
/// Returned by the cheap enumeration call that does not open a full
/// connection to each device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListing {
    pub id: DeviceId,
    #[serde(default)]
    pub properties: Properties,
}

impl DeviceListing {
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            properties: Properties::new(),
        }
    }
}

/// Full capability descriptor for one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Unique device identifier
    pub id: DeviceId,
    /// Human-readable device name
    pub name: String,
    /// Supported resolutions in dots per inch
    pub resolutions: Vec<u32>,
    /// Supported transfer formats
    pub formats: Vec<ImageFormat>,
    /// Device can capture both sides of a sheet
    pub has_duplex: bool,
    /// Device has a flatbed
    pub has_flatbed: bool,
    /// Device has a document feeder
    pub has_feeder: bool,
    /// Raw device property list
    pub properties: Properties,
}

impl DeviceDescriptor {
    /// Highest supported resolution
    pub fn highest_resolution(&self) -> u32 {
        self.resolutions
            .iter()
            .copied()
            .max()
            .unwrap_or(DEFAULT_RESOLUTION)
    }

    /// Supported resolution nearest to `requested`
    ///
    /// Ties resolve to the higher resolution.
    pub fn closest_resolution(&self, requested: u32) -> u32 {
        self.resolutions
            .iter()
            .copied()
            .min_by_key(|r| (r.abs_diff(requested), std::cmp::Reverse(*r)))
            .unwrap_or(DEFAULT_RESOLUTION)
    }

    pub fn supports_format(&self, format: ImageFormat) -> bool {
        self.formats.contains(&format)
    }
}
