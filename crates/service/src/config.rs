//! Service configuration management

use crate::scanner::CaptureSettings;
use crate::scheduler::Repetitions;
use anyhow::{Context, Result, anyhow};
use driver::sim::SimulatedDevice;
use driver::{CaptureConfig, ColorMode, DEFAULT_RESOLUTION, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub service: ServiceSettings,
    #[serde(default)]
    pub capture: CaptureSection,
    #[serde(default)]
    pub devices: DeviceSettings,
    #[serde(default)]
    pub output: OutputSettings,
    #[serde(default)]
    pub driver: DriverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub log_level: String,
}

/// Capture cadence and per-capture parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSection {
    /// Wait before the first capture
    #[serde(with = "duration_serde", default)]
    pub delay: Duration,
    /// Time between captures
    #[serde(with = "duration_serde", default = "CaptureSection::default_interval")]
    pub interval: Duration,
    /// Number of capture cycles (0 = run until stopped)
    #[serde(default)]
    pub repetitions: u64,
    /// Transfer format requested from the driver
    #[serde(default = "CaptureSection::default_format")]
    pub format: ImageFormat,
    /// Capture every device at its own highest resolution
    #[serde(default)]
    pub use_highest_resolution: bool,
    /// Extra attempts after a communication fault
    #[serde(default = "CaptureSection::default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default = "CaptureSection::default_resolution")]
    pub resolution: u32,
    #[serde(default)]
    pub brightness: i32,
    #[serde(default)]
    pub contrast: i32,
    #[serde(default)]
    pub color_mode: ColorMode,
}

impl Default for CaptureSection {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            interval: Self::default_interval(),
            repetitions: 0,
            format: Self::default_format(),
            use_highest_resolution: false,
            retry_budget: Self::default_retry_budget(),
            resolution: Self::default_resolution(),
            brightness: 0,
            contrast: 0,
            color_mode: ColorMode::default(),
        }
    }
}

impl CaptureSection {
    fn default_interval() -> Duration {
        Duration::from_secs(60)
    }

    fn default_format() -> ImageFormat {
        ImageFormat::Bmp
    }

    fn default_retry_budget() -> u32 {
        1
    }

    fn default_resolution() -> u32 {
        DEFAULT_RESOLUTION
    }

    pub fn capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            resolution: self.resolution,
            brightness: self.brightness,
            contrast: self.contrast,
            color_mode: self.color_mode,
        }
        .clamped()
    }

    pub fn settings(&self) -> CaptureSettings {
        CaptureSettings {
            capture: self.capture_config(),
            format: self.format,
            retry_budget: self.retry_budget,
        }
    }

    pub fn repetitions(&self) -> Repetitions {
        Repetitions::from(self.repetitions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Enable devices the first time they are seen
    #[serde(default = "DeviceSettings::default_enable_new")]
    pub enable_new_devices: bool,
    /// Time between registry refreshes
    #[serde(
        with = "duration_serde",
        default = "DeviceSettings::default_refresh_interval"
    )]
    pub refresh_interval: Duration,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            enable_new_devices: Self::default_enable_new(),
            refresh_interval: Self::default_refresh_interval(),
        }
    }
}

impl DeviceSettings {
    fn default_enable_new() -> bool {
        true
    }

    fn default_refresh_interval() -> Duration {
        Duration::from_secs(30)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSettings {
    /// Output directory; `~` is expanded
    #[serde(default = "OutputSettings::default_directory")]
    pub directory: String,
    /// Encoding of saved files
    #[serde(default = "OutputSettings::default_format")]
    pub format: ImageFormat,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            directory: Self::default_directory(),
            format: Self::default_format(),
        }
    }
}

impl OutputSettings {
    fn default_directory() -> String {
        "~/autoscan".to_string()
    }

    fn default_format() -> ImageFormat {
        ImageFormat::Png
    }

    pub fn directory(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.directory).as_ref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverBackend {
    /// In-process simulated devices
    #[default]
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default)]
    pub backend: DriverBackend,
    /// Devices served by the simulated backend
    #[serde(default)]
    pub devices: Vec<SimulatedDevice>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            backend: DriverBackend::Simulated,
            devices: vec![SimulatedDevice::new("SIM\\0001")],
        }
    }
}

/// Custom serde module for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        format_duration(*duration).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    /// Parse a duration string like "1h", "30m", "1h30m", "0"
    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Err("Empty duration".to_string());
        }
        let mut total_secs: u64 = 0;
        let mut current_num = String::new();

        for c in s.chars() {
            if c.is_ascii_digit() {
                current_num.push(c);
            } else {
                if current_num.is_empty() {
                    return Err(format!("Invalid duration format: {}", s));
                }
                let num: u64 = current_num
                    .parse()
                    .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
                current_num.clear();

                let unit_secs = match c {
                    'h' => 3600,
                    'm' => 60,
                    's' => 1,
                    _ => return Err(format!("Invalid duration unit: {}", c)),
                };
                total_secs = num
                    .checked_mul(unit_secs)
                    .and_then(|secs| total_secs.checked_add(secs))
                    .ok_or_else(|| format!("Duration too large: {}", s))?;
            }
        }

        // A trailing bare number counts as seconds
        if !current_num.is_empty() {
            let num: u64 = current_num
                .parse()
                .map_err(|_| format!("Invalid number in duration: {}", current_num))?;
            total_secs = total_secs
                .checked_add(num)
                .ok_or_else(|| format!("Duration too large: {}", s))?;
        }

        Ok(Duration::from_secs(total_secs))
    }

    pub fn format_duration(d: Duration) -> String {
        let secs = d.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        let mut result = String::new();
        if hours > 0 {
            result.push_str(&format!("{}h", hours));
        }
        if mins > 0 {
            result.push_str(&format!("{}m", mins));
        }
        if secs > 0 || result.is_empty() {
            result.push_str(&format!("{}s", secs));
        }
        result
    }
}

pub use duration_serde::parse_duration;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings {
                log_level: "info".to_string(),
            },
            capture: CaptureSection::default(),
            devices: DeviceSettings::default(),
            output: OutputSettings::default(),
            driver: DriverSettings::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).as_ref())
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/rust-autoscan/service.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: ServiceConfig = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("rust-autoscan").join("service.toml")
        } else {
            PathBuf::from(".config/rust-autoscan/service.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.service.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.service.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.capture.interval.is_zero() {
            return Err(anyhow!("capture.interval must be greater than zero"));
        }
        if self.devices.refresh_interval.is_zero() {
            return Err(anyhow!("devices.refresh_interval must be greater than zero"));
        }
        if self.capture.resolution == 0 {
            return Err(anyhow!("capture.resolution must be greater than zero"));
        }

        for device in &self.driver.devices {
            Self::validate_device(device)?;
        }

        Ok(())
    }

    fn validate_device(device: &SimulatedDevice) -> Result<()> {
        if device.id.as_str().is_empty() {
            return Err(anyhow!("Simulated device with an empty id"));
        }
        if device.resolutions.is_empty() {
            return Err(anyhow!("Device '{}' lists no resolutions", device.id));
        }
        if device.resolutions.contains(&0) {
            return Err(anyhow!(
                "Device '{}' lists a resolution of zero",
                device.id
            ));
        }
        if device.formats.is_empty() {
            return Err(anyhow!("Device '{}' lists no formats", device.id));
        }
        Ok(())
    }
}
