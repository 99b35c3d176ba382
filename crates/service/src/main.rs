//! autoscan
//!
//! Periodically captures images from every enabled imaging device and saves
//! them below an output directory.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use driver::ScanDriver;
use driver::sim::SimulatedDriver;
use service::config::{DriverBackend, ServiceConfig, parse_duration};
use service::{AutoScanService, Coordinator, DeviceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "autoscan")]
#[command(author, version, about = "Periodic image capture from imaging devices")]
#[command(long_about = "
Captures images from every enabled imaging device at a fixed interval and
saves them below an output directory, one folder per device.

EXAMPLES:
    # Run with default config
    autoscan

    # Capture every 5 minutes, 12 times
    autoscan --interval 5m --count 12

    # List devices and exit
    autoscan --list-devices

    # Run with debug logging
    autoscan --log-level debug

CONFIGURATION:
    The service looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/rust-autoscan/service.toml
    3. /etc/rust-autoscan/service.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Time between captures (e.g. 30s, 5m, 1h30m)
    #[arg(short, long, value_name = "DURATION", value_parser = parse_interval)]
    interval: Option<Duration>,

    /// Number of capture cycles (0 = until stopped)
    #[arg(short = 'n', long, value_name = "N")]
    count: Option<u64>,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<String>,
}

fn parse_interval(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config flag early (before loading config)
    if args.save_config {
        let config = ServiceConfig::default();
        let path = ServiceConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        ServiceConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        ServiceConfig::load_or_default()
    };

    if let Some(interval) = args.interval {
        config.capture.interval = interval;
    }
    if let Some(count) = args.count {
        config.capture.repetitions = count;
    }
    if let Some(output) = args.output {
        config.output.directory = output;
    }
    if let Some(level) = args.log_level {
        config.service.log_level = level;
    }
    config.validate().context("Invalid command-line options")?;

    setup_logging(&config.service.log_level).context("Failed to setup logging")?;

    info!("rust-autoscan v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", config.service.log_level);

    let driver: Arc<dyn ScanDriver> = match config.driver.backend {
        DriverBackend::Simulated => {
            info!(
                "Using simulated driver with {} device(s)",
                config.driver.devices.len()
            );
            Arc::new(SimulatedDriver::new(config.driver.devices.clone()))
        }
    };

    if args.list_devices {
        return list_devices_mode(driver, &config).await;
    }

    run_service(driver, &config).await
}

/// List devices and exit
async fn list_devices_mode(driver: Arc<dyn ScanDriver>, config: &ServiceConfig) -> Result<()> {
    let coordinator = Coordinator::new(
        driver,
        Arc::new(DeviceRegistry::new()),
        config.capture.settings(),
    );

    let result = coordinator
        .refresh(false, &CancellationToken::new())
        .await
        .context("Failed to list devices");

    if result.is_ok() {
        let devices = coordinator.registry().snapshot();
        if devices.is_empty() {
            println!("No devices found.");
        } else {
            println!("Found {} device(s):\n", devices.len());
            for device in devices {
                let descriptor = device.descriptor();
                println!("  [{:04}] {} - {}", device.short_id(), device.id(), device.name());
                println!(
                    "      Resolutions: {:?}  Formats: {}",
                    descriptor.resolutions,
                    descriptor
                        .formats
                        .iter()
                        .map(|f| f.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                println!(
                    "      Flatbed: {}  Feeder: {}  Duplex: {}",
                    descriptor.has_flatbed, descriptor.has_feeder, descriptor.has_duplex
                );
                println!();
            }
        }
    }

    if let Err(e) = coordinator.shutdown().await {
        error!("Error shutting down driver worker: {}", e);
    }
    result.map(|_| ())
}

/// Run the capture service until the schedule completes or Ctrl+C
async fn run_service(driver: Arc<dyn ScanDriver>, config: &ServiceConfig) -> Result<()> {
    let service = AutoScanService::new(driver, config).context("Failed to create service")?;
    service.start().await.context("Failed to start service")?;

    info!(
        "Saving images to {} as {}",
        config.output.directory().display(),
        config.output.format
    );
    info!("Press Ctrl+C to shutdown");

    tokio::select! {
        _ = service.wait_complete() => {
            info!("Capture schedule complete");
        }
        result = signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
            Err(e) => error!("Error waiting for Ctrl+C: {}", e),
        },
    }

    service.stop().await.context("Failed to stop service")?;

    let stats = service.stats();
    println!(
        "{} cycle(s), {} image(s) saved, {} failure(s)",
        stats.cycles, stats.images_saved, stats.failures
    );
    info!("Service shutdown complete");
    Ok(())
}
