//! End-to-end runs of the capture service against simulated devices

use common::test_utils::{mock_device_id, simulated_devices, with_timeout};
use driver::DriverFault;
use driver::sim::{Operation, SimulatedDriver};
use service::{AutoScanService, SchedulerState, ServiceConfig};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(output: &Path, repetitions: u64) -> ServiceConfig {
    let mut config = ServiceConfig::default();
    config.capture.interval = Duration::from_millis(200);
    config.capture.repetitions = repetitions;
    config.devices.refresh_interval = Duration::from_secs(60);
    config.output.directory = output.to_string_lossy().into_owned();
    config
}

fn count_files(dir: &Path) -> usize {
    walk(dir).len()
}

fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                files.extend(walk(&path));
            } else {
                files.push(path);
            }
        }
    }
    files
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_bounded_run_saves_every_cycle() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(SimulatedDriver::new(simulated_devices(2)));
    let service = AutoScanService::new(driver.clone(), &config(dir.path(), 3)).unwrap();

    service.start().await.unwrap();
    with_timeout(Duration::from_secs(10), service.wait_complete())
        .await
        .unwrap();
    service.stop().await.unwrap();

    let stats = service.stats();
    assert_eq!(stats.cycles, 3);
    assert_eq!(stats.images_saved, 6);
    assert_eq!(stats.failures, 0);
    assert!(stats.refreshes >= 1);
    assert_eq!(service.state(), SchedulerState::Stopped);

    // One folder per device, one file per saved image
    let device_dirs = std::fs::read_dir(dir.path()).unwrap().flatten().count();
    assert_eq!(device_dirs, 2);
    assert_eq!(count_files(dir.path()) as u64, stats.images_saved);

    // Every worker context was released
    assert_eq!(driver.contexts_entered(), driver.contexts_left());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fast_cycles_keep_every_image() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(SimulatedDriver::new(simulated_devices(1)));
    let mut config = config(dir.path(), 5);
    config.capture.interval = Duration::from_millis(100);
    let service = AutoScanService::new(driver, &config).unwrap();

    service.start().await.unwrap();
    with_timeout(Duration::from_secs(10), service.wait_complete())
        .await
        .unwrap();
    service.stop().await.unwrap();

    // Several cycles land within the same second
    let stats = service.stats();
    assert!(stats.images_saved >= 2);
    assert_eq!(count_files(dir.path()) as u64, stats.images_saved);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_faulty_device_does_not_stop_service() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(SimulatedDriver::new(simulated_devices(2)));
    driver.fail_always(
        Operation::Capture,
        Some(mock_device_id(1)),
        DriverFault::InvalidState("lid open".to_string()),
    );
    let service = AutoScanService::new(driver.clone(), &config(dir.path(), 2)).unwrap();

    service.start().await.unwrap();
    with_timeout(Duration::from_secs(10), service.wait_complete())
        .await
        .unwrap();
    service.stop().await.unwrap();

    let stats = service.stats();
    assert_eq!(stats.cycles, 2);
    assert_eq!(stats.images_saved, 2);
    let registry = service.coordinator().registry();
    assert!(!registry.get(&mock_device_id(1)).unwrap().is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_interrupts_unbounded_run() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(SimulatedDriver::new(simulated_devices(1)));
    let service = AutoScanService::new(driver.clone(), &config(dir.path(), 0)).unwrap();

    service.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    service.pause();
    assert_eq!(service.state(), SchedulerState::Paused);

    with_timeout(Duration::from_secs(10), service.stop())
        .await
        .unwrap()
        .unwrap();

    assert!(service.stats().cycles >= 1);
    assert_eq!(service.state(), SchedulerState::Stopped);
    assert_eq!(driver.contexts_entered(), driver.contexts_left());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_initial_refresh_is_counted() {
    let dir = TempDir::new().unwrap();
    let driver = Arc::new(SimulatedDriver::new(simulated_devices(1)));
    driver.fail_next(
        Operation::List,
        None,
        DriverFault::CommunicationError("service not running".to_string()),
    );
    let service = AutoScanService::new(driver, &config(dir.path(), 1)).unwrap();

    service.start().await.unwrap();
    with_timeout(Duration::from_secs(10), service.wait_complete())
        .await
        .unwrap();
    service.stop().await.unwrap();

    let stats = service.stats();
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.cycles, 1);
    // Nothing registered, so nothing captured
    assert_eq!(stats.images_saved, 0);
}
