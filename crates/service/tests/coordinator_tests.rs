//! Coordinator behaviour against the instrumented simulated driver

use common::ScanError;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, mock_device_id, simulated_devices, with_timeout};
use driver::DriverFault;
use driver::sim::{Operation, SimulatedDriver};
use service::{CaptureSettings, Coordinator, DeviceRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn setup(devices: u32) -> (Arc<SimulatedDriver>, Arc<Coordinator>) {
    let driver = Arc::new(SimulatedDriver::new(simulated_devices(devices)));
    let coordinator = Coordinator::new(
        driver.clone(),
        Arc::new(DeviceRegistry::new()),
        CaptureSettings::default(),
    );
    (driver, Arc::new(coordinator))
}

async fn registered(devices: u32) -> (Arc<SimulatedDriver>, Arc<Coordinator>) {
    let (driver, coordinator) = setup(devices);
    coordinator
        .refresh(true, &CancellationToken::new())
        .await
        .unwrap();
    (driver, coordinator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capture_and_refresh_never_overlap() {
    let (driver, coordinator) = registered(2).await;
    driver.set_latency(Operation::Capture, Duration::from_millis(20));
    driver.set_latency(Operation::List, Duration::from_millis(20));

    let mut tasks = Vec::new();
    for i in 0..6 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            if i % 2 == 0 {
                coordinator.capture_batch(false, &cancel).await.map(|_| ())
            } else {
                coordinator.refresh(true, &cancel).await.map(|_| ())
            }
        }));
    }
    for task in tasks {
        with_timeout(DEFAULT_TEST_TIMEOUT, task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    let calls = driver.calls();
    assert!(calls.len() >= 6 + 3);
    for (i, a) in calls.iter().enumerate() {
        for b in &calls[i + 1..] {
            assert!(!a.overlaps(b), "{:?} overlaps {:?}", a, b);
        }
    }
    assert_eq!(driver.max_in_flight(), 1);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_device_fault_does_not_abort_batch() {
    let (driver, coordinator) = registered(2).await;
    driver.fail_always(
        Operation::Capture,
        Some(mock_device_id(1)),
        DriverFault::CommunicationError("paper jam".to_string()),
    );

    let images = coordinator
        .capture_batch(false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(images.len(), 1);
    assert_eq!(images[0].device_id, mock_device_id(2));
    let registry = coordinator.registry();
    assert!(!registry.get(&mock_device_id(1)).unwrap().is_connected());
    assert!(registry.get(&mock_device_id(2)).unwrap().is_connected());

    // A disconnected device is skipped on the next batch
    let before = driver.calls_for(Operation::Capture).len();
    coordinator
        .capture_batch(false, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(driver.calls_for(Operation::Capture).len(), before + 1);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_retry_budget_absorbs_transient_fault() {
    let (driver, coordinator) = registered(1).await;
    coordinator.update_config(CaptureSettings {
        retry_budget: 1,
        ..CaptureSettings::default()
    });
    driver.fail_next(
        Operation::Capture,
        Some(mock_device_id(1)),
        DriverFault::CommunicationError("timeout".to_string()),
    );

    let images = coordinator
        .capture_batch(false, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(images.len(), 1);
    assert_eq!(driver.calls_for(Operation::Capture).len(), 2);
    assert!(coordinator
        .registry()
        .get(&mock_device_id(1))
        .unwrap()
        .is_connected());
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_each_batch_gets_a_fresh_context() {
    let (driver, coordinator) = registered(1).await;
    let cancel = CancellationToken::new();

    for _ in 0..3 {
        coordinator.capture_batch(false, &cancel).await.unwrap();
    }
    coordinator.refresh(true, &cancel).await.unwrap();

    let capture_contexts: HashSet<_> = driver
        .calls_for(Operation::Capture)
        .iter()
        .map(|c| c.context)
        .collect();
    let refresh_contexts: HashSet<_> = driver
        .calls_for(Operation::List)
        .iter()
        .map(|c| c.context)
        .collect();

    assert_eq!(capture_contexts.len(), 3);
    assert_eq!(refresh_contexts.len(), 1);
    assert!(capture_contexts.is_disjoint(&refresh_contexts));

    // Batch workers are gone; the refresh worker lives until shutdown
    assert_eq!(driver.contexts_entered(), 4);
    assert_eq!(driver.contexts_left(), 3);
    assert_eq!(driver.handle_releases(), 3);

    coordinator.shutdown().await.unwrap();
    assert_eq!(driver.contexts_left(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_between_devices() {
    let (driver, coordinator) = registered(3).await;
    driver.set_latency(Operation::Capture, Duration::from_millis(150));
    let cancel = CancellationToken::new();

    let batch = {
        let coordinator = coordinator.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { coordinator.capture_batch(false, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = batch.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    // The in-flight capture ran to completion; no further device was touched
    assert_eq!(driver.calls_for(Operation::Capture).len(), 1);
    // The batch context was torn down before the outcome was returned
    assert_eq!(driver.contexts_left(), driver.contexts_entered() - 1);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_waiter_does_not_hold_lock() {
    let (driver, coordinator) = registered(1).await;
    driver.set_latency(Operation::Capture, Duration::from_millis(200));

    let batch = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .capture_batch(false, &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;

    let waiter_cancel = CancellationToken::new();
    let waiter = {
        let coordinator = coordinator.clone();
        let cancel = waiter_cancel.clone();
        tokio::spawn(async move { coordinator.refresh(true, &cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    waiter_cancel.cancel();

    let err = waiter.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert!(!batch.is_finished());

    assert_eq!(batch.await.unwrap().unwrap().len(), 1);
    // The lock is free again
    with_timeout(
        DEFAULT_TEST_TIMEOUT,
        coordinator.refresh(true, &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_await_idle_waits_for_in_flight_batch() {
    let (driver, coordinator) = registered(1).await;
    driver.set_latency(Operation::Capture, Duration::from_millis(100));

    let batch = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .capture_batch(false, &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    coordinator
        .await_idle(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(driver.calls_for(Operation::Capture).len(), 1);

    batch.await.unwrap().unwrap();
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_caller_keeps_lock_until_batch_ends() {
    let (driver, coordinator) = registered(1).await;
    driver.set_latency(Operation::Capture, Duration::from_millis(150));

    let batch = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            coordinator
                .capture_batch(false, &CancellationToken::new())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    batch.abort();

    coordinator
        .refresh(true, &CancellationToken::new())
        .await
        .unwrap();

    let capture = &driver.calls_for(Operation::Capture)[0];
    let list = driver.calls_for(Operation::List);
    let last_list = list.last().unwrap();
    assert!(!capture.overlaps(last_list));
    assert!(last_list.started >= capture.finished);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_batch_visits_devices_in_identifier_order() {
    let driver = Arc::new(SimulatedDriver::new(
        simulated_devices(3).into_iter().rev().collect(),
    ));
    let coordinator = Coordinator::new(
        driver.clone(),
        Arc::new(DeviceRegistry::new()),
        CaptureSettings::default(),
    );
    let cancel = CancellationToken::new();
    coordinator.refresh(true, &cancel).await.unwrap();
    assert_eq!(coordinator.registry().ids()[0], mock_device_id(3));

    coordinator.capture_batch(false, &cancel).await.unwrap();

    let order: Vec<_> = driver
        .calls_for(Operation::Capture)
        .into_iter()
        .filter_map(|c| c.device)
        .collect();
    assert_eq!(order, vec![mock_device_id(1), mock_device_id(2), mock_device_id(3)]);
    coordinator.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_capture_does_not_strand_device() {
    let (driver, coordinator) = registered(1).await;
    driver.panic_next(Operation::Capture, Some(mock_device_id(1)));
    let cancel = CancellationToken::new();

    let err = coordinator.capture_batch(false, &cancel).await.unwrap_err();
    assert!(matches!(err, ScanError::WorkerPanicked(_)));

    let device = coordinator.registry().get(&mock_device_id(1)).unwrap();
    assert!(!device.is_imaging());

    // The next batch captures from it again
    let images = coordinator.capture_batch(false, &cancel).await.unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(driver.contexts_left(), driver.contexts_entered() - 1);
    coordinator.shutdown().await.unwrap();
}
