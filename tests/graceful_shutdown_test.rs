//! Tests for graceful shutdown with timeout behavior.

use pm_monitor::config::{AcquisitionConfig, InstrumentSettings};
use pm_monitor::controller::{Controller, SessionState};
use pm_monitor::data::{ResultReceiver, Update};
use pm_monitor::error::MonitorError;
use pm_monitor::instrument::mock::{MockDevice, MockResourceManager, DEFAULT_ADDRESS};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config(delay_seconds: f64) -> AcquisitionConfig {
    AcquisitionConfig {
        window_size: 10,
        offset_db: 0.0,
        frequency_ghz: 5.0,
        delay_seconds,
    }
}

fn settings(stop_grace: Duration) -> InstrumentSettings {
    InstrumentSettings {
        io_timeout: Duration::from_secs(2),
        stop_grace,
        ..Default::default()
    }
}

async fn wait_for_first_reading(receiver: &mut ResultReceiver) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !matches!(receiver.next().await, Some(Update::Reading(_))) {}
    })
    .await
    .expect("no reading within 2s");
}

#[tokio::test]
async fn test_stop_during_wait_is_prompt() {
    let manager = Arc::new(MockResourceManager::single_meter());
    let controller = Controller::new(manager.clone(), settings(Duration::from_secs(5)));

    // Long delay: the loop is parked in its wait when stop arrives.
    let mut receiver = controller.subscribe();
    controller.start(config(30.0)).await.unwrap();
    wait_for_first_reading(&mut receiver).await;

    let start = Instant::now();
    controller.stop().await;
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(500),
        "Stop took too long: {:?}",
        elapsed
    );
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(manager.open_handles(), 0);
    assert_eq!(manager.measurements(DEFAULT_ADDRESS), 1);
}

#[tokio::test]
async fn test_stop_during_read_waits_for_io() {
    let manager = Arc::new(MockResourceManager::new().with_device(
        MockDevice::new(DEFAULT_ADDRESS).with_measure_latency(Duration::from_millis(200)),
    ));
    let controller = Controller::new(manager.clone(), settings(Duration::from_secs(5)));

    let mut receiver = controller.subscribe();
    controller.start(config(0.01)).await.unwrap();
    wait_for_first_reading(&mut receiver).await;

    let start = Instant::now();
    controller.stop().await;
    let elapsed = start.elapsed();

    // Bounded by one round-trip plus one delay interval.
    assert!(
        elapsed < Duration::from_millis(200 + 10 + 300),
        "Stop took too long: {:?}",
        elapsed
    );
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(manager.open_handles(), 0);
}

#[tokio::test]
async fn test_stop_aborts_worker_after_grace_period() {
    let manager = Arc::new(MockResourceManager::new().with_device(
        MockDevice::new(DEFAULT_ADDRESS).with_measure_latency(Duration::from_millis(1500)),
    ));
    let controller = Controller::new(manager.clone(), settings(Duration::from_millis(100)));

    controller.start(config(0.01)).await.unwrap();
    // Let the worker enter its first (slow) read.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    controller.stop().await;
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(1000),
        "Stop did not honour the grace period: {:?}",
        elapsed
    );
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(controller.subscribe().latest(), Update::Stopped);
    assert_eq!(manager.open_handles(), 0);
}

#[tokio::test]
async fn test_shutdown_stops_active_run() {
    let manager = Arc::new(MockResourceManager::single_meter());
    let controller = Controller::new(manager.clone(), settings(Duration::from_secs(1)));

    let mut receiver = controller.subscribe();
    controller.start(config(0.01)).await.unwrap();
    wait_for_first_reading(&mut receiver).await;
    controller.shutdown().await;

    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(manager.open_handles(), 0);

    // Shutdown without a run is also fine.
    controller.shutdown().await;
}

#[tokio::test]
async fn test_dropping_controller_cancels_worker() {
    let manager = Arc::new(MockResourceManager::single_meter());
    let controller = Controller::new(manager.clone(), settings(Duration::from_secs(1)));

    let mut receiver = controller.subscribe();
    controller.start(config(0.01)).await.unwrap();
    wait_for_first_reading(&mut receiver).await;
    drop(controller);

    tokio::time::timeout(Duration::from_secs(2), async {
        while manager.open_handles() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker kept the meter open after the controller was dropped");
}

#[tokio::test]
async fn test_stop_cancels_single_read_within_grace() {
    let manager = Arc::new(MockResourceManager::new().with_device(
        MockDevice::new(DEFAULT_ADDRESS).with_measure_latency(Duration::from_millis(1500)),
    ));
    let controller = Arc::new(Controller::new(
        manager.clone(),
        settings(Duration::from_millis(100)),
    ));

    let read = tokio::spawn({
        let controller = controller.clone();
        async move { controller.single_read(config(1.0)).await }
    });
    // Let the worker enter the slow measurement query.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let start = Instant::now();
    controller.stop().await;
    let elapsed = start.elapsed();

    assert!(
        elapsed < Duration::from_millis(500),
        "Stop waited for the single read: {:?}",
        elapsed
    );
    assert_eq!(read.await.unwrap().unwrap_err(), MonitorError::Cancelled);
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(controller.subscribe().latest(), Update::Stopped);
    assert_eq!(manager.open_handles(), 0);
}

#[tokio::test]
async fn test_single_read_does_not_hold_the_caller_during_io() {
    let manager = Arc::new(MockResourceManager::new().with_device(
        MockDevice::new(DEFAULT_ADDRESS).with_measure_latency(Duration::from_millis(300)),
    ));
    let controller = Arc::new(Controller::new(manager.clone(), settings(Duration::from_secs(1))));

    let read = tokio::spawn({
        let controller = controller.clone();
        async move { controller.single_read(config(1.0)).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The run slot is taken, but the request is answered at once.
    let start = Instant::now();
    let err = controller.start(config(0.01)).await.unwrap_err();
    assert_eq!(err, MonitorError::AlreadyAcquiring);
    assert!(start.elapsed() < Duration::from_millis(100));

    let reading = read.await.unwrap().unwrap();
    assert_eq!(reading.sample_count, 1);
    assert_eq!(controller.state(), SessionState::Stopped);
    assert_eq!(manager.open_handles(), 0);
}
