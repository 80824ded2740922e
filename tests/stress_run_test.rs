//! End-to-end stress runs on the simulated bus
//!
//! Each test wires a `MockBus` with a camera, runs the full start → poll →
//! stop → write sequence and inspects the camera and the results file.

use std::sync::Arc;
use std::time::Duration;

use rust_stresstest::acquisition::{with_acquisition, AcquisitionSettings};
use rust_stresstest::config::{SimulationConfig, StressConfig};
use rust_stresstest::hardware::capabilities::{ControlBus, DeviceControl, DeviceState};
use rust_stresstest::hardware::mock::{LatencyProfile, MockAttribute, MockBus, MockCamera};
use rust_stresstest::measurement::{self, PollOptions, RunParameters, WorkerErrorPolicy};
use rust_stresstest::storage;
use rust_stresstest::StressError;

const CAMERA: &str = "p04/tangovimba/test_cam";

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn params(wait_s: f64, total_time_s: f64) -> RunParameters {
    RunParameters {
        fps: 2.0,
        stream_mb: 6.0,
        subscribe: true,
        wait_s,
        total_time_s,
    }
}

#[tokio::test(start_paused = true)]
async fn full_run_writes_one_column_per_attribute() {
    let camera = Arc::new(MockCamera::new(CAMERA, 17.5));
    let latency = LatencyProfile::fixed(Duration::from_millis(1));
    let bus = MockBus::new()
        .with_camera(Arc::clone(&camera))
        .with_attribute(MockAttribute::guess("sys/tg_test/1/ampli").with_latency(latency))
        .with_attribute(MockAttribute::guess("sys/tg_test/1/State").with_latency(latency));
    let bus: Arc<dyn ControlBus> = Arc::new(bus);

    let attributes = names(&[
        "sys/tg_test/1/State",
        "sys/tg_test/1/not_there",
        "sys/tg_test/1/ampli",
    ]);
    let table = with_acquisition(
        camera.clone(),
        &AcquisitionSettings::new(2.0, 6.0, true),
        measurement::run(
            Arc::clone(&bus),
            &attributes,
            Duration::from_millis(100),
            Duration::from_millis(500),
            &PollOptions::default(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(camera.state().await.unwrap(), DeviceState::On);
    assert_eq!(camera.subscription_count().await, 0);

    let dir = tempfile::tempdir().unwrap();
    let path = storage::save_timestamped(dir.path(), &table, &params(0.1, 0.5)).unwrap();
    let loaded = storage::load_timings(&path).unwrap();

    let columns: Vec<&str> = loaded.table.attributes().collect();
    assert_eq!(columns, attributes.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(loaded.table.get("sys/tg_test/1/not_there"), Some(&Vec::new()));
    let state = loaded.table.get("sys/tg_test/1/State").unwrap();
    assert!(state.len().abs_diff(5) <= 1, "got {} samples", state.len());
    assert!(state.iter().all(|ms| *ms >= 1.0));
    assert_eq!(
        loaded.parameters.first(),
        Some(&("fps".to_string(), "2".to_string()))
    );
}

#[tokio::test(start_paused = true)]
async fn failed_poll_still_stops_camera_and_writes_nothing() {
    let camera = Arc::new(MockCamera::new(CAMERA, 17.5));
    let bus = MockBus::new()
        .with_camera(Arc::clone(&camera))
        .with_attribute(MockAttribute::guess("d/x/1/a"))
        .with_attribute(MockAttribute::guess("d/x/1/flaky").failing_after(3));
    let bus: Arc<dyn ControlBus> = Arc::new(bus);

    let result = with_acquisition(
        camera.clone(),
        &AcquisitionSettings::new(2.0, 6.0, true),
        measurement::run(
            bus,
            &names(&["d/x/1/a", "d/x/1/flaky"]),
            Duration::from_millis(10),
            Duration::from_secs(1),
            &PollOptions::default(),
        ),
    )
    .await;

    assert!(matches!(result, Err(StressError::WorkerFailed { .. })));
    assert_eq!(camera.state().await.unwrap(), DeviceState::On);
    let journal = camera.journal().await;
    assert_eq!(journal.last().map(String::as_str), Some("command StopAcquisition"));
    assert!(journal.iter().any(|e| e.starts_with("unsubscribe")));
}

#[tokio::test(start_paused = true)]
async fn truncate_policy_writes_partial_column() {
    let camera = Arc::new(MockCamera::new(CAMERA, 17.5));
    let bus = MockBus::new()
        .with_camera(Arc::clone(&camera))
        .with_attribute(MockAttribute::guess("d/x/1/a"))
        .with_attribute(MockAttribute::guess("d/x/1/flaky").failing_after(3));
    let bus: Arc<dyn ControlBus> = Arc::new(bus);
    let options = PollOptions {
        max_workers: Some(2),
        on_error: WorkerErrorPolicy::Truncate,
    };

    let table = with_acquisition(
        camera.clone(),
        &AcquisitionSettings::new(2.0, 6.0, false),
        measurement::run(
            bus,
            &names(&["d/x/1/a", "d/x/1/flaky"]),
            Duration::from_millis(10),
            Duration::from_millis(100),
            &options,
        ),
    )
    .await
    .unwrap();

    let mut out = Vec::new();
    storage::write_timings(&mut out, &table, &params(0.01, 0.1)).unwrap();
    let text = String::from_utf8(out).unwrap();
    let body: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();

    assert!(body.len() > 2);
    assert!(!body[1].ends_with("nan"));
    assert!(body[2].ends_with(",nan"));
    assert!(camera
        .journal()
        .await
        .iter()
        .all(|e| !e.starts_with("subscribe")));
}

#[tokio::test]
async fn device_failure_aborts_before_polling() {
    let camera = Arc::new(MockCamera::new(CAMERA, 17.5).with_failing_command("StartAcquisition"));
    let attribute = MockAttribute::guess("d/x/1/a");
    let bus = MockBus::new()
        .with_camera(Arc::clone(&camera))
        .with_attribute(attribute);
    let bus = Arc::new(bus);

    let result = with_acquisition(
        camera.clone(),
        &AcquisitionSettings::new(2.0, 6.0, true),
        measurement::run(
            bus.clone(),
            &names(&["d/x/1/a"]),
            Duration::ZERO,
            Duration::ZERO,
            &PollOptions::default(),
        ),
    )
    .await;

    assert!(matches!(result, Err(StressError::Device { .. })));
    assert_eq!(bus.mock_attribute("d/x/1/a").unwrap().read_count(), 0);
    assert_eq!(camera.subscription_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn simulated_bus_follows_configuration() {
    let mut config = StressConfig::default();
    config.attributes.list = names(&["d/x/1/a", "d/x/1/gone"]);
    config.run.wait_s = 0.05;
    config.run.total_time_s = 0.2;
    config.simulation = SimulationConfig {
        base_latency_ms: 1.0,
        jitter_ms: 0.0,
        streaming_penalty_ms: 2.0,
        unreachable: names(&["d/x/1/gone"]),
        ..SimulationConfig::default()
    };

    let attributes = config.attribute_list();
    let bus: Arc<dyn ControlBus> = Arc::new(MockBus::simulated(
        &config.simulation,
        &config.camera.device,
        &attributes,
    ));
    let camera: Arc<dyn DeviceControl> = bus.device(&config.camera.device).await.unwrap();

    let table = with_acquisition(
        Arc::clone(&camera),
        &config.acquisition_settings(),
        measurement::run(
            Arc::clone(&bus),
            &attributes,
            config.poll_wait(),
            config.poll_duration(),
            &config.poll_options(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(table.get("d/x/1/gone"), Some(&Vec::new()));
    // base 1 ms plus the 2 ms streaming penalty
    let samples = table.get("d/x/1/a").unwrap();
    assert!(!samples.is_empty());
    assert!(
        samples.iter().all(|ms| (ms - 3.0).abs() < 1e-6),
        "unexpected samples {samples:?}"
    );
    assert_eq!(camera.state().await.unwrap(), DeviceState::On);
}

#[tokio::test(start_paused = true)]
async fn simulated_failing_attribute_aborts_run() {
    let mut config = StressConfig::default();
    config.attributes.list = names(&["d/x/1/a", "d/x/1/b"]);
    config.run.wait_s = 0.01;
    config.run.total_time_s = 1.0;
    config
        .simulation
        .failing_after
        .insert("d/x/1/b".to_string(), 3);
    config.validate().unwrap();

    let attributes = config.attribute_list();
    let bus: Arc<dyn ControlBus> = Arc::new(MockBus::simulated(
        &config.simulation,
        &config.camera.device,
        &attributes,
    ));
    let camera: Arc<dyn DeviceControl> = bus.device(&config.camera.device).await.unwrap();

    let result = with_acquisition(
        Arc::clone(&camera),
        &config.acquisition_settings(),
        measurement::run(
            Arc::clone(&bus),
            &attributes,
            config.poll_wait(),
            config.poll_duration(),
            &config.poll_options(),
        ),
    )
    .await;

    match result {
        Err(StressError::WorkerFailed {
            attribute, samples, ..
        }) => {
            assert_eq!(attribute, "d/x/1/b");
            // probe plus two timed reads succeed
            assert_eq!(samples, 2);
        }
        other => panic!("expected WorkerFailed, got {:?}", other.map(|t| t.len())),
    }
    assert_eq!(camera.state().await.unwrap(), DeviceState::On);
}
