//! Mock Control Bus
//!
//! Provides a simulated control bus for running the stress test without a
//! facility network. All mock devices use async-safe operations
//! (tokio::time::sleep, not std::thread::sleep), so tests can run on paused
//! time.
//!
//! # Available Mocks
//!
//! - `MockAttribute` - Readable attribute with configurable latency and failure injection
//! - `MockCamera` - Camera device with acquisition state, writable settings and image events
//! - `MockBus` - Name resolver tying attributes and devices together
//!
//! # Load Model
//!
//! Every attribute shares a streaming flag with the camera. While the camera
//! is acquiring, each read takes `streaming_penalty` longer. That is the effect
//! the stress test is meant to detect on real hardware.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};

use crate::acquisition::{
    CMD_START_ACQUISITION, CMD_STOP_ACQUISITION, PROP_FRAME_RATE_ABS, PROP_FRAME_RATE_LIMIT,
    PROP_STREAM_BYTES_PER_SECOND, PROP_VIEWING_MODE,
};
use crate::config::SimulationConfig;
use crate::hardware::capabilities::{
    AttributeReader, AttributeValue, ControlBus, DeviceControl, DeviceState, Event, EventHandler,
    EventKind, SubscriptionId,
};

// =============================================================================
// Latency model
// =============================================================================

/// Simulated round-trip time of one attribute read.
///
/// The delay is a `tokio::time::sleep`, so the tokio timer rounds it up to the
/// next whole millisecond. A 0.5 ms base latency reads as 1 ms.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyProfile {
    /// Fixed latency of every read
    pub base: Duration,
    /// Upper bound of uniformly distributed extra latency
    pub jitter: Duration,
    /// Extra latency while the camera is streaming
    pub streaming_penalty: Duration,
}

impl LatencyProfile {
    /// Profile with a fixed latency and no jitter
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    fn sample(&self, streaming: bool) -> Duration {
        let mut total = self.base;
        if streaming {
            total += self.streaming_penalty;
        }
        let jitter_us = self.jitter.as_micros() as u64;
        if jitter_us > 0 {
            total += Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_us));
        }
        total
    }
}

/// Tracks how many reads are in flight across the whole bus.
#[derive(Debug, Default)]
pub struct LoadCounter {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl LoadCounter {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Highest number of simultaneous reads observed
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

// =============================================================================
// MockAttribute
// =============================================================================

/// Simulated remote attribute
///
/// # Example
///
/// ```rust,ignore
/// let attr = MockAttribute::new("sys/tg_test/1/ampli", AttributeValue::Double(1.0))
///     .with_latency(LatencyProfile::fixed(Duration::from_millis(2)))
///     .failing_after(10);
/// ```
pub struct MockAttribute {
    name: String,
    value: AttributeValue,
    latency: LatencyProfile,
    fail_after: Option<u64>,
    reads: AtomicU64,
    streaming: Arc<AtomicBool>,
    load: Arc<LoadCounter>,
}

impl MockAttribute {
    /// Create an always-available attribute returning `value`
    pub fn new(name: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            name: name.into(),
            value,
            latency: LatencyProfile::default(),
            fail_after: None,
            reads: AtomicU64::new(0),
            streaming: Arc::new(AtomicBool::new(false)),
            load: Arc::new(LoadCounter::default()),
        }
    }

    /// Create an attribute with a value chosen from its name
    ///
    /// `.../State` attributes report `ON`, everything else a double.
    pub fn guess(name: impl Into<String>) -> Self {
        let name = name.into();
        let value = match name.rsplit('/').next() {
            Some(last) if last.eq_ignore_ascii_case("state") => {
                AttributeValue::State(DeviceState::On)
            }
            _ => AttributeValue::Double(0.0),
        };
        Self::new(name, value)
    }

    /// Set the latency profile
    pub fn with_latency(mut self, latency: LatencyProfile) -> Self {
        self.latency = latency;
        self
    }

    /// Fail every read after `reads` successful ones
    ///
    /// `failing_after(0)` makes the attribute unreachable from the first read.
    pub fn failing_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }

    /// Number of reads attempted so far, including failed ones
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttributeReader for MockAttribute {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self) -> Result<AttributeValue> {
        let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(limit) = self.fail_after {
            if n > limit {
                bail!("{}: device server not responding", self.name);
            }
        }

        self.load.enter();
        sleep(self.latency.sample(self.streaming.load(Ordering::SeqCst))).await;
        self.load.exit();
        Ok(self.value.clone())
    }
}

// =============================================================================
// MockCamera
// =============================================================================

struct Subscription {
    attribute: String,
    kind: EventKind,
    handler: EventHandler,
}

struct CameraRegisters {
    state: DeviceState,
    stream_bytes_per_second: i64,
    frame_rate_abs: f64,
    frame_rate_limit: f64,
    viewing_mode: i64,
    frame_task: Option<JoinHandle<()>>,
}

/// Simulated streaming camera
///
/// Simulates a camera with:
/// - `MOVING` state while acquiring
/// - Writable stream rate, frame rate and viewing mode
/// - A read-only frame rate limit
/// - Change events on `image8`, one per frame, while acquiring
///
/// Every configuration call is appended to a journal so tests can check the
/// order of operations.
pub struct MockCamera {
    name: String,
    resolution: (u32, u32),
    registers: Mutex<CameraRegisters>,
    subscriptions: Arc<Mutex<HashMap<i64, Subscription>>>,
    next_subscription: AtomicI64,
    frames: Arc<AtomicU64>,
    streaming: Arc<AtomicBool>,
    failing_command: Option<String>,
    journal: Mutex<Vec<String>>,
}

impl MockCamera {
    /// Create an idle camera with the given frame rate limit
    pub fn new(name: impl Into<String>, frame_rate_limit: f64) -> Self {
        Self {
            name: name.into(),
            resolution: (1936, 1216),
            registers: Mutex::new(CameraRegisters {
                state: DeviceState::On,
                stream_bytes_per_second: 115_000_000,
                frame_rate_abs: frame_rate_limit,
                frame_rate_limit,
                viewing_mode: 0,
                frame_task: None,
            }),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_subscription: AtomicI64::new(1),
            frames: Arc::new(AtomicU64::new(0)),
            streaming: Arc::new(AtomicBool::new(false)),
            failing_command: None,
            journal: Mutex::new(Vec::new()),
        }
    }

    /// Start in the given state
    pub fn with_state(mut self, state: DeviceState) -> Self {
        if state == DeviceState::Moving {
            self.streaming.store(true, Ordering::SeqCst);
        }
        self.registers.get_mut().state = state;
        self
    }

    /// Make the named command fail
    pub fn with_failing_command(mut self, command: impl Into<String>) -> Self {
        self.failing_command = Some(command.into());
        self
    }

    /// Flag raised while the camera is acquiring
    pub fn streaming_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.streaming)
    }

    /// Number of frames produced since creation
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Number of live event subscriptions
    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Configuration calls received so far, oldest first
    pub async fn journal(&self) -> Vec<String> {
        self.journal.lock().await.clone()
    }

    async fn record(&self, entry: String) {
        self.journal.lock().await.push(entry);
    }

    fn spawn_frames(&self, fps: f64) -> JoinHandle<()> {
        let period = Duration::from_secs_f64(1.0 / fps.max(0.001));
        let frames = Arc::clone(&self.frames);
        let subscriptions = Arc::clone(&self.subscriptions);
        let (width, height) = self.resolution;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                frames.fetch_add(1, Ordering::SeqCst);
                let handlers: Vec<(String, EventKind, EventHandler)> = subscriptions
                    .lock()
                    .await
                    .values()
                    .map(|s| (s.attribute.clone(), s.kind, Arc::clone(&s.handler)))
                    .collect();
                for (attribute, kind, handler) in handlers {
                    let event = Event {
                        attribute,
                        kind,
                        value: AttributeValue::Image { width, height },
                    };
                    handler(&event);
                }
            }
        })
    }
}

#[async_trait]
impl DeviceControl for MockCamera {
    fn name(&self) -> &str {
        &self.name
    }

    async fn state(&self) -> Result<DeviceState> {
        Ok(self.registers.lock().await.state)
    }

    async fn read_attribute(&self, name: &str) -> Result<AttributeValue> {
        let regs = self.registers.lock().await;
        let value = match name {
            "State" => AttributeValue::State(regs.state),
            PROP_STREAM_BYTES_PER_SECOND => AttributeValue::Long(regs.stream_bytes_per_second),
            PROP_FRAME_RATE_ABS => AttributeValue::Double(regs.frame_rate_abs),
            PROP_FRAME_RATE_LIMIT => AttributeValue::Double(regs.frame_rate_limit),
            PROP_VIEWING_MODE => AttributeValue::Long(regs.viewing_mode),
            "DeviceTemperature" => AttributeValue::Double(41.5),
            "image8" => AttributeValue::Image {
                width: self.resolution.0,
                height: self.resolution.1,
            },
            other => bail!("{}: unknown attribute {}", self.name, other),
        };
        Ok(value)
    }

    async fn write_attribute(&self, name: &str, value: AttributeValue) -> Result<()> {
        let number = value
            .as_f64()
            .ok_or_else(|| anyhow!("{}: {} expects a number, got {}", self.name, name, value))?;
        {
            let mut regs = self.registers.lock().await;
            match name {
                PROP_STREAM_BYTES_PER_SECOND => regs.stream_bytes_per_second = number as i64,
                PROP_FRAME_RATE_ABS => {
                    if number > regs.frame_rate_limit {
                        bail!(
                            "{}: frame rate {} above limit {}",
                            self.name,
                            number,
                            regs.frame_rate_limit
                        );
                    }
                    regs.frame_rate_abs = number;
                }
                PROP_VIEWING_MODE => regs.viewing_mode = number as i64,
                PROP_FRAME_RATE_LIMIT => bail!("{}: {} is read-only", self.name, name),
                other => bail!("{}: unknown attribute {}", self.name, other),
            }
        }
        self.record(format!("write {name}={value}")).await;
        Ok(())
    }

    async fn command(&self, name: &str) -> Result<()> {
        if self.failing_command.as_deref() == Some(name) {
            bail!("{}: command {} failed", self.name, name);
        }
        {
            let mut regs = self.registers.lock().await;
            match name {
                CMD_START_ACQUISITION => {
                    if regs.state == DeviceState::Moving {
                        bail!("{}: acquisition already running", self.name);
                    }
                    regs.state = DeviceState::Moving;
                    regs.frame_task = Some(self.spawn_frames(regs.frame_rate_abs));
                    self.streaming.store(true, Ordering::SeqCst);
                }
                CMD_STOP_ACQUISITION => {
                    if let Some(task) = regs.frame_task.take() {
                        task.abort();
                    }
                    regs.state = DeviceState::On;
                    self.streaming.store(false, Ordering::SeqCst);
                }
                other => bail!("{}: unknown command {}", self.name, other),
            }
        }
        self.record(format!("command {name}")).await;
        Ok(())
    }

    async fn subscribe_event(
        &self,
        attribute: &str,
        kind: EventKind,
        handler: EventHandler,
    ) -> Result<SubscriptionId> {
        let id = self.next_subscription.fetch_add(1, Ordering::SeqCst);
        self.subscriptions.lock().await.insert(
            id,
            Subscription {
                attribute: attribute.to_string(),
                kind,
                handler,
            },
        );
        self.record(format!("subscribe {attribute}")).await;
        Ok(SubscriptionId(id))
    }

    async fn unsubscribe_event(&self, id: SubscriptionId) -> Result<()> {
        if self.subscriptions.lock().await.remove(&id.0).is_none() {
            bail!("{}: no subscription with id {}", self.name, id);
        }
        self.record(format!("unsubscribe {id}")).await;
        Ok(())
    }
}

impl Drop for MockCamera {
    fn drop(&mut self) {
        if let Some(task) = self.registers.get_mut().frame_task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// MockBus
// =============================================================================

/// In-process control bus
///
/// Names that were never registered fail to resolve, like a device that is
/// not exported.
pub struct MockBus {
    attributes: HashMap<String, Arc<MockAttribute>>,
    devices: HashMap<String, Arc<dyn DeviceControl>>,
    streaming: Arc<AtomicBool>,
    load: Arc<LoadCounter>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
            devices: HashMap::new(),
            streaming: Arc::new(AtomicBool::new(false)),
            load: Arc::new(LoadCounter::default()),
        }
    }

    /// Build the bus used by the binary from the simulation settings
    ///
    /// Every name in `attributes` is registered with the configured latency,
    /// except those listed as unreachable. Names in `failing_after` fail after
    /// the configured number of reads.
    pub fn simulated(config: &SimulationConfig, camera_device: &str, attributes: &[String]) -> Self {
        let camera = Arc::new(MockCamera::new(camera_device, config.frame_rate_limit));
        let mut bus = MockBus::new().with_camera(camera);

        let latency = LatencyProfile {
            base: millis(config.base_latency_ms),
            jitter: millis(config.jitter_ms),
            streaming_penalty: millis(config.streaming_penalty_ms),
        };

        for name in attributes {
            if config.unreachable.iter().any(|u| u == name) {
                continue;
            }
            let mut attr = MockAttribute::guess(name.as_str()).with_latency(latency);
            if let Some(reads) = config.failing_after.get(name) {
                attr = attr.failing_after(*reads);
            }
            bus = bus.with_attribute(attr);
        }
        bus
    }

    /// Register an attribute, sharing the bus streaming flag and load counter
    pub fn with_attribute(mut self, mut attribute: MockAttribute) -> Self {
        attribute.streaming = Arc::clone(&self.streaming);
        attribute.load = Arc::clone(&self.load);
        self.attributes
            .insert(attribute.name.clone(), Arc::new(attribute));
        self
    }

    /// Register a camera and adopt its streaming flag
    ///
    /// Register the camera before any attribute so the attributes see its
    /// acquisition state.
    pub fn with_camera(mut self, camera: Arc<MockCamera>) -> Self {
        self.streaming = camera.streaming_flag();
        for attr in self.attributes.values_mut() {
            if let Some(attr) = Arc::get_mut(attr) {
                attr.streaming = Arc::clone(&self.streaming);
            }
        }
        self.devices.insert(camera.name().to_string(), camera);
        self
    }

    /// Register any other device
    pub fn with_device(mut self, device: Arc<dyn DeviceControl>) -> Self {
        self.devices.insert(device.name().to_string(), device);
        self
    }

    /// Registered attribute by name, for inspection in tests
    pub fn mock_attribute(&self, fqdn: &str) -> Option<Arc<MockAttribute>> {
        self.attributes.get(fqdn).cloned()
    }

    /// Highest number of simultaneous reads seen on this bus
    pub fn peak_concurrency(&self) -> usize {
        self.load.peak()
    }
}

/// Milliseconds from the config; values `validate()` rejects map to zero.
fn millis(ms: f64) -> Duration {
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or_default()
}

#[async_trait]
impl ControlBus for MockBus {
    async fn attribute(&self, fqdn: &str) -> Result<Arc<dyn AttributeReader>> {
        self.attributes
            .get(fqdn)
            .map(|a| Arc::clone(a) as Arc<dyn AttributeReader>)
            .ok_or_else(|| anyhow!("{fqdn}: device not exported"))
    }

    async fn device(&self, fqdn: &str) -> Result<Arc<dyn DeviceControl>> {
        self.devices
            .get(fqdn)
            .cloned()
            .ok_or_else(|| anyhow!("{fqdn}: device not exported"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unregistered_attribute_does_not_resolve() {
        let bus = MockBus::new();
        let err = bus.attribute("sys/tg_test/1/missing").await.err();
        assert!(err.is_some_and(|e| e.to_string().contains("not exported")));
    }

    #[tokio::test]
    async fn attribute_fails_after_configured_reads() {
        let attr = MockAttribute::new("a/b/c/d", AttributeValue::Long(3)).failing_after(2);
        assert_eq!(attr.read().await.unwrap(), AttributeValue::Long(3));
        assert!(attr.read().await.is_ok());
        assert!(attr.read().await.is_err());
        assert_eq!(attr.read_count(), 3);
    }

    #[test]
    fn guessed_value_depends_on_name() {
        let state = MockAttribute::guess("p04/motor/exp1_2.01/State");
        assert_eq!(state.value, AttributeValue::State(DeviceState::On));
        let pos = MockAttribute::guess("p04/motor/exp1_2.01/Position");
        assert_eq!(pos.value, AttributeValue::Double(0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_adds_latency() {
        let camera = Arc::new(MockCamera::new("cam", 10.0));
        let bus = MockBus::new().with_camera(Arc::clone(&camera)).with_attribute(
            MockAttribute::guess("dev/x/1/Position").with_latency(LatencyProfile {
                base: Duration::from_millis(2),
                jitter: Duration::ZERO,
                streaming_penalty: Duration::from_millis(8),
            }),
        );
        let attr = bus.attribute("dev/x/1/Position").await.unwrap();

        let t0 = tokio::time::Instant::now();
        attr.read().await.unwrap();
        let idle = t0.elapsed();
        assert!(idle >= Duration::from_millis(2) && idle < Duration::from_millis(3));

        camera.command(CMD_START_ACQUISITION).await.unwrap();
        let t1 = tokio::time::Instant::now();
        attr.read().await.unwrap();
        let busy = t1.elapsed();
        assert!(busy >= Duration::from_millis(10) && busy < Duration::from_millis(11));
        camera.command(CMD_STOP_ACQUISITION).await.unwrap();
    }

    #[test]
    fn unrepresentable_latency_maps_to_zero() {
        assert_eq!(millis(f64::INFINITY), Duration::ZERO);
        assert_eq!(millis(-2.0), Duration::ZERO);
        assert_eq!(millis(500.0), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn camera_rejects_frame_rate_above_limit() {
        let camera = MockCamera::new("cam", 5.0);
        assert!(camera
            .write_attribute(PROP_FRAME_RATE_ABS, AttributeValue::Double(6.0))
            .await
            .is_err());
        camera
            .write_attribute(PROP_FRAME_RATE_ABS, AttributeValue::Double(4.0))
            .await
            .unwrap();
        assert_eq!(
            camera.read_attribute(PROP_FRAME_RATE_ABS).await.unwrap(),
            AttributeValue::Double(4.0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn camera_delivers_image_events_while_acquiring() {
        let camera = MockCamera::new("cam", 10.0);
        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let handler: EventHandler = Arc::new(move |_event: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = camera
            .subscribe_event("image8", EventKind::Change, handler)
            .await
            .unwrap();

        camera.command(CMD_START_ACQUISITION).await.unwrap();
        assert_eq!(camera.state().await.unwrap(), DeviceState::Moving);
        sleep(Duration::from_millis(450)).await;
        camera.command(CMD_STOP_ACQUISITION).await.unwrap();
        camera.unsubscribe_event(id).await.unwrap();

        assert!(seen.load(Ordering::SeqCst) >= 4);
        assert_eq!(camera.subscription_count().await, 0);
        assert_eq!(camera.state().await.unwrap(), DeviceState::On);
    }
}
