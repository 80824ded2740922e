//! Camera acquisition control.
//!
//! Configures the streaming camera whose background load is the variable
//! under test, starts acquisition, and stops it again afterwards. The camera
//! is driven only through [`DeviceControl`], so any device exposing the same
//! attribute and command names works.
//!
//! # Example
//!
//! ```rust,ignore
//! let camera = bus.device("haspp04interm:10000/p04/tangovimba/MaxP04_cam").await?;
//! let settings = AcquisitionSettings::new(2.0, 6.0, true);
//! let table = with_acquisition(camera, &settings, async {
//!     coordinator::run(bus, &attributes, wait, total, &options).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::{AppResult, StressError};
use crate::hardware::capabilities::{
    AttributeValue, DeviceControl, DeviceState, Event, EventHandler, EventKind, SubscriptionId,
};

/// Writable stream bandwidth in bytes per second
pub const PROP_STREAM_BYTES_PER_SECOND: &str = "StreamBytesPerSecond";
/// Read-only highest frame rate for the current settings
pub const PROP_FRAME_RATE_LIMIT: &str = "AcquisitionFrameRateLimit";
/// Writable frame rate
pub const PROP_FRAME_RATE_ABS: &str = "AcquisitionFrameRateAbs";
/// Writable output image type
pub const PROP_VIEWING_MODE: &str = "ViewingMode";
/// Command starting continuous acquisition
pub const CMD_START_ACQUISITION: &str = "StartAcquisition";
/// Command stopping acquisition
pub const CMD_STOP_ACQUISITION: &str = "StopAcquisition";

/// Viewing mode selected before every run.
pub const DEFAULT_VIEWING_MODE: i64 = 1;
/// Image attribute whose change events are subscribed.
pub const DEFAULT_IMAGE_ATTRIBUTE: &str = "image8";

/// Settings applied to the camera before acquisition starts.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Requested frame rate; clamped to the device limit
    pub fps: f64,
    /// Stream bandwidth in bytes per second
    pub stream_bytes_per_second: i64,
    /// Subscribe a no-op handler to image change events
    pub subscribe: bool,
    /// Viewing mode written before starting
    pub viewing_mode: i64,
    /// Attribute carrying the image
    pub image_attribute: String,
}

impl AcquisitionSettings {
    /// Settings from a frame rate and a bandwidth in megabytes per second
    pub fn new(fps: f64, stream_mb: f64, subscribe: bool) -> Self {
        Self {
            fps,
            stream_bytes_per_second: megabytes_to_bytes(stream_mb),
            subscribe,
            viewing_mode: DEFAULT_VIEWING_MODE,
            image_attribute: DEFAULT_IMAGE_ATTRIBUTE.to_string(),
        }
    }
}

/// Convert MB/s to bytes/s, truncating.
pub fn megabytes_to_bytes(stream_mb: f64) -> i64 {
    (1e6 * stream_mb) as i64
}

/// Handler for image events. Subscribing is only there to generate load, so
/// the payload is dropped.
fn image_handler() -> EventHandler {
    Arc::new(|_event: &Event| {})
}

/// A camera that is acquiring, plus its event subscription if one was made.
pub struct AcquisitionSession {
    device: Arc<dyn DeviceControl>,
    subscription: Option<SubscriptionId>,
    effective_fps: f64,
}

impl AcquisitionSession {
    /// Subscription identifier, `None` when not subscribed
    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.subscription
    }

    /// Frame rate actually written to the device
    pub fn effective_fps(&self) -> f64 {
        self.effective_fps
    }

    /// Unsubscribe (if subscribed) and stop acquisition.
    pub async fn stop(self) -> AppResult<()> {
        let name = self.device.name().to_string();
        if let Some(id) = self.subscription {
            self.device
                .unsubscribe_event(id)
                .await
                .map_err(|e| StressError::device(&name, e))?;
            info!(device = %name, event_id = %id, "Unsubscribing with event_id={}", id);
        }
        self.device
            .command(CMD_STOP_ACQUISITION)
            .await
            .map_err(|e| StressError::device(&name, e))?;
        info!(device = %name, "Stop acquisition.");
        Ok(())
    }
}

/// Configure the camera and start acquisition.
///
/// A camera that is already acquiring is stopped first. The requested frame
/// rate is clamped to `AcquisitionFrameRateLimit`, which is read after the
/// stream bandwidth has been set since the limit depends on it.
///
/// # Errors
/// Any rejected write or command is returned as [`StressError::Device`].
/// Acquisition is not started in that case.
pub async fn start(
    device: Arc<dyn DeviceControl>,
    settings: &AcquisitionSettings,
) -> AppResult<AcquisitionSession> {
    let name = device.name().to_string();
    let dev_err = |e| StressError::device(&name, e);

    if device.state().await.map_err(dev_err)? == DeviceState::Moving {
        warn!(device = %name, "Camera {} already running. Stopping it now.", name);
        device
            .command(CMD_STOP_ACQUISITION)
            .await
            .map_err(dev_err)?;
    }

    info!(device = %name, "Configuring camera {}", name);
    device
        .write_attribute(
            PROP_STREAM_BYTES_PER_SECOND,
            AttributeValue::Long(settings.stream_bytes_per_second),
        )
        .await
        .map_err(dev_err)?;

    let limit = device
        .read_attribute(PROP_FRAME_RATE_LIMIT)
        .await
        .map_err(dev_err)?;
    let fps_max = limit.as_f64().ok_or_else(|| {
        StressError::device(
            &name,
            anyhow::anyhow!("{PROP_FRAME_RATE_LIMIT} is not numeric: {limit}"),
        )
    })?;
    info!(device = %name, "Max. frame rate: {:.2}", fps_max);

    let fps = settings.fps.min(fps_max);
    device
        .write_attribute(PROP_FRAME_RATE_ABS, AttributeValue::Double(fps))
        .await
        .map_err(dev_err)?;
    info!(
        device = %name,
        "stream rate: {}, frame rate: {}", settings.stream_bytes_per_second, fps
    );

    device
        .write_attribute(PROP_VIEWING_MODE, AttributeValue::Long(settings.viewing_mode))
        .await
        .map_err(dev_err)?;

    let subscription = if settings.subscribe {
        let id = device
            .subscribe_event(&settings.image_attribute, EventKind::Change, image_handler())
            .await
            .map_err(dev_err)?;
        info!(
            device = %name,
            event_id = %id,
            "Subscribing to {} change event. event_id={}", settings.image_attribute, id
        );
        Some(id)
    } else {
        info!(device = %name, "Not subscribing to image change event.");
        None
    };

    if let Err(e) = device.command(CMD_START_ACQUISITION).await {
        if let Some(id) = subscription {
            if let Err(cleanup) = device.unsubscribe_event(id).await {
                warn!(device = %name, error = %cleanup, "Failed to drop subscription {}", id);
            }
        }
        return Err(StressError::device(&name, e));
    }
    info!(device = %name, "Start acquisition.");

    Ok(AcquisitionSession {
        device,
        subscription,
        effective_fps: fps,
    })
}

/// Run `work` while the camera is acquiring, stopping it afterwards in every case.
///
/// When `work` fails, its error is returned and a failure to stop is only
/// logged. When `work` succeeds, a failure to stop is returned.
pub async fn with_acquisition<F, T>(
    device: Arc<dyn DeviceControl>,
    settings: &AcquisitionSettings,
    work: F,
) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let session = start(device, settings).await?;
    let outcome = work.await;
    let stopped = session.stop().await;

    match (outcome, stopped) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(stop_err)) => Err(stop_err),
        (Err(work_err), Ok(())) => Err(work_err),
        (Err(work_err), Err(stop_err)) => {
            warn!(error = %stop_err, "Camera could not be stopped after failed run");
            Err(work_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockCamera;

    fn camera(limit: f64) -> Arc<MockCamera> {
        Arc::new(MockCamera::new("p04/tangovimba/cam", limit))
    }

    #[test]
    fn bandwidth_converts_to_bytes() {
        assert_eq!(megabytes_to_bytes(1.5), 1_500_000);
        assert_eq!(megabytes_to_bytes(6.0), 6_000_000);
        assert_eq!(megabytes_to_bytes(0.0), 0);
    }

    #[tokio::test]
    async fn start_clamps_frame_rate_to_limit() {
        let cam = camera(12.5);
        let session = start(cam.clone(), &AcquisitionSettings::new(30.0, 1.5, false))
            .await
            .unwrap();
        assert_eq!(session.effective_fps(), 12.5);
        assert_eq!(
            cam.read_attribute(PROP_FRAME_RATE_ABS).await.unwrap(),
            AttributeValue::Double(12.5)
        );
        assert_eq!(
            cam.read_attribute(PROP_STREAM_BYTES_PER_SECOND).await.unwrap(),
            AttributeValue::Long(1_500_000)
        );
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_configures_in_order_and_starts_last() {
        let cam = camera(20.0);
        let session = start(cam.clone(), &AcquisitionSettings::new(2.0, 6.0, true))
            .await
            .unwrap();
        assert!(session.subscription().is_some());
        assert_eq!(cam.state().await.unwrap(), DeviceState::Moving);

        let journal = cam.journal().await;
        assert_eq!(
            journal,
            vec![
                "write StreamBytesPerSecond=6000000".to_string(),
                "write AcquisitionFrameRateAbs=2".to_string(),
                "write ViewingMode=1".to_string(),
                "subscribe image8".to_string(),
                "command StartAcquisition".to_string(),
            ]
        );
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn running_camera_is_stopped_before_reconfiguring() {
        let cam = Arc::new(MockCamera::new("cam", 10.0).with_state(DeviceState::Moving));
        let session = start(cam.clone(), &AcquisitionSettings::new(2.0, 1.0, false))
            .await
            .unwrap();
        let journal = cam.journal().await;
        assert_eq!(journal.first().map(String::as_str), Some("command StopAcquisition"));
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_unsubscribes_before_stopping() {
        let cam = camera(10.0);
        let session = start(cam.clone(), &AcquisitionSettings::new(2.0, 1.0, true))
            .await
            .unwrap();
        let id = session.subscription().unwrap();
        session.stop().await.unwrap();

        let journal = cam.journal().await;
        let tail: Vec<&str> = journal.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(
            tail,
            vec![format!("unsubscribe {id}").as_str(), "command StopAcquisition"]
        );
        assert_eq!(cam.subscription_count().await, 0);
        assert_eq!(cam.state().await.unwrap(), DeviceState::On);
    }

    #[tokio::test]
    async fn no_subscription_when_not_requested() {
        let cam = camera(10.0);
        let session = start(cam.clone(), &AcquisitionSettings::new(2.0, 1.0, false))
            .await
            .unwrap();
        assert!(session.subscription().is_none());
        assert_eq!(cam.subscription_count().await, 0);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_start_command_surfaces_and_drops_subscription() {
        let cam = Arc::new(MockCamera::new("cam", 10.0).with_failing_command(CMD_START_ACQUISITION));
        let result = start(cam.clone(), &AcquisitionSettings::new(2.0, 1.0, true)).await;
        assert!(matches!(result, Err(StressError::Device { .. })));
        assert_eq!(cam.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn scoped_acquisition_stops_after_failed_work() {
        let cam = camera(10.0);
        let result: AppResult<()> = with_acquisition(
            cam.clone(),
            &AcquisitionSettings::new(2.0, 1.0, true),
            async { Err(StressError::Format("poll failed".into())) },
        )
        .await;

        assert!(matches!(result, Err(StressError::Format(_))));
        assert_eq!(cam.state().await.unwrap(), DeviceState::On);
        assert_eq!(cam.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn scoped_acquisition_returns_work_value() {
        let cam = camera(10.0);
        let value = with_acquisition(
            cam.clone(),
            &AcquisitionSettings::new(2.0, 1.0, false),
            async { Ok(42) },
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(cam.state().await.unwrap(), DeviceState::On);
    }
}
