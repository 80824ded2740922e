//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the values the stress test was tuned with)
//! 2. An optional TOML file (`config/stresstest.toml` unless given explicitly)
//! 3. Environment variables prefixed with `STRESSTEST_`, nested keys separated by `__`
//! 4. Command-line flags, applied by the binary
//!
//! # Example
//! ```no_run
//! use rust_stresstest::config::StressConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // STRESSTEST_RUN__TOTAL_TIME_S=60 overrides run.total_time_s
//! let config = StressConfig::load(None)?;
//! config.validate()?;
//! println!("Polling {} attributes", config.attribute_list().len());
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tokio::time::Duration;

use crate::acquisition::{AcquisitionSettings, DEFAULT_IMAGE_ATTRIBUTE, DEFAULT_VIEWING_MODE};
use crate::attributes::{AttributePreset, DEFAULT_CAMERA};
use crate::error::{AppResult, StressError};
use crate::measurement::{PollOptions, RunParameters, WorkerErrorPolicy};

/// Config file read when no path is given
pub const DEFAULT_CONFIG_PATH: &str = "config/stresstest.toml";
/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "STRESSTEST_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StressConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Camera under test
    pub camera: CameraConfig,
    /// Polling and acquisition parameters
    pub run: RunConfig,
    /// Attributes to poll
    pub attributes: AttributesConfig,
    /// Results file location
    pub output: OutputConfig,
    /// Simulated bus behaviour
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "stresstest".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Fully qualified device name
    pub device: String,
    /// Attribute whose change events are subscribed
    pub image_attribute: String,
    /// Viewing mode written before acquisition
    pub viewing_mode: i64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: DEFAULT_CAMERA.to_string(),
            image_attribute: DEFAULT_IMAGE_ATTRIBUTE.to_string(),
            viewing_mode: DEFAULT_VIEWING_MODE,
        }
    }
}

/// Run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Requested frame rate
    pub fps: f64,
    /// Stream bandwidth in MB/s
    pub stream_mb: f64,
    /// Subscribe to image change events
    pub subscribe: bool,
    /// Pause between polls in seconds
    pub wait_s: f64,
    /// Total polling time in seconds
    pub total_time_s: f64,
    /// Limit on simultaneously polled attributes
    pub max_workers: Option<usize>,
    /// Handling of mid-run poller failures
    pub on_worker_error: WorkerErrorPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            fps: 2.0,
            stream_mb: 6.0,
            subscribe: true,
            wait_s: 1.0,
            total_time_s: 30.0,
            max_workers: None,
            on_worker_error: WorkerErrorPolicy::Abort,
        }
    }
}

/// Attribute selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AttributesConfig {
    /// Built-in list used when `list` is empty
    pub preset: AttributePreset,
    /// Explicit attribute names; replaces the preset when non-empty
    pub list: Vec<String>,
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving `timings_*.csv`
    pub dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
        }
    }
}

/// Simulated bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Latency of every read in milliseconds
    pub base_latency_ms: f64,
    /// Maximum random extra latency in milliseconds
    pub jitter_ms: f64,
    /// Extra latency while the camera streams, in milliseconds
    pub streaming_penalty_ms: f64,
    /// Frame rate limit reported by the simulated camera
    pub frame_rate_limit: f64,
    /// Attributes that cannot be reached
    pub unreachable: Vec<String>,
    /// Attributes failing after the given number of reads
    pub failing_after: HashMap<String, u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 0.5,
            jitter_ms: 0.5,
            streaming_penalty_ms: 2.0,
            frame_rate_limit: 17.5,
            unreachable: Vec::new(),
            failing_after: HashMap::new(),
        }
    }
}

impl StressConfig {
    /// Figment with defaults, the TOML file at `path` and environment overrides
    ///
    /// A missing file contributes nothing.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(StressConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load configuration from `path`, or from [`DEFAULT_CONFIG_PATH`]
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        Ok(Self::figment(path).extract()?)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(StressError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.camera.device.trim().is_empty() {
            return invalid("camera.device must not be empty".to_string());
        }

        let run = &self.run;
        if !(run.fps.is_finite() && run.fps > 0.0) {
            return invalid(format!("run.fps must be positive, got {}", run.fps));
        }
        if !(run.stream_mb.is_finite() && run.stream_mb >= 0.0) {
            return invalid(format!(
                "run.stream_mb must not be negative, got {}",
                run.stream_mb
            ));
        }
        check_seconds("run.wait_s", run.wait_s)?;
        check_seconds("run.total_time_s", run.total_time_s)?;
        if run.max_workers == Some(0) {
            return invalid("run.max_workers must be at least 1".to_string());
        }

        if self.attribute_list().is_empty() {
            return invalid("No attributes to poll".to_string());
        }

        let sim = &self.simulation;
        check_seconds("simulation.base_latency_ms", sim.base_latency_ms / 1000.0)?;
        check_seconds("simulation.jitter_ms", sim.jitter_ms / 1000.0)?;
        check_seconds(
            "simulation.streaming_penalty_ms",
            sim.streaming_penalty_ms / 1000.0,
        )?;
        if !(sim.frame_rate_limit.is_finite() && sim.frame_rate_limit > 0.0) {
            return invalid(format!(
                "simulation.frame_rate_limit must be positive, got {}",
                sim.frame_rate_limit
            ));
        }

        Ok(())
    }

    /// Attributes to poll, in column order
    pub fn attribute_list(&self) -> Vec<String> {
        if self.attributes.list.is_empty() {
            self.attributes.preset.attributes()
        } else {
            self.attributes.list.clone()
        }
    }

    /// Pause between polls
    ///
    /// Values rejected by [`StressConfig::validate`] map to zero.
    pub fn poll_wait(&self) -> Duration {
        Duration::try_from_secs_f64(self.run.wait_s).unwrap_or_default()
    }

    /// Total polling time
    ///
    /// Values rejected by [`StressConfig::validate`] map to zero.
    pub fn poll_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.run.total_time_s).unwrap_or_default()
    }

    /// Coordinator options
    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            max_workers: self.run.max_workers,
            on_error: self.run.on_worker_error,
        }
    }

    /// Camera settings for this run
    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            image_attribute: self.camera.image_attribute.clone(),
            viewing_mode: self.camera.viewing_mode,
            ..AcquisitionSettings::new(self.run.fps, self.run.stream_mb, self.run.subscribe)
        }
    }

    /// Header values for the results file
    pub fn run_parameters(&self) -> RunParameters {
        RunParameters {
            fps: self.run.fps,
            stream_mb: self.run.stream_mb,
            subscribe: self.run.subscribe,
            wait_s: self.run.wait_s,
            total_time_s: self.run.total_time_s,
        }
    }
}

/// Reject `seconds` unless it is a representable, non-negative duration.
fn check_seconds(key: &str, seconds: f64) -> AppResult<()> {
    Duration::try_from_secs_f64(seconds)
        .map(|_| ())
        .map_err(|e| {
            StressError::Configuration(format!(
                "{} must be a non-negative duration, got {}: {}",
                key, seconds, e
            ))
        })
}
