//! CLI entry point for the control-bus stress test
//!
//! Starts the camera, polls every attribute concurrently, stops the camera and
//! writes the timings to `timings_<YYYYMMDD_HHMMSS>.csv`.
//!
//! # Usage
//!
//! ```bash
//! stresstest --fps 10 --stream-mb 20 --wait 0.5 --total-time 60
//! stresstest --preset tg-test --no-subscribe --total-time 5
//! STRESSTEST_RUN__MAX_WORKERS=8 stresstest --config config/stresstest.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use rust_stresstest::acquisition::with_acquisition;
use rust_stresstest::attributes::AttributePreset;
use rust_stresstest::config::StressConfig;
use rust_stresstest::hardware::capabilities::ControlBus;
use rust_stresstest::hardware::mock::MockBus;
use rust_stresstest::measurement::{self, WorkerErrorPolicy};
use rust_stresstest::{storage, tracing_setup};

#[derive(Parser, Debug)]
#[command(name = "stresstest")]
#[command(about = "Control-bus attribute latency under camera streaming load", long_about = None)]
struct Cli {
    /// Target frame rate, clamped to the camera limit [default: 2.0]
    #[arg(long)]
    fps: Option<f64>,

    /// Stream bandwidth in MB/s [default: 6.0]
    #[arg(long = "stream-mb")]
    stream_mb: Option<f64>,

    /// Subscribe to image change events (default)
    #[arg(long, overrides_with = "no_subscribe")]
    subscribe: bool,

    /// Do not subscribe to image change events
    #[arg(long = "no-subscribe", overrides_with = "subscribe")]
    no_subscribe: bool,

    /// Pause between polls in seconds [default: 1.0]
    #[arg(long)]
    wait: Option<f64>,

    /// Total polling time in seconds [default: 30.0]
    #[arg(long = "total-time")]
    total_time: Option<f64>,

    /// Built-in attribute list
    #[arg(long, value_enum)]
    preset: Option<AttributePreset>,

    /// Attribute to poll; repeat to build a list replacing the preset
    #[arg(long = "attribute", value_name = "FQDN")]
    attributes: Vec<String>,

    /// Camera device name
    #[arg(long)]
    camera: Option<String>,

    /// Maximum number of attributes polled at once [default: all]
    #[arg(long = "max-workers")]
    max_workers: Option<usize>,

    /// Handling of a poller failing mid-run [default: abort]
    #[arg(long = "on-worker-error", value_enum)]
    on_worker_error: Option<WorkerErrorPolicy>,

    /// Directory receiving the results file [default: .]
    #[arg(long = "output-dir")]
    output_dir: Option<PathBuf>,

    /// TOML configuration file [default: config/stresstest.toml]
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long = "log-format")]
    log_format: Option<String>,
}

impl Cli {
    /// Apply command-line values on top of the loaded configuration
    fn apply(self, config: &mut StressConfig) {
        if let Some(fps) = self.fps {
            config.run.fps = fps;
        }
        if let Some(stream_mb) = self.stream_mb {
            config.run.stream_mb = stream_mb;
        }
        if self.no_subscribe {
            config.run.subscribe = false;
        } else if self.subscribe {
            config.run.subscribe = true;
        }
        if let Some(wait) = self.wait {
            config.run.wait_s = wait;
        }
        if let Some(total) = self.total_time {
            config.run.total_time_s = total;
        }
        if let Some(preset) = self.preset {
            config.attributes.preset = preset;
            config.attributes.list.clear();
        }
        if !self.attributes.is_empty() {
            config.attributes.list = self.attributes;
        }
        if let Some(camera) = self.camera {
            config.camera.device = camera;
        }
        if self.max_workers.is_some() {
            config.run.max_workers = self.max_workers;
        }
        if let Some(policy) = self.on_worker_error {
            config.run.on_worker_error = policy;
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = dir;
        }
        if let Some(level) = self.log_level {
            config.application.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.application.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config =
        StressConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    cli.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    tracing_setup::init_from_config(&config).context("Failed to initialise logging")?;

    let attributes = config.attribute_list();
    info!(
        camera = %config.camera.device,
        attributes = attributes.len(),
        "Starting {}",
        config.application.name
    );

    let bus: Arc<dyn ControlBus> = Arc::new(MockBus::simulated(
        &config.simulation,
        &config.camera.device,
        &attributes,
    ));
    let camera = bus
        .device(&config.camera.device)
        .await
        .with_context(|| format!("Cannot reach camera {}", config.camera.device))?;

    let table = with_acquisition(
        camera,
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
    .context("Stress run failed")?;

    storage::save_timestamped(&config.output.dir, &table, &config.run_parameters())
        .context("Failed to write timings")?;

    Ok(())
}
