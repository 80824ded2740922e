//! # Control-Bus Stress Test
//!
//! Measures how long attribute reads on a distributed control bus take while a
//! streaming camera loads the network. Every attribute in a list is polled by
//! its own task for a fixed time, and the per-read round-trip times are written
//! to a timestamped CSV file.
//!
//! ## Crate Structure
//!
//! - **`acquisition`**: Configures the camera, starts and stops acquisition, and
//!   provides a scoped run that always stops the camera.
//! - **`attributes`**: Built-in attribute lists.
//! - **`config`**: Layered configuration (defaults, TOML, environment) via `figment`.
//! - **`error`**: The `StressError` enum used across the crate.
//! - **`hardware`**: Capability traits for the bus and devices, plus the simulated bus.
//! - **`measurement`**: The attribute poller, the fan-out coordinator and the
//!   timing data model.
//! - **`storage`**: Writing and reading the timings file.
//! - **`tracing_setup`**: Subscriber initialisation for the binary.

pub mod acquisition;
pub mod attributes;
pub mod config;
pub mod error;
pub mod hardware;
pub mod measurement;
pub mod storage;
pub mod tracing_setup;

pub use error::{AppResult, StressError};
