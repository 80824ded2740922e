//! Custom error types for the stress test.
//!
//! `StressError` is the error type returned by the library's run-level
//! operations. Device and bus capability traits return `anyhow::Result`, and
//! those errors are wrapped here once they cross into the measurement or
//! acquisition layer.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while merging defaults, the TOML
//!   file and environment variables.
//! - **`Configuration`**: Semantic errors in an otherwise well-formed
//!   configuration (for example a negative poll interval).
//! - **`Io`** / **`Csv`**: Failures while writing or reading a timings file.
//! - **`Device`**: The camera could not be configured, started or stopped.
//! - **`WorkerFailed`**: A poller failed after its connectivity probe had
//!   succeeded. Under the abort policy this fails the whole run.
//! - **`WorkerPanicked`**: A poller task panicked or was cancelled.
//! - **`Format`**: A timings file did not have the expected layout.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, StressError>;

/// Errors produced by a stress-test run.
#[derive(Error, Debug)]
pub enum StressError {
    /// Configuration sources could not be merged or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration was parsed but holds invalid values.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV encoding or decoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The acquisition device rejected a configuration step or command.
    #[error("Device error on {device}: {source}")]
    Device {
        /// Device name as addressed on the bus
        device: String,
        /// Underlying driver error
        #[source]
        source: anyhow::Error,
    },

    /// A poller failed during its timed loop.
    #[error("Polling {attribute} failed after {samples} samples: {source}")]
    WorkerFailed {
        /// Attribute whose poller failed
        attribute: String,
        /// Samples recorded before the failure
        samples: usize,
        /// Underlying read error
        #[source]
        source: anyhow::Error,
    },

    /// A poller task panicked or was cancelled before returning.
    #[error("Poller task for {attribute} did not complete: {reason}")]
    WorkerPanicked {
        /// Attribute whose task was lost
        attribute: String,
        /// Join error description
        reason: String,
    },

    /// A timings file could not be parsed.
    #[error("Malformed timings file: {0}")]
    Format(String),
}

impl From<figment::Error> for StressError {
    fn from(value: figment::Error) -> Self {
        StressError::Config(Box::new(value))
    }
}

impl StressError {
    /// Wrap a driver error raised while talking to `device`.
    pub fn device(device: impl Into<String>, source: anyhow::Error) -> Self {
        StressError::Device {
            device: device.into(),
            source,
        }
    }
}
