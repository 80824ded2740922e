//! Single-attribute poller.

use anyhow::Context;
use thiserror::Error;
use tokio::time::{sleep, Duration, Instant};
use tracing::{error, info};

use crate::error::StressError;
use crate::hardware::capabilities::ControlBus;
use crate::measurement::TimingSeries;

/// A read failed after the connectivity probe had succeeded.
#[derive(Error, Debug)]
#[error("{attribute}: read failed after {} samples: {source:#}", .samples.len())]
pub struct PollFailure {
    /// Attribute being polled
    pub attribute: String,
    /// Samples recorded before the failure
    pub samples: TimingSeries,
    /// Read error
    #[source]
    pub source: anyhow::Error,
}

impl From<PollFailure> for StressError {
    fn from(failure: PollFailure) -> Self {
        StressError::WorkerFailed {
            attribute: failure.attribute,
            samples: failure.samples.len(),
            source: failure.source,
        }
    }
}

/// Repeatedly read `fqdn` and return the access times in milliseconds.
///
/// One untimed probe read comes first. If the attribute cannot be resolved or
/// the probe read fails, the error is logged and an empty series is returned.
///
/// After that, reads are timed until `total` has elapsed since the first timed
/// read, pausing `wait` between reads. The duration is checked after each read,
/// so at least one sample is recorded and the last read may start up to `wait`
/// before the deadline.
///
/// # Errors
/// A failing timed read ends polling with [`PollFailure`], which keeps the
/// samples recorded so far.
pub async fn poll_attribute(
    bus: &dyn ControlBus,
    fqdn: &str,
    wait: Duration,
    total: Duration,
) -> Result<TimingSeries, PollFailure> {
    let probe = async {
        let attr = bus.attribute(fqdn).await?;
        attr.read().await.context("probe read")?;
        anyhow::Ok(attr)
    };
    let attr = match probe.await {
        Ok(attr) => attr,
        Err(e) => {
            error!(attribute = %fqdn, "{}: {:#}", fqdn, e);
            return Ok(TimingSeries::new());
        }
    };

    info!(attribute = %fqdn, "Start polling {} for {} s.", fqdn, total.as_secs_f64());
    let mut samples = TimingSeries::new();
    let started = Instant::now();
    loop {
        let t0 = Instant::now();
        if let Err(source) = attr.read().await {
            error!(attribute = %fqdn, samples = samples.len(), "{}: {:#}", fqdn, source);
            return Err(PollFailure {
                attribute: fqdn.to_string(),
                samples,
                source,
            });
        }
        samples.push(t0.elapsed().as_secs_f64() * 1000.0);

        if started.elapsed() >= total {
            break;
        }
        sleep(wait).await;
    }
    info!(attribute = %fqdn, samples = samples.len(), "Finished polling {}", fqdn);
    Ok(samples)
}
