//! Fan-out coordinator: one poller task per attribute, joined into one table.

use std::sync::Arc;

use clap::ValueEnum;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{AppResult, StressError};
use crate::hardware::capabilities::ControlBus;
use crate::measurement::poller::{poll_attribute, PollFailure};
use crate::measurement::{TimingSeries, TimingTable};

/// What to do when a poller fails after its probe succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WorkerErrorPolicy {
    /// Fail the whole run; no table is produced
    #[default]
    Abort,
    /// Keep the samples recorded before the failure and carry on
    Truncate,
}

/// Options for [`run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollOptions {
    /// Maximum number of attributes polled at once; `None` polls all at once
    pub max_workers: Option<usize>,
    /// Handling of mid-run poller failures
    pub on_error: WorkerErrorPolicy,
}

/// Poll every attribute concurrently and collect the timings.
///
/// One task is spawned per attribute, all with the same `wait` and `total`.
/// The call returns only after every task has finished. The table lists the
/// attributes in input order regardless of completion order.
///
/// # Errors
/// - [`StressError::WorkerFailed`] if a poller failed mid-run and the policy is
///   [`WorkerErrorPolicy::Abort`]
/// - [`StressError::WorkerPanicked`] if a poller task panicked
///
/// The first error in input order is returned. Every failure is logged.
pub async fn run(
    bus: Arc<dyn ControlBus>,
    attributes: &[String],
    wait: Duration,
    total: Duration,
    options: &PollOptions,
) -> AppResult<TimingTable> {
    let limiter = options
        .max_workers
        .map(|n| Arc::new(Semaphore::new(n.max(1))));

    info!(
        attributes = attributes.len(),
        max_workers = ?options.max_workers,
        "Polling {} attributes every {} s for {} s",
        attributes.len(),
        wait.as_secs_f64(),
        total.as_secs_f64()
    );

    let handles: Vec<_> = attributes
        .iter()
        .map(|fqdn| {
            let bus = Arc::clone(&bus);
            let limiter = limiter.clone();
            let fqdn = fqdn.clone();
            let span = info_span!("poll", attribute = %fqdn);
            tokio::spawn(
                async move {
                    let _permit = match limiter {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    poll_attribute(bus.as_ref(), &fqdn, wait, total).await
                }
                .instrument(span),
            )
        })
        .collect();

    let results = join_all(handles).await;

    let mut table = TimingTable::with_capacity(attributes.len());
    let mut first_error: Option<StressError> = None;
    for (fqdn, joined) in attributes.iter().zip(results) {
        let outcome: Result<TimingSeries, PollFailure> = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => {
                error!(attribute = %fqdn, "Poller task lost: {}", join_err);
                first_error.get_or_insert(StressError::WorkerPanicked {
                    attribute: fqdn.clone(),
                    reason: join_err.to_string(),
                });
                continue;
            }
        };

        match (outcome, options.on_error) {
            (Ok(series), _) => table.insert(fqdn.clone(), series),
            (Err(failure), WorkerErrorPolicy::Truncate) => {
                warn!(
                    attribute = %fqdn,
                    samples = failure.samples.len(),
                    "Keeping truncated series: {}", failure
                );
                table.insert(fqdn.clone(), failure.samples);
            }
            (Err(failure), WorkerErrorPolicy::Abort) => {
                first_error.get_or_insert(failure.into());
            }
        }
    }

    match first_error {
        Some(err) => Err(err),
        None => Ok(table),
    }
}
