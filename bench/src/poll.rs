//! Interval polling with optional backoff and an optional deadline.

use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("timed out after {elapsed:?} waiting for {what} ({attempts} probes)")]
    TimedOut {
        what: String,
        elapsed: Duration,
        attempts: u64,
    },
}

/// Outcome of a probe that did not yield a value.
#[derive(Debug)]
enum Pending {
    NotReady,
    Failed(anyhow::Error),
}

/// Repeats a probe until it reports readiness.
///
/// The delay starts at `initial`, is multiplied by `multiplier` after every
/// unsuccessful probe and never exceeds `max`. With `timeout = None` the
/// poller waits forever.
#[derive(Debug, Clone)]
pub struct Poller {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub timeout: Option<Duration>,
}

impl Poller {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial: interval,
            max: interval,
            multiplier: 1.0,
            timeout: None,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64, max: Duration) -> Self {
        self.multiplier = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
        self.max = max.max(self.initial);
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Backoff policy between probes. Unbounded; the deadline is enforced in [`Poller::until`].
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial)
            .with_max_delay(self.max)
            .with_factor(self.multiplier as f32)
            .without_max_times()
    }

    /// Run `probe` until it yields `Some`. Probe errors are logged and treated
    /// as "not ready yet".
    pub async fn until<T, F, Fut>(&self, what: &str, mut probe: F) -> Result<T, PollError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<T>>>,
    {
        let started = Instant::now();
        let attempts = AtomicU64::new(0);

        let polling = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let outcome = probe();
            async move {
                match outcome.await {
                    Ok(Some(value)) => Ok(value),
                    Ok(None) => Err(Pending::NotReady),
                    Err(e) => Err(Pending::Failed(e)),
                }
            }
        })
        .retry(self.backoff())
        .notify(|pending: &Pending, delay: Duration| match pending {
            Pending::NotReady => debug!(what, ?delay, "condition not reached yet"),
            Pending::Failed(e) => warn!(what, ?delay, error = %e, "probe failed"),
        });

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, polling).await.ok(),
            None => Some(polling.await),
        };

        let attempts = attempts.load(Ordering::Relaxed);
        match outcome {
            Some(Ok(value)) => {
                debug!(what, attempts, elapsed = ?started.elapsed(), "condition reached");
                Ok(value)
            }
            // The policy has no attempt limit, so only the deadline ends polling.
            _ => Err(PollError::TimedOut {
                what: what.to_string(),
                elapsed: started.elapsed(),
                attempts,
            }),
        }
    }
}
