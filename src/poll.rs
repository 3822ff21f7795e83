//! Bounded polling with a fixed interval and an overall deadline.
//!
//! Every wait in the suite goes through [`Poller`]: a check is run
//! immediately, then every `interval` until it reports done, fails, or the
//! deadline elapses. Time is read from `tokio::time` so tests can run under a
//! paused clock.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Short poll interval for API-only conditions
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default deadline for API-only conditions
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Deadline used after host outages while workloads reschedule
pub const POLL_TIMEOUT_SIX_MIN: Duration = Duration::from_secs(6 * 60);
/// Interval used by bulk StatefulSet waits
pub const STATEFULSET_POLL: Duration = Duration::from_secs(10);
/// Deadline for many StatefulSets with many volumes to converge
pub const STATEFULSET_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Deadline for bulk claim/volume cleanup
pub const STATEFUL_POD_TIMEOUT: Duration = Duration::from_secs(80 * 60);
/// Deadline for hypervisor host power transitions
pub const HOST_POWER_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Configuration for a single polling operation
#[derive(Clone, Debug)]
pub struct Poller {
    pub description: String,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Poller {
    /// Create a poller with an explicit interval and deadline
    pub fn new(description: impl Into<String>, interval: Duration, timeout: Duration) -> Self {
        Self {
            description: description.into(),
            interval,
            timeout,
        }
    }

    /// Poller with the default API interval and deadline
    pub fn api(description: impl Into<String>) -> Self {
        Self::new(description, POLL_INTERVAL, POLL_TIMEOUT)
    }

    /// Same interval and deadline, different description
    pub fn describe(&self, description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..self.clone()
        }
    }

    /// Same interval and description, different deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Poll until `check` returns `Ok(true)`.
    ///
    /// The first check runs immediately and no check runs after success.
    /// Retryable errors (see [`Error::is_retryable`]) are logged and retried;
    /// any other error is terminal and returned unchanged.
    pub async fn poll_immediate<F, Fut>(&self, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll_value(|| {
            let fut = check();
            async move { Ok(fut.await?.then_some(())) }
        })
        .await
    }

    /// Poll until `check` produces a value.
    ///
    /// - `Ok(Some(v))`: done, returns `v`
    /// - `Ok(None)`: not yet, keep polling
    /// - `Err(e)`: retried while `e.is_retryable()`, otherwise returned
    pub async fn poll_value<F, Fut, T>(&self, check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.run(check, Error::is_retryable).await
    }

    /// Poll until `check` returns `Ok(true)`, treating every error as
    /// transient.
    ///
    /// Errors are logged and retried; only the deadline ends the loop. The
    /// last error seen is included in the timeout message.
    pub async fn poll_ignoring_errors<F, Fut>(&self, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll_value_ignoring_errors(|| {
            let fut = check();
            async move { Ok(fut.await?.then_some(())) }
        })
        .await
    }

    /// [`Poller::poll_value`] with every error treated as transient
    pub async fn poll_value_ignoring_errors<F, Fut, T>(&self, check: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        self.run(check, |_| true).await
    }

    async fn run<F, Fut, T>(&self, mut check: F, retry: impl Fn(&Error) -> bool) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0u32;
        let mut last_error: Option<String> = None;

        loop {
            attempt += 1;
            match check().await {
                Ok(Some(value)) => {
                    debug!(description = %self.description, attempt, "Condition met");
                    return Ok(value);
                }
                Ok(None) => {
                    debug!(description = %self.description, attempt, "Condition not met yet");
                }
                Err(e) if retry(&e) => {
                    warn!(description = %self.description, attempt, error = %e, "Check failed, retrying");
                    last_error = Some(e.to_string());
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timeout_error(last_error));
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }

    fn timeout_error(&self, last_error: Option<String>) -> Error {
        let description = match last_error {
            Some(e) => format!("{} (last error: {})", self.description, e),
            None => self.description.clone(),
        };
        Error::Timeout {
            description,
            timeout: self.timeout,
        }
    }
}
