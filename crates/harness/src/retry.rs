//! Bounded fixed-interval retry
//!
//! Shared by lock acquisition, readiness polling and account creation.

use std::future::Future;
use std::time::Duration;
use tracing::trace;

use crate::error::{Error, Result};

/// Outcome of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// Finished with a value
    Ready(T),
    /// Transient condition; try again after the interval
    Retry(String),
}

/// Fixed-interval polling with an attempt bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Cross-process lock: 100 ms for up to a minute
    pub const fn lock() -> Self {
        Self::new(Duration::from_millis(100), 600)
    }

    /// TCP readiness probe: 300 ms for up to ten minutes
    pub const fn readiness() -> Self {
        Self::new(Duration::from_millis(300), 2000)
    }

    /// Account creation while the HTTP layer comes up
    pub const fn account_creation() -> Self {
        Self::new(Duration::from_millis(100), 20)
    }

    /// Run `op` until it is ready, fails, or attempts run out.
    ///
    /// `Err` from `op` is fatal and returned as is. Exhaustion yields
    /// [`Error::Timeout`] labelled with `what`.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Attempt<T>>>,
    {
        for attempt in 1..=self.max_attempts {
            match op(attempt).await? {
                Attempt::Ready(value) => return Ok(value),
                Attempt::Retry(reason) => {
                    trace!(what, attempt, %reason, "not ready, retrying");
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.interval).await;
                    }
                }
            }
        }

        Err(Error::Timeout {
            what: what.to_string(),
            attempts: self.max_attempts,
        })
    }
}
