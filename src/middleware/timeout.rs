//! Deadline race for downstream handlers.
//!
//! [`Deadline::run`] spawns the operation as its own task and races it against
//! a timer:
//!
//! ```text
//!            ┌── operation settles first ──→ timer dropped, outcome returned as is
//! run(op) ───┤
//!            └── timer fires first ────────→ task aborted, 408 Request Timeout
//! ```
//!
//! Aborting the task guarantees that a handler finishing after the deadline can
//! never write into the response. The timer and the task are owned by the race
//! and released on every exit path, including when the caller's own future is
//! dropped.
//! [`Deadline::armed_timers`] reports how many races are in flight.
//!
//! Spawned tasks do not inherit the caller's span; instrument the operation
//! before handing it over.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use tokio::task::{JoinError, JoinHandle};
use tracing::debug;

use crate::error::{CanonicalError, Failure};
use crate::metrics;

/// Races operations against a fixed time limit.
#[derive(Debug, Clone)]
pub struct Deadline {
    limit: Duration,
    armed: Arc<AtomicUsize>,
}

impl Deadline {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            armed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The time limit applied to every operation.
    pub fn limit(&self) -> Duration {
        self.limit
    }

    /// Timers currently armed by this deadline and its clones.
    pub fn armed_timers(&self) -> usize {
        self.armed.load(Ordering::Acquire)
    }

    /// Run `operation` to completion or until the limit elapses.
    ///
    /// # Errors
    ///
    /// - The operation's own `Failure`, unchanged.
    /// - `Failure::Canonical` with a 408 error when the limit elapses first.
    /// - `Failure::Unhandled` when the operation panics.
    pub async fn run<F, T>(&self, operation: F) -> Result<T, Failure>
    where
        F: Future<Output = Result<T, Failure>> + Send + 'static,
        T: Send + 'static,
    {
        let _timer = ArmedTimer::arm(&self.armed);
        let mut task = Running(tokio::spawn(operation));
        let expiry = tokio::time::sleep(self.limit);

        tokio::select! {
            biased;

            joined = &mut task.0 => match joined {
                Ok(outcome) => outcome,
                Err(error) => Err(Failure::Unhandled(join_failure(error))),
            },
            () = expiry => {
                task.0.abort();
                debug!(limit_ms = self.limit.as_millis() as u64, "Deadline elapsed, handler aborted");
                Err(Failure::Canonical(CanonicalError::deadline_exceeded(self.limit)))
            }
        }
    }
}

/// Counts an armed timer for as long as it lives.
struct ArmedTimer {
    armed: Arc<AtomicUsize>,
}

impl ArmedTimer {
    fn arm(armed: &Arc<AtomicUsize>) -> Self {
        armed.fetch_add(1, Ordering::AcqRel);
        metrics::timer_armed();
        Self {
            armed: armed.clone(),
        }
    }
}

impl Drop for ArmedTimer {
    fn drop(&mut self) {
        self.armed.fetch_sub(1, Ordering::AcqRel);
        metrics::timer_released();
    }
}

/// Handler task that must not outlive the race.
struct Running<T>(JoinHandle<T>);

impl<T> Drop for Running<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(error: JoinError) -> anyhow::Error {
    if !error.is_panic() {
        return anyhow!("handler task was cancelled");
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow!("handler panicked: {message}")
}
