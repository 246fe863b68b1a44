//! Bounded-time polling with monotonic backoff.
//!
//! Eventually-consistent backends need every mutating call to be followed by
//! a read loop that waits for the effect to become visible. [`poll_until`]
//! runs such a loop: the probe classifies each attempt as [`Outcome::Done`],
//! [`Outcome::Retry`] or [`Outcome::Fail`], and the poller sleeps between
//! retries until `max_wait` is exhausted or the session is cancelled.
//!
//! All timing goes through `tokio::time`, so tests can drive the loop with a
//! paused clock.
//!
//! # Example
//!
//! ```ignore
//! let snapshot = poll_until(&policy, &cancel, "describe", || async {
//!     Outcome::from_remote(client.describe(&id).await, &policy)
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{PollError, RemoteError};

/// Result of a single probe attempt.
#[derive(Debug)]
pub enum Outcome<T, E> {
    /// Terminal success; polling stops.
    Done(T),
    /// Not converged yet; try again after the current interval.
    Retry(String),
    /// Terminal failure; never retried.
    Fail(E),
}

impl<T> Outcome<T, RemoteError> {
    /// Map a remote read into an outcome using the policy's retry predicate.
    pub fn from_remote(result: Result<T, RemoteError>, policy: &RetryPolicy) -> Self {
        match result {
            Ok(v) => Outcome::Done(v),
            Err(e) if (policy.retryable)(&e) => Outcome::Retry(e.to_string()),
            Err(e) => Outcome::Fail(e),
        }
    }
}

/// Timing and retry eligibility for a poll loop.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Upper bound on total time spent retrying
    pub max_wait: Duration,
    /// Delay after the first retry
    pub initial_interval: Duration,
    /// Cap for the growing delay
    pub max_interval: Duration,
    /// Growth factor per retry (>= 1.0 keeps intervals non-decreasing)
    pub backoff_multiplier: f64,
    /// Which remote errors count as "try again"
    pub retryable: fn(&RemoteError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(40 * 60),
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable: RemoteError::is_retryable,
        }
    }
}

impl RetryPolicy {
    /// Fixed-interval policy.
    pub fn fixed(max_wait: Duration, interval: Duration) -> Self {
        Self {
            max_wait,
            initial_interval: interval,
            max_interval: interval,
            backoff_multiplier: 1.0,
            ..Default::default()
        }
    }

    /// Exponential backoff policy with the default growth factor.
    pub fn with_backoff(max_wait: Duration, initial: Duration, max: Duration) -> Self {
        Self {
            max_wait,
            initial_interval: initial,
            max_interval: max,
            ..Default::default()
        }
    }

    /// Reject policies that could never make progress.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_wait > MAX_WAIT_LIMIT {
            return Err(format!(
                "max wait {:?} exceeds the limit of {:?}",
                self.max_wait, MAX_WAIT_LIMIT
            ));
        }
        if self.initial_interval.is_zero() {
            return Err("poll interval must be non-zero".to_string());
        }
        if self.initial_interval >= self.max_wait {
            return Err(format!(
                "poll interval {:?} must be shorter than max wait {:?}",
                self.initial_interval, self.max_wait
            ));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(format!(
                "backoff multiplier {} must be >= 1.0",
                self.backoff_multiplier
            ));
        }
        Ok(())
    }

    fn next_interval(&self, current: Duration) -> Duration {
        let cap = self.max_interval.max(self.initial_interval);
        let next = (current.as_secs_f64() * self.backoff_multiplier).min(cap.as_secs_f64());
        // Rounding near Duration::MAX can leave `next` out of range.
        Duration::try_from_secs_f64(next).map_or(cap, |d| d.min(cap))
    }
}

/// Longest accepted `max_wait`.
pub const MAX_WAIT_LIMIT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fixed time budget shared by consecutive polls of one phase.
///
/// A phase that first retries its mutating call and then waits for the
/// effect to show polls twice against the same deadline, so throttling
/// early in the phase shortens verification instead of extending the phase.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Instant,
}

impl Deadline {
    /// Start a budget of `policy.max_wait` from now.
    pub fn start(policy: &RetryPolicy) -> Result<Self, String> {
        let started = Instant::now();
        let at = started
            .checked_add(policy.max_wait)
            .ok_or_else(|| format!("max wait {:?} overflows the clock", policy.max_wait))?;
        Ok(Self { started, at })
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }
}

/// Invoke `probe` until it reports `Done` or `Fail`, `max_wait` elapses, or
/// `cancel` fires.
///
/// The deadline is fixed when the call starts. Sleeps are clamped to the time
/// remaining, so the final probe always runs exactly at the deadline and the
/// loop returns within `max_wait` plus one probe.
pub async fn poll_until<F, Fut, T, E>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation_name: &str,
    probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T, E>>,
{
    policy.validate().map_err(PollError::InvalidPolicy)?;
    let deadline = Deadline::start(policy).map_err(PollError::InvalidPolicy)?;
    poll_within(policy, &deadline, cancel, operation_name, probe).await
}

/// Like [`poll_until`], but against a deadline started earlier.
///
/// The probe runs at least once even if the deadline has already passed.
/// `elapsed` in a timeout counts from the start of `deadline`.
pub async fn poll_within<F, Fut, T, E>(
    policy: &RetryPolicy,
    deadline: &Deadline,
    cancel: &CancellationToken,
    operation_name: &str,
    mut probe: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Outcome<T, E>>,
{
    policy.validate().map_err(PollError::InvalidPolicy)?;

    let mut interval = policy.initial_interval;
    let mut attempts = 0u32;

    loop {
        if cancel.is_cancelled() {
            debug!(operation = %operation_name, attempts, "Poll cancelled");
            return Err(PollError::Cancelled);
        }

        attempts += 1;
        let reason = match probe().await {
            Outcome::Done(value) => {
                debug!(operation = %operation_name, attempts, "Poll converged");
                return Ok(value);
            }
            Outcome::Fail(e) => return Err(PollError::Fatal(e)),
            Outcome::Retry(reason) => reason,
        };

        let remaining = deadline.remaining();
        if remaining.is_zero() {
            warn!(
                operation = %operation_name,
                attempts,
                last_reason = %reason,
                "Poll timed out"
            );
            return Err(PollError::Timeout {
                last_reason: reason,
                elapsed: deadline.elapsed(),
                attempts,
            });
        }

        let delay = interval.min(remaining);
        debug!(
            operation = %operation_name,
            attempt = attempts,
            reason = %reason,
            delay_ms = delay.as_millis(),
            "Not converged, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(operation = %operation_name, attempts, "Poll cancelled while waiting");
                return Err(PollError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }

        interval = policy.next_interval(interval);
    }
}
