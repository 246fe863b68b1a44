//! Error types for remote calls, reconciliation and verification.

use std::time::Duration;

use thiserror::Error;

use crate::snapshot::{ResourceIdentity, ResourceStateSnapshot};

/// Errors returned by a [`RemoteResourceClient`](crate::clients::RemoteResourceClient).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The resource does not exist (or is not yet visible).
    #[error("not found")]
    NotFound,

    /// The request was rejected by the shared rate limit and never processed.
    #[error("throttled")]
    Throttled,

    /// Temporary backend failure.
    #[error("transient: {0}")]
    Transient(String),

    /// Non-retryable failure (bad request, access denied, ...).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl RemoteError {
    /// Classify a backend error code into a typed variant.
    ///
    /// Codes follow the `Service.Reason` convention used by EC2-style APIs,
    /// e.g. `InvalidSpotDatafeed.NotFound` or `RequestLimitExceeded`.
    pub fn from_code(code: &str, message: &str) -> Self {
        match code {
            "Throttling" | "ThrottlingException" | "RequestLimitExceeded" => Self::Throttled,
            "InternalError" | "InternalFailure" | "ServiceUnavailable" | "Unavailable" => {
                Self::Transient(format!("{}: {}", code, message))
            }
            c if c.ends_with(".NotFound") || c.ends_with("NotFound") => Self::NotFound,
            _ => Self::Fatal(format!("{}: {}", code, message)),
        }
    }

    /// Default retry eligibility for read-only probes.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Errors from [`poll_until`](crate::poller::poll_until).
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// `max_wait` elapsed while the probe still asked for a retry.
    #[error("timed out after {elapsed:?} ({attempts} attempts): {last_reason}")]
    Timeout {
        last_reason: String,
        elapsed: Duration,
        attempts: u32,
    },

    /// The probe reported a terminal failure.
    #[error("probe failed: {0}")]
    Fatal(E),

    /// The cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// The retry policy can never be satisfied.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

/// Lifecycle phase an error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Create,
    Delete,
    Refresh,
    Import,
}

/// Part of a phase a failure happened in: the mutating (or reading) call
/// itself, or the read loop that confirms its effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Call,
    Verify,
}

impl Phase {
    /// Name of the stage a failure in `step` of this phase belongs to.
    pub fn stage(self, step: Step) -> &'static str {
        match (self, step) {
            (Phase::Create, Step::Call) => "create",
            (Phase::Create, Step::Verify) => "verify",
            (Phase::Delete, Step::Call) => "delete",
            (Phase::Delete, Step::Verify) => "verify-absence",
            (Phase::Refresh, _) => "refresh",
            (Phase::Import, _) => "import",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Create => write!(f, "create"),
            Phase::Delete => write!(f, "delete"),
            Phase::Refresh => write!(f, "refresh"),
            Phase::Import => write!(f, "import"),
        }
    }
}

/// Errors surfaced by the [`LifecycleReconciler`](crate::reconciler::LifecycleReconciler).
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The phase did not converge within `max_wait`.
    #[error("{}: timed out after {elapsed:?}: {last_reason}{}", stage(.phase, .step), describe_compensation(.compensation))]
    Timeout {
        phase: Phase,
        step: Step,
        last_reason: String,
        elapsed: Duration,
        last_observed: Option<Box<ResourceStateSnapshot>>,
        /// Failure of the compensating delete issued after a create timeout.
        compensation: Option<RemoteError>,
    },

    /// A non-retryable remote failure, kept as the error source.
    #[error("{}: {cause}", stage(.phase, .step))]
    Fatal {
        phase: Phase,
        step: Step,
        #[source]
        cause: RemoteError,
        last_observed: Option<Box<ResourceStateSnapshot>>,
    },

    /// The session was cancelled before the phase was confirmed.
    #[error("{phase}: cancelled")]
    Cancelled { phase: Phase },

    /// The requested action is not valid from the current state.
    #[error("{phase}: cannot run from state {from}")]
    InvalidTransition { phase: Phase, from: String },

    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),
}

fn stage(phase: &Phase, step: &Step) -> &'static str {
    phase.stage(*step)
}

fn describe_compensation(compensation: &Option<RemoteError>) -> String {
    match compensation {
        Some(e) => format!(" (compensating delete failed: {})", e),
        None => String::new(),
    }
}

impl ReconcileError {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Timeout { phase, .. }
            | Self::Fatal { phase, .. }
            | Self::Cancelled { phase }
            | Self::InvalidTransition { phase, .. } => Some(*phase),
            Self::InvalidPolicy(_) => None,
        }
    }

    /// Stage of a timeout or fatal failure, e.g. `verify-absence`.
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { phase, step, .. } | Self::Fatal { phase, step, .. } => {
                Some(phase.stage(*step))
            }
            _ => None,
        }
    }

    /// Last snapshot observed before the failure, if any.
    pub fn last_observed(&self) -> Option<&ResourceStateSnapshot> {
        match self {
            Self::Timeout { last_observed, .. } | Self::Fatal { last_observed, .. } => {
                last_observed.as_deref()
            }
            _ => None,
        }
    }

    pub(crate) fn from_poll(
        phase: Phase,
        step: Step,
        err: PollError<RemoteError>,
        last_observed: Option<ResourceStateSnapshot>,
    ) -> Self {
        match err {
            PollError::Timeout {
                last_reason,
                elapsed,
                ..
            } => Self::Timeout {
                phase,
                step,
                last_reason,
                elapsed,
                last_observed: last_observed.map(Box::new),
                compensation: None,
            },
            PollError::Fatal(cause) => Self::Fatal {
                phase,
                step,
                cause,
                last_observed: last_observed.map(Box::new),
            },
            PollError::Cancelled => Self::Cancelled { phase },
            PollError::InvalidPolicy(msg) => Self::InvalidPolicy(msg),
        }
    }
}

/// Failures reported by the verifier.
#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("expected resource to exist: {0}")]
    ExpectedExists(String),

    #[error("resource {0} still exists")]
    ExpectedAbsent(ResourceIdentity),

    #[error("unexpected error: {0}")]
    Unexpected(#[source] RemoteError),

    #[error("attribute {key}: expected {expected:?}, got {actual:?}")]
    AttributeMismatch {
        key: String,
        expected: Option<String>,
        actual: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_code_classifies_not_found() {
        assert_eq!(
            RemoteError::from_code("InvalidSpotDatafeed.NotFound", "no subscription"),
            RemoteError::NotFound
        );
        assert_eq!(
            RemoteError::from_code("NoSuchBucketNotFound", "x"),
            RemoteError::NotFound
        );
    }

    #[test]
    fn test_from_code_classifies_retryable() {
        assert_eq!(
            RemoteError::from_code("RequestLimitExceeded", "slow down"),
            RemoteError::Throttled
        );
        assert!(matches!(
            RemoteError::from_code("ServiceUnavailable", "try later"),
            RemoteError::Transient(_)
        ));
    }

    #[test]
    fn test_from_code_defaults_to_fatal() {
        let err = RemoteError::from_code("AccessDenied", "not allowed");
        assert_eq!(err, RemoteError::Fatal("AccessDenied: not allowed".to_string()));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_display_names_phase_and_compensation() {
        let err = ReconcileError::Timeout {
            phase: Phase::Create,
            step: Step::Verify,
            last_reason: "not yet visible".to_string(),
            elapsed: Duration::from_secs(40),
            last_observed: None,
            compensation: Some(RemoteError::Transient("boom".to_string())),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("verify:"));
        assert!(msg.contains("not yet visible"));
        assert!(msg.contains("compensating delete failed"));
        assert_eq!(err.phase(), Some(Phase::Create));
        assert_eq!(err.stage(), Some("verify"));
    }

    #[test]
    fn test_fatal_display_names_stage() {
        let err = ReconcileError::from_poll(
            Phase::Delete,
            Step::Verify,
            PollError::Fatal(RemoteError::Fatal("AccessDenied: no".to_string())),
            None,
        );
        assert_eq!(err.to_string(), "verify-absence: fatal: AccessDenied: no");

        let err = ReconcileError::from_poll(
            Phase::Delete,
            Step::Call,
            PollError::Fatal(RemoteError::Fatal("AccessDenied: no".to_string())),
            None,
        );
        assert_eq!(err.to_string(), "delete: fatal: AccessDenied: no");
        assert_eq!(Phase::Create.stage(Step::Call), "create");
        assert_eq!(Phase::Create.stage(Step::Verify), "verify");
    }
}
