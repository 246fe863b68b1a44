//! provisio: lifecycle reconciler for externally managed resources.
//!
//! Drives a resource through create, verify, delete and verify-absence
//! against a backend whose reads lag its writes, and reports resources that
//! vanish or change out of band.

pub mod clients;
pub mod error;
pub mod fleet;
pub mod poller;
pub mod reconciler;
pub mod scenario;
pub mod snapshot;
pub mod verify;

pub use clients::RemoteResourceClient;
pub use error::{AssertionError, Phase, PollError, ReconcileError, RemoteError, Step};
pub use fleet::{ApplyReport, Fleet};
pub use poller::{poll_until, poll_within, Deadline, Outcome, RetryPolicy};
pub use reconciler::{Action, DriftEvent, DriftKind, LifecycleReconciler, LifecyclePhase};
pub use snapshot::{ResourceConfig, ResourceIdentity, ResourceStateSnapshot};
