//! Lifecycle reconciliation for a single managed resource.
//!
//! A [`LifecycleReconciler`] drives one resource through create, verify,
//! delete and verify-absence against an eventually-consistent backend, and
//! reports resources that vanish or change behind its back as [`DriftEvent`]s.

mod lifecycle;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::snapshot::ResourceIdentity;

pub use lifecycle::LifecycleReconciler;

/// Action requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Delete,
}

/// State of one managed resource session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecyclePhase {
    Absent,
    Creating,
    Verifying,
    Present,
    Deleting,
    VerifyingAbsence,
    DriftDetected,
    CreateFailed,
    DeleteFailed,
    Failed,
}

impl LifecyclePhase {
    /// Whether no further automatic transition happens from here.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            LifecyclePhase::Creating
                | LifecyclePhase::Verifying
                | LifecyclePhase::Deleting
                | LifecyclePhase::VerifyingAbsence
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecyclePhase::Absent => "absent",
            LifecyclePhase::Creating => "creating",
            LifecyclePhase::Verifying => "verifying",
            LifecyclePhase::Present => "present",
            LifecyclePhase::Deleting => "deleting",
            LifecyclePhase::VerifyingAbsence => "verifying-absence",
            LifecyclePhase::DriftDetected => "drift-detected",
            LifecyclePhase::CreateFailed => "create-failed",
            LifecyclePhase::DeleteFailed => "delete-failed",
            LifecyclePhase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// How the observed state diverged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase", tag = "kind")]
pub enum DriftKind {
    /// Describe returned not-found without a delete having been issued.
    Disappeared,
    /// Attributes changed without a managed action.
    Modified {
        current_attributes: BTreeMap<String, String>,
    },
}

/// Emitted when a present resource diverges from its last known state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftEvent {
    pub identity: ResourceIdentity,
    pub resource_type: String,
    pub last_known_attributes: BTreeMap<String, String>,
    pub kind: DriftKind,
    pub detected_at: DateTime<Utc>,
}
