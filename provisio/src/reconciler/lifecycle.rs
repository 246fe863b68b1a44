//! Create / verify / delete / verify-absence state machine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Action, DriftEvent, DriftKind, LifecyclePhase};
use crate::clients::RemoteResourceClient;
use crate::error::{Phase, PollError, ReconcileError, RemoteError, Step};
use crate::poller::{poll_until, poll_within, Deadline, Outcome, RetryPolicy};
use crate::snapshot::{ResourceConfig, ResourceIdentity, ResourceStateSnapshot};

/// Reconciles one managed resource against its backend.
///
/// A reconciler exclusively owns the identity and snapshot of its resource.
/// Callers must not drive the same identity from two reconcilers at once.
pub struct LifecycleReconciler<C: RemoteResourceClient + ?Sized> {
    client: Arc<C>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    phase: LifecyclePhase,
    identity: Option<ResourceIdentity>,
    snapshot: Option<ResourceStateSnapshot>,
    drift_tx: Option<mpsc::UnboundedSender<DriftEvent>>,
}

impl<C: RemoteResourceClient + ?Sized> LifecycleReconciler<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            cancel: CancellationToken::new(),
            phase: LifecyclePhase::Absent,
            identity: None,
            snapshot: None,
            drift_tx: None,
        }
    }

    /// Use `cancel` for every poll this session runs.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Replace the cancellation token, e.g. to resume after a cancelled call.
    pub fn set_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }

    /// Send drift events to an existing channel.
    pub fn with_drift_sender(mut self, tx: mpsc::UnboundedSender<DriftEvent>) -> Self {
        self.drift_tx = Some(tx);
        self
    }

    /// Open a fresh drift channel, replacing any previous sender.
    pub fn drift_events(&mut self) -> mpsc::UnboundedReceiver<DriftEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.drift_tx = Some(tx);
        rx
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.phase
    }

    pub fn identity(&self) -> Option<&ResourceIdentity> {
        self.identity.as_ref()
    }

    /// Last confirmed snapshot. `None` unless the resource is `Present`.
    pub fn current_state(&self) -> Option<&ResourceStateSnapshot> {
        match self.phase {
            LifecyclePhase::Present => self.snapshot.as_ref(),
            _ => None,
        }
    }

    /// Drive the resource to the state requested by `action`.
    ///
    /// `Create` returns the verified snapshot. `Delete` returns the last
    /// snapshot observed before the resource disappeared.
    pub async fn reconcile(
        &mut self,
        action: Action,
        config: &ResourceConfig,
    ) -> Result<ResourceStateSnapshot, ReconcileError> {
        match action {
            Action::Create => self.ensure_created(config).await,
            Action::Delete => self.delete().await,
        }
    }

    async fn ensure_created(
        &mut self,
        config: &ResourceConfig,
    ) -> Result<ResourceStateSnapshot, ReconcileError> {
        let phase = self.phase;
        match phase {
            LifecyclePhase::Present => match self.refresh().await? {
                Some(snapshot) if snapshot.satisfies(config) => {
                    debug!(identity = %snapshot.identity, "Already present");
                    return Ok(snapshot);
                }
                Some(snapshot) => {
                    info!(
                        identity = %snapshot.identity,
                        "Config changed, replacing resource"
                    );
                    self.delete().await?;
                }
                None => {}
            },
            LifecyclePhase::DeleteFailed => {
                return Err(ReconcileError::InvalidTransition {
                    phase: Phase::Create,
                    from: phase.to_string(),
                });
            }
            // The drifted resource is confirmed gone.
            LifecyclePhase::DriftDetected => {}
            // A create that was never confirmed may still have landed.
            _ if self.identity.is_some() => {
                info!(
                    identity = ?self.identity,
                    from = %phase,
                    "Removing unconfirmed resource before create"
                );
                self.delete().await?;
            }
            _ => {}
        }
        self.create(config).await
    }

    async fn create(
        &mut self,
        config: &ResourceConfig,
    ) -> Result<ResourceStateSnapshot, ReconcileError> {
        let deadline = Deadline::start(&self.policy).map_err(ReconcileError::InvalidPolicy)?;
        let previous = self.phase;
        let resource_type = self.client.resource_type().to_string();
        info!(resource_type = %resource_type, "Creating resource");
        self.phase = LifecyclePhase::Creating;
        self.snapshot = None;

        // Throttled requests were never processed, so retrying them keeps
        // the call at-most-once.
        let client = &self.client;
        let created = poll_within(&self.policy, &deadline, &self.cancel, "create", || async move {
            match client.create(config).await {
                Ok(identity) => Outcome::Done(identity),
                Err(RemoteError::Throttled) => Outcome::Retry("create throttled".to_string()),
                Err(e) => Outcome::Fail(e),
            }
        })
        .await;

        let identity = match created {
            Ok(identity) if identity.is_set() => identity,
            Ok(_) => {
                self.phase = LifecyclePhase::Failed;
                return Err(ReconcileError::Fatal {
                    phase: Phase::Create,
                    step: Step::Call,
                    cause: RemoteError::Fatal("backend returned an empty identity".to_string()),
                    last_observed: None,
                });
            }
            Err(PollError::Cancelled) => {
                self.phase = previous;
                return Err(ReconcileError::Cancelled {
                    phase: Phase::Create,
                });
            }
            Err(e) => {
                self.phase = match e {
                    PollError::Timeout { .. } => LifecyclePhase::CreateFailed,
                    _ => LifecyclePhase::Failed,
                };
                error!(resource_type = %resource_type, error = %e, "Create failed");
                return Err(ReconcileError::from_poll(Phase::Create, Step::Call, e, None));
            }
        };

        self.identity = Some(identity.clone());
        self.phase = LifecyclePhase::Verifying;
        info!(identity = %identity, "Created, verifying visibility");

        let last_seen: Mutex<Option<ResourceStateSnapshot>> = Mutex::new(None);
        let verified = {
            let client = &self.client;
            let policy = &self.policy;
            let expected = &identity;
            let last_seen = &last_seen;
            poll_within(policy, &deadline, &self.cancel, "verify-create", || async move {
                match client.describe(expected).await {
                    Ok(snapshot) if snapshot.identity != *expected => {
                        let reason = format!("describe returned identity {}", snapshot.identity);
                        record(last_seen, snapshot);
                        Outcome::Retry(reason)
                    }
                    Ok(snapshot) => match snapshot.first_mismatch(config) {
                        Some(key) => {
                            let reason = format!("attribute {} not converged", key);
                            record(last_seen, snapshot);
                            Outcome::Retry(reason)
                        }
                        None => Outcome::Done(snapshot),
                    },
                    Err(e) => Outcome::from_remote(Err(e), policy),
                }
            })
            .await
        };
        let last_seen = take(&last_seen);

        match verified {
            Ok(snapshot) => {
                info!(identity = %identity, "Resource present");
                self.phase = LifecyclePhase::Present;
                self.snapshot = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(PollError::Timeout {
                last_reason,
                elapsed,
                ..
            }) => {
                // The create may or may not have landed; clean up rather than
                // leave a dangling resource.
                warn!(
                    identity = %identity,
                    last_reason = %last_reason,
                    "Create not confirmed, issuing compensating delete"
                );
                let compensation = self.client.delete(&identity).await.err();
                if let Some(e) = &compensation {
                    error!(identity = %identity, error = %e, "Compensating delete failed");
                }
                self.phase = LifecyclePhase::CreateFailed;
                Err(ReconcileError::Timeout {
                    phase: Phase::Create,
                    step: Step::Verify,
                    last_reason,
                    elapsed,
                    last_observed: last_seen.map(Box::new),
                    compensation,
                })
            }
            Err(PollError::Cancelled) => {
                // Nothing was confirmed. The identity is kept so a later
                // create or delete cleans it up.
                self.phase = LifecyclePhase::Absent;
                Err(ReconcileError::Cancelled {
                    phase: Phase::Create,
                })
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Create verification failed");
                self.phase = LifecyclePhase::Failed;
                Err(ReconcileError::from_poll(Phase::Create, Step::Verify, e, last_seen))
            }
        }
    }

    async fn delete(&mut self) -> Result<ResourceStateSnapshot, ReconcileError> {
        let Some(identity) = self.identity.clone() else {
            return Err(ReconcileError::InvalidTransition {
                phase: Phase::Delete,
                from: self.phase.to_string(),
            });
        };
        let deadline = Deadline::start(&self.policy).map_err(ReconcileError::InvalidPolicy)?;
        let previous = self.phase;
        let last_known = self.snapshot.clone();
        info!(identity = %identity, "Deleting resource");
        self.phase = LifecyclePhase::Deleting;

        let client = &self.client;
        let target = &identity;
        let deleted = poll_within(&self.policy, &deadline, &self.cancel, "delete", || async move {
            match client.delete(target).await {
                Ok(()) | Err(RemoteError::NotFound) => Outcome::Done(()),
                Err(RemoteError::Throttled) => Outcome::Retry("delete throttled".to_string()),
                Err(e) => Outcome::Fail(e),
            }
        })
        .await;

        match deleted {
            Ok(()) => {}
            Err(PollError::Cancelled) => {
                self.phase = previous;
                return Err(ReconcileError::Cancelled {
                    phase: Phase::Delete,
                });
            }
            Err(e) => {
                self.phase = match e {
                    PollError::Timeout { .. } => LifecyclePhase::DeleteFailed,
                    _ => LifecyclePhase::Failed,
                };
                error!(identity = %identity, error = %e, "Delete failed");
                return Err(ReconcileError::from_poll(Phase::Delete, Step::Call, e, last_known));
            }
        }

        // Only reads issued after the delete returned are trusted from here.
        self.phase = LifecyclePhase::VerifyingAbsence;
        debug!(identity = %identity, "Delete accepted, verifying absence");

        let last_seen: Mutex<Option<ResourceStateSnapshot>> = Mutex::new(None);
        let absent = {
            let client = &self.client;
            let policy = &self.policy;
            let last_seen = &last_seen;
            poll_within(policy, &deadline, &self.cancel, "verify-absence", || async move {
                match client.describe(target).await {
                    Err(RemoteError::NotFound) => Outcome::Done(()),
                    Ok(snapshot) => {
                        record(last_seen, snapshot);
                        Outcome::Retry("still present".to_string())
                    }
                    Err(e) if (policy.retryable)(&e) => Outcome::Retry(e.to_string()),
                    Err(e) => Outcome::Fail(e),
                }
            })
            .await
        };
        let last_seen = take(&last_seen);

        match absent {
            Ok(()) => {
                info!(identity = %identity, "Resource absent");
                self.phase = LifecyclePhase::Absent;
                self.identity = None;
                self.snapshot = None;
                let resource_type = self.client.resource_type().to_string();
                Ok(last_seen.or(last_known).unwrap_or_else(|| {
                    ResourceStateSnapshot::new(identity, resource_type, BTreeMap::new())
                }))
            }
            Err(PollError::Cancelled) => {
                self.phase = previous;
                Err(ReconcileError::Cancelled {
                    phase: Phase::Delete,
                })
            }
            Err(e) => {
                self.phase = match e {
                    PollError::Timeout { .. } => LifecyclePhase::DeleteFailed,
                    _ => LifecyclePhase::Failed,
                };
                error!(identity = %identity, error = %e, "Delete not confirmed");
                if last_seen.is_some() {
                    self.snapshot = last_seen.clone();
                }
                Err(ReconcileError::from_poll(
                    Phase::Delete,
                    Step::Verify,
                    e,
                    last_seen.or(last_known),
                ))
            }
        }
    }

    /// Re-read a present resource and report drift.
    ///
    /// Returns `Ok(None)` when the resource disappeared without a delete
    /// having been issued. That transitions to `DriftDetected` and emits a
    /// single [`DriftEvent`]; later refreshes return `Ok(None)` without
    /// emitting again.
    pub async fn refresh(&mut self) -> Result<Option<ResourceStateSnapshot>, ReconcileError> {
        let identity = match (self.phase, &self.identity) {
            (LifecyclePhase::Present, Some(identity)) => identity.clone(),
            (LifecyclePhase::DriftDetected, _) => return Ok(None),
            _ => {
                return Err(ReconcileError::InvalidTransition {
                    phase: Phase::Refresh,
                    from: self.phase.to_string(),
                });
            }
        };

        let observed = {
            let client = &self.client;
            let policy = &self.policy;
            let target = &identity;
            poll_until(policy, &self.cancel, "refresh", || async move {
                match client.describe(target).await {
                    Ok(snapshot) => Outcome::Done(Some(snapshot)),
                    Err(RemoteError::NotFound) => Outcome::Done(None),
                    Err(e) => Outcome::from_remote(Err(e), policy),
                }
            })
            .await
        };

        let last_known = self.snapshot.clone();
        match observed {
            Ok(Some(snapshot)) => {
                let changed = last_known
                    .as_ref()
                    .filter(|known| known.attributes != snapshot.attributes);
                if let Some(known) = changed {
                    warn!(identity = %identity, "Attributes drifted");
                    self.emit(DriftEvent {
                        identity: identity.clone(),
                        resource_type: snapshot.resource_type.clone(),
                        last_known_attributes: known.attributes.clone(),
                        kind: DriftKind::Modified {
                            current_attributes: snapshot.attributes.clone(),
                        },
                        detected_at: Utc::now(),
                    });
                }
                self.snapshot = Some(snapshot.clone());
                Ok(Some(snapshot))
            }
            Ok(None) => {
                warn!(identity = %identity, "Resource disappeared out of band");
                self.phase = LifecyclePhase::DriftDetected;
                self.snapshot = None;
                self.emit(DriftEvent {
                    identity,
                    resource_type: self.client.resource_type().to_string(),
                    last_known_attributes: last_known.map(|s| s.attributes).unwrap_or_default(),
                    kind: DriftKind::Disappeared,
                    detected_at: Utc::now(),
                });
                Ok(None)
            }
            Err(e) => {
                if matches!(e, PollError::Fatal(_)) {
                    self.phase = LifecyclePhase::Failed;
                }
                error!(identity = %identity, error = %e, "Refresh failed");
                Err(ReconcileError::from_poll(Phase::Refresh, Step::Verify, e, last_known))
            }
        }
    }

    /// Adopt an existing resource by identity.
    ///
    /// A `NotFound` is terminal here: the caller claims the resource exists.
    pub async fn import(
        &mut self,
        identity: ResourceIdentity,
    ) -> Result<ResourceStateSnapshot, ReconcileError> {
        if self.identity.is_some() || !identity.is_set() {
            return Err(ReconcileError::InvalidTransition {
                phase: Phase::Import,
                from: self.phase.to_string(),
            });
        }

        info!(identity = %identity, "Importing resource");
        let observed = {
            let client = &self.client;
            let policy = &self.policy;
            let target = &identity;
            poll_until(policy, &self.cancel, "import", || async move {
                match client.describe(target).await {
                    Err(RemoteError::NotFound) => Outcome::Fail(RemoteError::NotFound),
                    other => Outcome::from_remote(other, policy),
                }
            })
            .await
        };

        match observed {
            Ok(snapshot) => {
                self.phase = LifecyclePhase::Present;
                self.identity = Some(identity);
                self.snapshot = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Import failed");
                Err(ReconcileError::from_poll(Phase::Import, Step::Verify, e, None))
            }
        }
    }

    fn emit(&self, event: DriftEvent) {
        match &self.drift_tx {
            Some(tx) => {
                if tx.send(event).is_err() {
                    debug!("Drift receiver dropped");
                }
            }
            None => debug!(identity = %event.identity, "No drift subscriber"),
        }
    }
}

fn record(slot: &Mutex<Option<ResourceStateSnapshot>>, snapshot: ResourceStateSnapshot) {
    if let Ok(mut guard) = slot.lock() {
        *guard = Some(snapshot);
    }
}

fn take(slot: &Mutex<Option<ResourceStateSnapshot>>) -> Option<ResourceStateSnapshot> {
    slot.lock().ok().and_then(|mut guard| guard.take())
}
