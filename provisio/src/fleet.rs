//! Fleet: many independent reconciler sessions driven from one manifest.
//!
//! Each named resource gets its own [`LifecycleReconciler`]. Applying a
//! manifest creates what is desired and prunes what is no longer listed, with
//! every session running as its own task. Sessions share nothing but the
//! backend (and its rate budget), so they need no coordination; one session
//! per name keeps per-identity access serialized.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::clients::RemoteResourceClient;
use crate::error::ReconcileError;
use crate::poller::RetryPolicy;
use crate::reconciler::{Action, DriftEvent, LifecycleReconciler};
use crate::snapshot::{ResourceConfig, ResourceStateSnapshot};

/// Outcome of one [`Fleet::apply`] pass.
#[derive(Debug, Default)]
pub struct ApplyReport {
    /// Resources confirmed present, by name.
    pub present: BTreeMap<String, ResourceStateSnapshot>,
    /// Resources confirmed deleted.
    pub pruned: Vec<String>,
    /// Sessions that failed, by name.
    pub failed: BTreeMap<String, ReconcileError>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

type Session<C> = LifecycleReconciler<C>;

/// Concurrent reconciler sessions over one client.
pub struct Fleet<C: RemoteResourceClient + ?Sized + 'static> {
    client: Arc<C>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    sessions: HashMap<String, Session<C>>,
    /// Last desired config per name, used when pruning.
    configs: HashMap<String, ResourceConfig>,
    drift_tx: mpsc::UnboundedSender<DriftEvent>,
    drift_rx: Option<mpsc::UnboundedReceiver<DriftEvent>>,
}

impl<C: RemoteResourceClient + ?Sized + 'static> Fleet<C> {
    pub fn new(client: Arc<C>, policy: RetryPolicy) -> Self {
        let (drift_tx, drift_rx) = mpsc::unbounded_channel();
        Self {
            client,
            policy,
            cancel: CancellationToken::new(),
            sessions: HashMap::new(),
            configs: HashMap::new(),
            drift_tx,
            drift_rx: Some(drift_rx),
        }
    }

    /// Drift events from every session. Can be taken once.
    pub fn take_drift_events(&mut self) -> Option<mpsc::UnboundedReceiver<DriftEvent>> {
        self.drift_rx.take()
    }

    /// Cancelling this token cancels every session.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn session(&self, name: &str) -> Option<&Session<C>> {
        self.sessions.get(name)
    }

    fn new_session(&self) -> Session<C> {
        LifecycleReconciler::new(Arc::clone(&self.client), self.policy.clone())
            .with_cancellation(self.cancel.child_token())
            .with_drift_sender(self.drift_tx.clone())
    }

    /// Converge on `desired`: create every listed resource, delete every
    /// known resource that is no longer listed.
    pub async fn apply(&mut self, desired: BTreeMap<String, ResourceConfig>) -> ApplyReport {
        let desired_names: HashSet<String> = desired.keys().cloned().collect();
        let known: HashSet<String> = self.sessions.keys().cloned().collect();
        info!(
            desired = desired_names.len(),
            known = known.len(),
            "Applying manifest"
        );

        let mut tasks = JoinSet::new();

        for (name, config) in desired {
            let mut session = match self.sessions.remove(&name) {
                Some(session) => session,
                None => self.new_session(),
            };
            self.configs.insert(name.clone(), config.clone());
            tasks.spawn(async move {
                let result = session.reconcile(Action::Create, &config).await;
                (name, Action::Create, session, result)
            });
        }

        for name in known.difference(&desired_names) {
            let Some(mut session) = self.sessions.remove(name) else {
                continue;
            };
            let config = self.configs.get(name).cloned().unwrap_or_default();
            let name = name.clone();
            info!(name = %name, "Pruning resource");
            tasks.spawn(async move {
                let result = session.reconcile(Action::Delete, &config).await;
                (name, Action::Delete, session, result)
            });
        }

        let mut report = ApplyReport::default();
        while let Some(joined) = tasks.join_next().await {
            let (name, action, session, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!(error = %e, "Session task panicked");
                    continue;
                }
            };
            match (action, result) {
                (Action::Create, Ok(snapshot)) => {
                    report.present.insert(name.clone(), snapshot);
                    self.sessions.insert(name, session);
                }
                (Action::Delete, Ok(_)) => {
                    self.configs.remove(&name);
                    report.pruned.push(name);
                }
                (_, Err(e)) => {
                    error!(name = %name, error = %e, "Reconciliation failed");
                    report.failed.insert(name.clone(), e);
                    self.sessions.insert(name, session);
                }
            }
        }
        report.pruned.sort();
        report
    }

    /// Refresh every present session concurrently. Returns the names of
    /// resources found to have disappeared.
    pub async fn refresh_all(&mut self) -> Vec<String> {
        let mut tasks = JoinSet::new();
        for (name, mut session) in self.sessions.drain() {
            tasks.spawn(async move {
                let result = match session.current_state() {
                    Some(_) => session.refresh().await.map(|s| s.is_none()),
                    None => Ok(false),
                };
                (name, session, result)
            });
        }

        let mut disappeared = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, session, result)) => {
                    match result {
                        Ok(true) => disappeared.push(name.clone()),
                        Ok(false) => {}
                        Err(e) => error!(name = %name, error = %e, "Refresh failed"),
                    }
                    self.sessions.insert(name, session);
                }
                Err(e) => error!(error = %e, "Refresh task panicked"),
            }
        }
        disappeared.sort();
        disappeared
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{SimulatedClient, SimulatedCloud, SimulatedCloudConfig};
    use crate::reconciler::{DriftKind, LifecyclePhase};
    use std::time::Duration;

    fn fleet(cloud: &SimulatedCloud) -> Fleet<SimulatedClient> {
        Fleet::new(
            Arc::new(SimulatedClient::new(cloud.clone(), "bucket")),
            RetryPolicy::fixed(Duration::from_secs(40), Duration::from_secs(1)),
        )
    }

    fn manifest(names: &[&str]) -> BTreeMap<String, ResourceConfig> {
        names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    ResourceConfig::new("bucket").with("name", *n),
                )
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_creates_and_prunes() {
        let cloud = SimulatedCloud::new(SimulatedCloudConfig {
            create_visibility_delay: Duration::from_secs(2),
            delete_visibility_delay: Duration::from_secs(2),
            requests_per_second: None,
        });
        let mut fleet = fleet(&cloud);

        let report = fleet.apply(manifest(&["a", "b", "c"])).await;
        assert!(report.is_success());
        assert_eq!(report.present.len(), 3);
        assert_eq!(cloud.list("bucket").await.len(), 3);

        let report = fleet.apply(manifest(&["a"])).await;
        assert!(report.is_success());
        assert_eq!(report.pruned, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(fleet.names(), vec!["a".to_string()]);
        assert_eq!(cloud.list("bucket").await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_share_rate_budget() {
        let cloud = SimulatedCloud::new(SimulatedCloudConfig {
            requests_per_second: Some(3),
            ..Default::default()
        });
        let mut fleet = fleet(&cloud);
        let report = fleet.apply(manifest(&["a", "b", "c", "d", "e"])).await;
        assert!(report.is_success(), "failed: {:?}", report.failed);
        assert_eq!(report.present.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_all_reports_disappeared() {
        let cloud = SimulatedCloud::default();
        let mut fleet = fleet(&cloud);
        let mut events = fleet.take_drift_events().unwrap();
        let report = fleet.apply(manifest(&["a", "b"])).await;

        let gone = report.present["b"].identity.clone();
        assert!(cloud.delete_out_of_band("bucket", gone.as_str()).await);

        assert_eq!(fleet.refresh_all().await, vec!["b".to_string()]);
        assert_eq!(
            fleet.session("b").map(|s| s.phase()),
            Some(LifecyclePhase::DriftDetected)
        );
        let event = events.try_recv().unwrap();
        assert_eq!(event.identity, gone);
        assert_eq!(event.kind, DriftKind::Disappeared);
        assert!(events.try_recv().is_err());

        // Re-applying recreates the drifted resource.
        let report = fleet.apply(manifest(&["a", "b"])).await;
        assert!(report.is_success());
        assert_ne!(report.present["b"].identity, gone);
    }
}
