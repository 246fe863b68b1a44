//! Acceptance scenarios for the spot datafeed subscription.
//!
//! Each scenario runs against a fresh [`SimulatedCloud`] and ends with a
//! destroy check over every subscription it created:
//! - `basic`: create, check existence, destroy
//! - `import`: create, import by identity into a second session, compare
//! - `disappears`: create, delete out of band, expect a drift signal

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::clients::spot_datafeed::SpotDatafeedClient;
use crate::clients::{RemoteResourceClient, SimulatedCloud};
use crate::error::{AssertionError, ReconcileError};
use crate::poller::RetryPolicy;
use crate::reconciler::{Action, DriftEvent, LifecycleReconciler};
use crate::snapshot::{ResourceConfig, ResourceStateSnapshot};
use crate::verify;

/// Scenario to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scenario {
    Basic,
    Import,
    Disappears,
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("reconcile: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("check: {0}")]
    Assertion(#[from] AssertionError),

    #[error("expected a drift signal, resource still present")]
    DriftNotDetected,
}

/// Summary of a finished scenario.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub steps: Vec<String>,
    pub created: ResourceStateSnapshot,
}

/// Inputs shared by all scenarios.
#[derive(Debug, Clone)]
pub struct ScenarioContext {
    pub cloud: SimulatedCloud,
    pub policy: RetryPolicy,
    pub cancel: CancellationToken,
    pub drift_tx: Option<mpsc::UnboundedSender<DriftEvent>>,
}

impl ScenarioContext {
    fn session(&self, client: &Arc<SpotDatafeedClient>) -> LifecycleReconciler<SpotDatafeedClient> {
        let session = LifecycleReconciler::new(Arc::clone(client), self.policy.clone())
            .with_cancellation(self.cancel.clone());
        match &self.drift_tx {
            Some(tx) => session.with_drift_sender(tx.clone()),
            None => session,
        }
    }
}

/// Run `scenario` with a subscription delivering into `bucket`.
pub async fn run(
    scenario: Scenario,
    ctx: &ScenarioContext,
    bucket: &str,
    prefix: Option<&str>,
) -> Result<ScenarioReport, ScenarioError> {
    let client = Arc::new(SpotDatafeedClient::new(ctx.cloud.clone()));
    let config = SpotDatafeedClient::config(bucket, prefix);
    let mut steps = Vec::new();

    info!(scenario = ?scenario, bucket, "Running scenario");
    let mut session = ctx.session(&client);
    let created = session.reconcile(Action::Create, &config).await?;
    verify::assert_exists(session.current_state())?;
    verify::assert_attribute(&created, "bucket", bucket)?;
    steps.push(format!("created {}", created.identity));

    match scenario {
        Scenario::Basic => {
            destroy(&mut session, &config, &mut steps).await?;
        }
        Scenario::Import => {
            let mut importer = ctx.session(&client);
            let imported = importer.import(created.identity.clone()).await?;
            verify::verify_import(&created, &imported, &[])?;
            steps.push(format!("imported {}", imported.identity));
            destroy(&mut importer, &config, &mut steps).await?;
        }
        Scenario::Disappears => {
            verify::force_disappearance(
                client.as_ref(),
                &created.identity,
                &ctx.policy,
                &ctx.cancel,
            )
            .await?;
            steps.push("deleted out of band".to_string());
            if session.refresh().await?.is_some() {
                return Err(ScenarioError::DriftNotDetected);
            }
            steps.push(format!("drift detected ({})", session.phase()));
        }
    }

    verify::check_destroy(client.as_ref(), std::slice::from_ref(&created.identity)).await?;
    steps.push("destroy check passed".to_string());
    info!(scenario = ?scenario, "Scenario passed");

    Ok(ScenarioReport {
        scenario,
        steps,
        created,
    })
}

async fn destroy<C: RemoteResourceClient + ?Sized>(
    session: &mut LifecycleReconciler<C>,
    config: &ResourceConfig,
    steps: &mut Vec<String>,
) -> Result<(), ScenarioError> {
    let deleted = session.reconcile(Action::Delete, config).await?;
    steps.push(format!("deleted {}", deleted.identity));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SimulatedCloudConfig;
    use std::time::Duration;

    fn context() -> (ScenarioContext, mpsc::UnboundedReceiver<DriftEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = ScenarioContext {
            cloud: SimulatedCloud::new(SimulatedCloudConfig {
                create_visibility_delay: Duration::from_secs(2),
                delete_visibility_delay: Duration::from_secs(5),
                requests_per_second: Some(10),
            }),
            policy: RetryPolicy::with_backoff(
                Duration::from_secs(40 * 60),
                Duration::from_secs(1),
                Duration::from_secs(30),
            ),
            cancel: CancellationToken::new(),
            drift_tx: Some(tx),
        };
        (ctx, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_basic_scenario() {
        let (ctx, _rx) = context();
        let report = run(Scenario::Basic, &ctx, "tf-spot-datafeed-basic-1", None)
            .await
            .unwrap();
        assert_eq!(report.steps.last().unwrap(), "destroy check passed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_import_scenario() {
        let (ctx, _rx) = context();
        let report = run(Scenario::Import, &ctx, "tf-spot-datafeed-import-1", Some("p/"))
            .await
            .unwrap();
        assert!(report.steps.iter().any(|s| s.starts_with("imported")));
        assert_eq!(report.created.attribute("prefix"), Some("p/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disappears_scenario_emits_one_drift_event() {
        let (ctx, mut rx) = context();
        run(Scenario::Disappears, &ctx, "tf-spot-datafeed-disappears-1", None)
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
