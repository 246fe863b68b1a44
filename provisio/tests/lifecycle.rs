//! End-to-end lifecycle tests against the simulated cloud.
//!
//! All tests run with a paused tokio clock, so "40 seconds" of polling
//! completes instantly and deterministically.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use provisio::clients::simulated::{ApiError, Operation};
use provisio::clients::spot_datafeed::SpotDatafeedClient;
use provisio::clients::{SimulatedClient, SimulatedCloud, SimulatedCloudConfig};
use provisio::verify;
use provisio::{
    Action, DriftKind, LifecyclePhase, LifecycleReconciler, Phase, ReconcileError,
    RemoteError, RemoteResourceClient, ResourceConfig, RetryPolicy, Step,
};

fn policy() -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_secs(40), Duration::from_secs(1))
}

fn cloud(create_delay_secs: u64, delete_delay_secs: u64) -> SimulatedCloud {
    SimulatedCloud::new(SimulatedCloudConfig {
        create_visibility_delay: Duration::from_secs(create_delay_secs),
        delete_visibility_delay: Duration::from_secs(delete_delay_secs),
        requests_per_second: None,
    })
}

fn session(client: &Arc<SimulatedClient>) -> LifecycleReconciler<SimulatedClient> {
    LifecycleReconciler::new(Arc::clone(client), policy())
}

fn subscription_config() -> ResourceConfig {
    ResourceConfig::new("subscription").with("name", "sub-1")
}

/// Create, observe, delete, and confirm absence within max_wait.
#[tokio::test(start_paused = true)]
async fn test_create_describe_delete_round_trip() {
    let client = Arc::new(SimulatedClient::new(cloud(3, 10), "subscription"));
    let mut rec = session(&client);

    let created = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();
    assert!(created.identity.is_set());
    assert_eq!(created.attribute("name"), Some("sub-1"));
    verify::assert_exists(rec.current_state()).unwrap();

    let described = client.describe(&created.identity).await.unwrap();
    assert_eq!(described.attribute("name"), Some("sub-1"));

    rec.reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap();
    assert_eq!(rec.phase(), LifecyclePhase::Absent);
    verify::assert_destroyed(|| client.describe(&created.identity))
        .await
        .unwrap();
}

/// A fatal create leaves nothing behind and nothing to compensate.
#[tokio::test(start_paused = true)]
async fn test_fatal_create_is_reported_without_compensation() {
    let cloud = cloud(0, 0);
    cloud
        .inject_fault(Operation::Put, ApiError::new("AccessDenied", "not authorized"))
        .await;
    let client = Arc::new(SimulatedClient::new(cloud.clone(), "subscription"));
    let mut rec = session(&client);

    let err = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap_err();
    match &err {
        ReconcileError::Fatal {
            phase: Phase::Create,
            step: Step::Call,
            cause: RemoteError::Fatal(msg),
            ..
        } => assert!(msg.contains("AccessDenied")),
        other => panic!("expected fatal create, got {:?}", other),
    }
    assert_eq!(cloud.call_count(Operation::Remove).await, 0);
    assert!(rec.current_state().is_none());
    assert!(rec.identity().is_none());
}

/// Absence that shows up exactly at max_wait still counts.
#[tokio::test(start_paused = true)]
async fn test_delete_confirmed_at_deadline() {
    let client = Arc::new(SimulatedClient::new(cloud(0, 40), "subscription"));
    let mut rec = session(&client);
    rec.reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();

    let started = Instant::now();
    rec.reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap();
    assert_eq!(started.elapsed(), Duration::from_secs(40));
    assert_eq!(rec.phase(), LifecyclePhase::Absent);
}

/// Absence one unit past max_wait is a delete timeout.
#[tokio::test(start_paused = true)]
async fn test_delete_times_out_one_unit_late() {
    let client = Arc::new(SimulatedClient::new(cloud(0, 41), "subscription"));
    let mut rec = session(&client);
    let created = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();

    let err = rec
        .reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap_err();
    match &err {
        ReconcileError::Timeout {
            phase: Phase::Delete,
            step: Step::Verify,
            last_reason,
            ..
        } => assert_eq!(last_reason, "still present"),
        other => panic!("expected delete timeout, got {:?}", other),
    }
    assert_eq!(
        err.last_observed().map(|s| s.identity.clone()),
        Some(created.identity)
    );
    assert_eq!(err.stage(), Some("verify-absence"));
    assert_eq!(rec.phase(), LifecyclePhase::DeleteFailed);

    // A later delete attempt converges once the backend catches up.
    tokio::time::advance(Duration::from_secs(1)).await;
    rec.reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap();
    assert_eq!(rec.phase(), LifecyclePhase::Absent);
}

/// Cancelling while waiting for absence keeps the resource tracked.
#[tokio::test(start_paused = true)]
async fn test_cancel_during_verify_absence_rolls_back() {
    let client = Arc::new(SimulatedClient::new(cloud(0, 30), "subscription"));
    let mut rec = session(&client);
    let created = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    rec.set_cancellation(cancel.clone());
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = rec
        .reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Cancelled {
            phase: Phase::Delete
        }
    ));
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(rec.phase(), LifecyclePhase::Present);
    assert_eq!(rec.identity(), Some(&created.identity));

    // Resuming converges on the delete that was already accepted.
    rec.set_cancellation(CancellationToken::new());
    rec.reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap();
    assert_eq!(rec.phase(), LifecyclePhase::Absent);
    assert!(rec.identity().is_none());
    verify::assert_destroyed(|| client.describe(&created.identity))
        .await
        .unwrap();
}

/// Repeated destroy checks after a confirmed delete never flip.
#[tokio::test(start_paused = true)]
async fn test_destroy_check_is_idempotent() {
    let client = Arc::new(SimulatedClient::new(cloud(0, 5), "subscription"));
    let mut rec = session(&client);
    let created = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();
    rec.reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap();

    for _ in 0..10 {
        verify::check_destroy(client.as_ref(), std::slice::from_ref(&created.identity))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(7)).await;
    }
}

/// Persistent throttling does not extend the verification window.
#[tokio::test(start_paused = true)]
async fn test_throttling_does_not_reset_deadline() {
    let cloud = cloud(0, 0);
    for _ in 0..100 {
        cloud
            .inject_fault(Operation::Get, ApiError::new("RequestLimitExceeded", "slow down"))
            .await;
    }
    let client = Arc::new(SimulatedClient::new(cloud, "subscription"));
    let mut rec = session(&client);

    let started = Instant::now();
    let err = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::Timeout {
            phase: Phase::Create,
            ..
        }
    ));
    assert!(started.elapsed() <= Duration::from_secs(41));
    assert_eq!(rec.phase(), LifecyclePhase::CreateFailed);
}

/// An out-of-band delete is reported once as drift, not as an error.
#[tokio::test(start_paused = true)]
async fn test_out_of_band_delete_emits_single_drift_event() {
    let cloud = cloud(0, 0);
    let client = Arc::new(SimulatedClient::new(cloud.clone(), "subscription"));
    let mut rec = session(&client);
    let mut events = rec.drift_events();
    let created = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();

    verify::force_disappearance(
        client.as_ref(),
        &created.identity,
        &policy(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert!(rec.refresh().await.unwrap().is_none());
    assert_eq!(rec.phase(), LifecyclePhase::DriftDetected);
    assert!(rec.current_state().is_none());
    assert!(rec.refresh().await.unwrap().is_none());

    let event = events.try_recv().unwrap();
    assert_eq!(event.identity, created.identity);
    assert_eq!(event.kind, DriftKind::Disappeared);
    assert_eq!(
        event.last_known_attributes.get("name").map(String::as_str),
        Some("sub-1")
    );
    assert!(events.try_recv().is_err());

    // The caller may choose to recreate.
    let recreated = rec
        .reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();
    assert_ne!(recreated.identity, created.identity);
}

/// Creating a subscription and importing it by identity yields the same
/// attributes as the desired config.
#[tokio::test(start_paused = true)]
async fn test_spot_datafeed_create_then_import() {
    let cloud = cloud(2, 2);
    let client = Arc::new(SpotDatafeedClient::new(cloud));
    let config = SpotDatafeedClient::config("tf-spot-datafeed-import-42", None);

    let mut owner = LifecycleReconciler::new(Arc::clone(&client), policy());
    let created = owner.reconcile(Action::Create, &config).await.unwrap();

    let mut importer = LifecycleReconciler::new(Arc::clone(&client), policy());
    let imported = importer.import(created.identity.clone()).await.unwrap();

    for (key, value) in &config.attributes {
        verify::assert_attribute(&imported, key, value).unwrap();
    }
    verify::verify_import(&created, &imported, &[]).unwrap();

    importer.reconcile(Action::Delete, &config).await.unwrap();
    verify::check_destroy(client.as_ref(), &[SpotDatafeedClient::identity()])
        .await
        .unwrap();
}

/// Reconcilers accept trait objects.
#[tokio::test(start_paused = true)]
async fn test_reconciler_over_dyn_client() {
    let client: Arc<dyn RemoteResourceClient> =
        Arc::new(SimulatedClient::new(cloud(1, 1), "subscription"));
    let mut rec = LifecycleReconciler::new(client, policy());
    rec.reconcile(Action::Create, &subscription_config())
        .await
        .unwrap();
    rec.reconcile(Action::Delete, &subscription_config())
        .await
        .unwrap();
    assert_eq!(rec.phase(), LifecyclePhase::Absent);
}
