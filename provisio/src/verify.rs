//! Existence, destruction and import checks.
//!
//! These are the assertions acceptance scenarios make against a backend
//! after each step. They never retry: a check observes one read and passes
//! or fails on it. Waiting for convergence is the reconciler's job.

use std::collections::BTreeSet;
use std::future::Future;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::clients::RemoteResourceClient;
use crate::error::{AssertionError, Phase, ReconcileError, RemoteError, Step};
use crate::poller::{poll_until, Outcome, RetryPolicy};
use crate::snapshot::{ResourceIdentity, ResourceStateSnapshot};

/// Fail unless a snapshot is present and carries a set identity.
pub fn assert_exists(snapshot: Option<&ResourceStateSnapshot>) -> Result<(), AssertionError> {
    match snapshot {
        None => Err(AssertionError::ExpectedExists("no snapshot".to_string())),
        Some(s) if !s.identity.is_set() => {
            Err(AssertionError::ExpectedExists("no identity is set".to_string()))
        }
        Some(_) => Ok(()),
    }
}

/// Fail unless `probe` reports exactly `NotFound`.
///
/// A snapshot means the resource still exists. Any other error is passed
/// through as `Unexpected` rather than treated as absence.
pub async fn assert_destroyed<F, Fut>(probe: F) -> Result<(), AssertionError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<ResourceStateSnapshot, RemoteError>>,
{
    match probe().await {
        Err(RemoteError::NotFound) => Ok(()),
        Ok(snapshot) => Err(AssertionError::ExpectedAbsent(snapshot.identity)),
        Err(e) => Err(AssertionError::Unexpected(e)),
    }
}

/// Destroy check over every tracked resource of the client's type.
pub async fn check_destroy<C>(
    client: &C,
    identities: &[ResourceIdentity],
) -> Result<(), AssertionError>
where
    C: RemoteResourceClient + ?Sized,
{
    for identity in identities {
        debug!(resource_type = client.resource_type(), identity = %identity, "Checking destroyed");
        assert_destroyed(|| client.describe(identity)).await?;
    }
    Ok(())
}

/// Fail unless `key` has exactly `expected` in the snapshot.
pub fn assert_attribute(
    snapshot: &ResourceStateSnapshot,
    key: &str,
    expected: &str,
) -> Result<(), AssertionError> {
    match snapshot.attribute(key) {
        Some(actual) if actual == expected => Ok(()),
        actual => Err(AssertionError::AttributeMismatch {
            key: key.to_string(),
            expected: Some(expected.to_string()),
            actual: actual.map(str::to_string),
        }),
    }
}

/// Compare an imported snapshot with the one the resource was created with.
///
/// Identity and every attribute on either side must match, except keys in
/// `ignore`.
pub fn verify_import(
    created: &ResourceStateSnapshot,
    imported: &ResourceStateSnapshot,
    ignore: &[&str],
) -> Result<(), AssertionError> {
    if created.identity != imported.identity {
        return Err(AssertionError::AttributeMismatch {
            key: "id".to_string(),
            expected: Some(created.identity.to_string()),
            actual: Some(imported.identity.to_string()),
        });
    }

    let keys: BTreeSet<&String> = created
        .attributes
        .keys()
        .chain(imported.attributes.keys())
        .collect();
    for key in keys {
        if ignore.contains(&key.as_str()) {
            continue;
        }
        let expected = created.attributes.get(key);
        let actual = imported.attributes.get(key);
        if expected != actual {
            return Err(AssertionError::AttributeMismatch {
                key: key.clone(),
                expected: expected.cloned(),
                actual: actual.cloned(),
            });
        }
    }
    Ok(())
}

/// Delete a resource directly against the backend, bypassing any
/// reconciler, and wait until reads report it gone.
///
/// Used to simulate an out-of-band deletion in drift scenarios.
pub async fn force_disappearance<C>(
    client: &C,
    identity: &ResourceIdentity,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<(), ReconcileError>
where
    C: RemoteResourceClient + ?Sized,
{
    info!(identity = %identity, "Deleting resource out of band");
    client
        .delete(identity)
        .await
        .map_err(|cause| ReconcileError::Fatal {
            phase: Phase::Delete,
            step: Step::Call,
            cause,
            last_observed: None,
        })?;

    poll_until(policy, cancel, "await-disappearance", || async move {
        match client.describe(identity).await {
            Err(RemoteError::NotFound) => Outcome::Done(()),
            Ok(_) => Outcome::Retry("waiting for resource to disappear".to_string()),
            Err(e) => Outcome::Fail(e),
        }
    })
    .await
    .map_err(|e| ReconcileError::from_poll(Phase::Delete, Step::Verify, e, None))
}
