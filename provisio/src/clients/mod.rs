//! Clients for remote resource backends.
//!
//! The reconciler only talks to backends through [`RemoteResourceClient`]:
//! - `simulated`: in-process eventually-consistent cloud with a shared rate
//!   limit and fault injection, plus a generic client over it
//! - `spot_datafeed`: the spot datafeed subscription resource

pub mod simulated;
pub mod spot_datafeed;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::snapshot::{ResourceConfig, ResourceIdentity, ResourceStateSnapshot};

pub use simulated::{SimulatedClient, SimulatedCloud, SimulatedCloudConfig};
pub use spot_datafeed::SpotDatafeedClient;

/// Create / describe / delete against one resource type.
///
/// Implementations own idempotency of the mutating calls: `create` on a
/// resource that already exists with the same config and `delete` on a
/// resource that is already gone must both succeed. The reconciler calls each
/// at most once per transition attempt (throttled requests excepted) and
/// only retries `describe`.
#[async_trait]
pub trait RemoteResourceClient: Send + Sync {
    /// Resource type name, e.g. `spot_datafeed_subscription`.
    fn resource_type(&self) -> &str;

    /// Create the resource and return its backend-assigned identity.
    async fn create(&self, config: &ResourceConfig) -> Result<ResourceIdentity, RemoteError>;

    /// Read current state. A missing resource is `RemoteError::NotFound`.
    async fn describe(
        &self,
        identity: &ResourceIdentity,
    ) -> Result<ResourceStateSnapshot, RemoteError>;

    /// Delete the resource.
    async fn delete(&self, identity: &ResourceIdentity) -> Result<(), RemoteError>;
}
