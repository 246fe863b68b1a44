//! Spot datafeed subscription client.
//!
//! An account has at most one spot datafeed subscription, so the identity is
//! a fixed id and `create` replaces whatever subscription exists. Delivery
//! goes to an S3 `bucket` with an optional key `prefix`; the backend adds
//! `owner_id` and `state`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use super::RemoteResourceClient;
use super::simulated::SimulatedCloud;
use crate::error::RemoteError;
use crate::snapshot::{ResourceConfig, ResourceIdentity, ResourceStateSnapshot};

pub const RESOURCE_TYPE: &str = "spot_datafeed_subscription";

/// The only identity a subscription ever has.
pub const SUBSCRIPTION_ID: &str = "spot-datafeed-subscription";

/// Error code for a missing subscription.
pub const NOT_FOUND_CODE: &str = "InvalidSpotDatafeed.NotFound";

/// Account id reported as `owner_id`.
const OWNER_ID: &str = "123456789012";

/// Client for the spot datafeed subscription resource.
#[derive(Debug, Clone)]
pub struct SpotDatafeedClient {
    cloud: SimulatedCloud,
}

impl SpotDatafeedClient {
    pub fn new(cloud: SimulatedCloud) -> Self {
        Self { cloud }
    }

    /// Desired config for a subscription delivering into `bucket`.
    pub fn config(bucket: &str, prefix: Option<&str>) -> ResourceConfig {
        let config = ResourceConfig::new(RESOURCE_TYPE).with("bucket", bucket);
        match prefix {
            Some(p) => config.with("prefix", p),
            None => config,
        }
    }

    pub fn identity() -> ResourceIdentity {
        ResourceIdentity::new(SUBSCRIPTION_ID)
    }

    fn check_identity(identity: &ResourceIdentity) -> Result<(), RemoteError> {
        if identity.as_str() != SUBSCRIPTION_ID {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteResourceClient for SpotDatafeedClient {
    fn resource_type(&self) -> &str {
        RESOURCE_TYPE
    }

    async fn create(&self, config: &ResourceConfig) -> Result<ResourceIdentity, RemoteError> {
        let bucket = config.get("bucket").unwrap_or_default();
        if bucket.is_empty() {
            return Err(RemoteError::from_code(
                "InvalidParameterValue",
                "bucket is required",
            ));
        }

        let mut attributes = BTreeMap::new();
        attributes.insert("bucket".to_string(), bucket.to_string());
        if let Some(prefix) = config.get("prefix") {
            attributes.insert("prefix".to_string(), prefix.to_string());
        }
        attributes.insert("owner_id".to_string(), OWNER_ID.to_string());
        attributes.insert("state".to_string(), "Active".to_string());

        debug!(bucket, "Creating spot datafeed subscription");
        self.cloud
            .put(RESOURCE_TYPE, SUBSCRIPTION_ID, attributes)
            .await?;
        Ok(Self::identity())
    }

    async fn describe(
        &self,
        identity: &ResourceIdentity,
    ) -> Result<ResourceStateSnapshot, RemoteError> {
        Self::check_identity(identity)?;
        match self.cloud.get(RESOURCE_TYPE, SUBSCRIPTION_ID).await? {
            Some(attributes) => Ok(ResourceStateSnapshot::new(
                identity.clone(),
                RESOURCE_TYPE,
                attributes,
            )),
            None => Err(RemoteError::from_code(
                NOT_FOUND_CODE,
                "the spot datafeed subscription does not exist",
            )),
        }
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<(), RemoteError> {
        Self::check_identity(identity)?;
        let removed = self.cloud.remove(RESOURCE_TYPE, SUBSCRIPTION_ID).await?;
        if !removed {
            debug!("Spot datafeed subscription already absent");
        }
        Ok(())
    }
}
