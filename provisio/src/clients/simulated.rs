//! In-process simulated cloud.
//!
//! Models the parts of a real backend the reconciler has to cope with:
//! - writes become visible to reads only after a configurable delay
//! - a request-rate budget shared by every client of the same cloud
//! - injected faults for the next call of a given operation
//! - out-of-band changes (deletes and attribute edits) behind the
//!   reconciler's back

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use super::RemoteResourceClient;
use crate::error::RemoteError;
use crate::snapshot::{ResourceConfig, ResourceIdentity, ResourceStateSnapshot};

/// Error code returned when the shared rate budget is exhausted.
pub const THROTTLE_CODE: &str = "RequestLimitExceeded";

/// Backend operations that can be faulted or counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Put,
    Get,
    Remove,
}

/// Raw backend error before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

impl From<ApiError> for RemoteError {
    fn from(e: ApiError) -> Self {
        RemoteError::from_code(&e.code, &e.message)
    }
}

/// Tunables for the simulated backend.
#[derive(Debug, Clone)]
pub struct SimulatedCloudConfig {
    /// Delay before a created record is visible to reads
    pub create_visibility_delay: Duration,
    /// Delay before a deleted record disappears from reads
    pub delete_visibility_delay: Duration,
    /// Requests per second across all clients (None = unlimited)
    pub requests_per_second: Option<u32>,
}

impl Default for SimulatedCloudConfig {
    fn default() -> Self {
        Self {
            create_visibility_delay: Duration::ZERO,
            delete_visibility_delay: Duration::ZERO,
            requests_per_second: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    attributes: BTreeMap<String, String>,
    visible_at: Instant,
    gone_at: Option<Instant>,
}

impl Record {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at && self.gone_at.map_or(true, |gone| now < gone)
    }

    fn is_deleted(&self) -> bool {
        self.gone_at.is_some()
    }
}

#[derive(Debug)]
struct RateBudget {
    capacity: u32,
    tokens: u32,
    window_start: Instant,
}

impl RateBudget {
    fn new(capacity: u32) -> Self {
        Self {
            capacity,
            tokens: capacity,
            window_start: Instant::now(),
        }
    }

    fn try_take(&mut self, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= Duration::from_secs(1) {
            self.window_start = now;
            self.tokens = self.capacity;
        }
        if self.tokens == 0 {
            return false;
        }
        self.tokens -= 1;
        true
    }
}

#[derive(Debug, Default)]
struct CloudState {
    records: HashMap<(String, String), Record>,
    faults: HashMap<Operation, VecDeque<ApiError>>,
    calls: HashMap<Operation, u32>,
    budget: Option<RateBudget>,
}

impl CloudState {
    /// Count the call, then apply the rate budget and any injected fault.
    fn admit(&mut self, op: Operation, now: Instant) -> Result<(), ApiError> {
        *self.calls.entry(op).or_default() += 1;
        if let Some(budget) = self.budget.as_mut() {
            if !budget.try_take(now) {
                return Err(ApiError::new(THROTTLE_CODE, "request rate exceeded"));
            }
        }
        if let Some(fault) = self.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(fault);
        }
        Ok(())
    }

    /// Drop deleted records whose disappearance is already visible.
    fn purge(&mut self, now: Instant) {
        self.records
            .retain(|_, r| r.gone_at.map_or(true, |gone| now < gone));
    }
}

/// Shared, eventually-consistent record store.
///
/// Cheap to clone; all clones see the same records and rate budget.
#[derive(Debug, Clone)]
pub struct SimulatedCloud {
    config: SimulatedCloudConfig,
    state: Arc<Mutex<CloudState>>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new(SimulatedCloudConfig::default())
    }
}

impl SimulatedCloud {
    pub fn new(config: SimulatedCloudConfig) -> Self {
        let state = CloudState {
            budget: config.requests_per_second.map(RateBudget::new),
            ..Default::default()
        };
        Self {
            config,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn config(&self) -> &SimulatedCloudConfig {
        &self.config
    }

    /// Create or replace a record. A replaced live record keeps its visibility.
    pub async fn put(
        &self,
        resource_type: &str,
        id: &str,
        attributes: BTreeMap<String, String>,
    ) -> Result<(), ApiError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.admit(Operation::Put, now)?;

        let key = (resource_type.to_string(), id.to_string());
        match state.records.get_mut(&key) {
            Some(record) if !record.is_deleted() => record.attributes = attributes,
            _ => {
                debug!(resource_type, id, "Simulated put");
                state.records.insert(
                    key,
                    Record {
                        attributes,
                        visible_at: now + self.config.create_visibility_delay,
                        gone_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    /// Read a record. `Ok(None)` when it does not exist or is not visible yet.
    pub async fn get(
        &self,
        resource_type: &str,
        id: &str,
    ) -> Result<Option<BTreeMap<String, String>>, ApiError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.admit(Operation::Get, now)?;
        state.purge(now);

        Ok(state
            .records
            .get(&(resource_type.to_string(), id.to_string()))
            .filter(|r| r.is_visible(now))
            .map(|r| r.attributes.clone()))
    }

    /// Schedule a record for deletion. Returns `false` if there was nothing
    /// to delete.
    pub async fn remove(&self, resource_type: &str, id: &str) -> Result<bool, ApiError> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.admit(Operation::Remove, now)?;
        state.purge(now);

        let key = (resource_type.to_string(), id.to_string());
        match state.records.get_mut(&key) {
            Some(record) if !record.is_deleted() => {
                debug!(resource_type, id, "Simulated remove");
                record.gone_at = Some(now + self.config.delete_visibility_delay);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Ids of live (not deleted) records of a type, visible or not.
    pub async fn list(&self, resource_type: &str) -> Vec<String> {
        let mut state = self.state.lock().await;
        state.purge(Instant::now());
        let mut ids: Vec<String> = state
            .records
            .iter()
            .filter(|((t, _), r)| t == resource_type && !r.is_deleted())
            .map(|((_, id), _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Make the next call of `op` fail with `error`. Faults queue up in order.
    pub async fn inject_fault(&self, op: Operation, error: ApiError) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(error);
    }

    /// Number of calls of `op` seen so far, including rejected ones.
    pub async fn call_count(&self, op: Operation) -> u32 {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or(0)
    }

    /// Delete a record immediately, bypassing rate limits and faults.
    pub async fn delete_out_of_band(&self, resource_type: &str, id: &str) -> bool {
        let mut state = self.state.lock().await;
        state
            .records
            .remove(&(resource_type.to_string(), id.to_string()))
            .is_some()
    }

    /// Change one attribute of a live record, bypassing rate limits and faults.
    pub async fn modify_out_of_band(
        &self,
        resource_type: &str,
        id: &str,
        key: &str,
        value: &str,
    ) -> bool {
        let mut state = self.state.lock().await;
        match state
            .records
            .get_mut(&(resource_type.to_string(), id.to_string()))
        {
            Some(record) if !record.is_deleted() => {
                record
                    .attributes
                    .insert(key.to_string(), value.to_string());
                true
            }
            _ => false,
        }
    }
}

/// Generic client over the simulated cloud.
///
/// Identities are random UUIDs; attributes are stored as given.
#[derive(Debug, Clone)]
pub struct SimulatedClient {
    cloud: SimulatedCloud,
    resource_type: String,
}

impl SimulatedClient {
    pub fn new(cloud: SimulatedCloud, resource_type: impl Into<String>) -> Self {
        Self {
            cloud,
            resource_type: resource_type.into(),
        }
    }

    pub fn cloud(&self) -> &SimulatedCloud {
        &self.cloud
    }
}

#[async_trait]
impl RemoteResourceClient for SimulatedClient {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    async fn create(&self, config: &ResourceConfig) -> Result<ResourceIdentity, RemoteError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.cloud
            .put(&self.resource_type, &id, config.attributes.clone())
            .await?;
        Ok(ResourceIdentity::new(id))
    }

    async fn describe(
        &self,
        identity: &ResourceIdentity,
    ) -> Result<ResourceStateSnapshot, RemoteError> {
        match self.cloud.get(&self.resource_type, identity.as_str()).await? {
            Some(attributes) => Ok(ResourceStateSnapshot::new(
                identity.clone(),
                &self.resource_type,
                attributes,
            )),
            None => Err(RemoteError::NotFound),
        }
    }

    async fn delete(&self, identity: &ResourceIdentity) -> Result<(), RemoteError> {
        // Already gone counts as deleted.
        self.cloud
            .remove(&self.resource_type, identity.as_str())
            .await?;
        Ok(())
    }
}
