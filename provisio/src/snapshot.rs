//! Resource identity, desired config and observed state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Backend-assigned identifier. The empty id means "not created" or "deleted".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIdentity(String);

impl ResourceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The unset sentinel.
    pub fn unset() -> Self {
        Self(String::new())
    }

    pub fn is_set(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<unset>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Desired configuration for one managed resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfig {
    pub resource_type: String,
    pub attributes: BTreeMap<String, String>,
}

impl ResourceConfig {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Last observed remote state of one resource.
///
/// Only a successful describe produces a snapshot; a missing resource is a
/// `RemoteError::NotFound`, never an empty snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStateSnapshot {
    pub identity: ResourceIdentity,
    pub resource_type: String,
    pub attributes: BTreeMap<String, String>,
    pub observed_at: DateTime<Utc>,
}

impl ResourceStateSnapshot {
    pub fn new(
        identity: ResourceIdentity,
        resource_type: impl Into<String>,
        attributes: BTreeMap<String, String>,
    ) -> Self {
        Self {
            identity,
            resource_type: resource_type.into(),
            attributes,
            observed_at: Utc::now(),
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// First desired attribute whose observed value differs, if any.
    pub fn first_mismatch<'a>(&self, config: &'a ResourceConfig) -> Option<&'a str> {
        config
            .attributes
            .iter()
            .find(|(k, v)| self.attributes.get(*k) != Some(*v))
            .map(|(k, _)| k.as_str())
    }

    /// Whether every desired attribute is reflected in this snapshot.
    pub fn satisfies(&self, config: &ResourceConfig) -> bool {
        self.first_mismatch(config).is_none()
    }
}
