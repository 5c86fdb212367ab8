//! Provider-agnostic resource descriptions.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::interpolate;
use crate::config::ResourceConfig;

/// Kinds of infrastructure objects a topology can declare.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Private network (VPC / VNet).
    Network,
    /// Address range inside a network.
    Subnet,
    /// Managed relational database.
    Database,
    /// Managed in-memory cache.
    Cache,
    /// Long-running container service.
    ComputeService,
    /// Secret container.
    SecretStore,
    /// Public entry point in front of a compute service.
    LoadBalancer,
    /// Log sink with a retention policy.
    LogGroup,
}

impl ResourceKind {
    /// Every kind, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Network,
        Self::Subnet,
        Self::Database,
        Self::Cache,
        Self::ComputeService,
        Self::SecretStore,
        Self::LoadBalancer,
        Self::LogGroup,
    ];

    /// Returns the configuration name of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Subnet => "subnet",
            Self::Database => "database",
            Self::Cache => "cache",
            Self::ComputeService => "compute_service",
            Self::SecretStore => "secret_store",
            Self::LoadBalancer => "load_balancer",
            Self::LogGroup => "log_group",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One infrastructure object in the desired topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    /// Logical id.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-agnostic attributes.
    pub attributes: BTreeMap<String, Value>,
    /// Ids this resource depends on, implicit and explicit.
    pub references: BTreeSet<String>,
}

impl Resource {
    /// Creates a resource without attributes.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            attributes: BTreeMap::new(),
            references: BTreeSet::new(),
        }
    }

    /// Sets an attribute, recording any placeholder it references.
    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        self.references.extend(references_in(&value));
        self.attributes.insert(key.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.references.insert(id.into());
        self
    }

    /// Builds a resource from its configuration entry.
    #[must_use]
    pub fn from_config(config: &ResourceConfig) -> Self {
        let mut references: BTreeSet<String> = config.depends_on.iter().cloned().collect();
        for value in config.attributes.values() {
            references.extend(references_in(value));
        }

        Self {
            id: config.id.clone(),
            kind: config.kind,
            attributes: config.attributes.clone(),
            references,
        }
    }

    /// Returns an attribute as a string slice.
    #[must_use]
    pub fn str_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

/// Returns the resource ids referenced by placeholders inside a value.
///
/// `${var.*}` placeholders are variables, not resources, and are skipped.
#[must_use]
pub fn references_in(value: &Value) -> BTreeSet<String> {
    let mut found = Vec::new();
    interpolate::collect(value, &mut found);
    found
        .into_iter()
        .filter(|p| p.target != interpolate::VARIABLE_NAMESPACE)
        .map(|p| p.target)
        .collect()
}

/// Checks a logical id: lowercase alphanumeric, `-` or `_`, starting with a letter.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
