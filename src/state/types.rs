//! State types for tracking provisioned resources.
//!
//! These types represent the recorded state of a topology: which remote
//! objects back each logical resource, and what was last applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::config::ProviderKind;
use crate::model::ResourceKind;
use crate::outputs::Output;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1";

/// Number of history entries kept in a snapshot.
pub const MAX_HISTORY: usize = 50;

/// The complete recorded state of one project environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Identity of this state's history; a fresh state gets a new lineage.
    pub lineage: String,
    /// Write counter, incremented by every commit.
    pub serial: u64,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Provider the bindings live on.
    #[serde(default)]
    pub provider: Option<ProviderKind>,
    /// Bindings keyed by logical resource id.
    #[serde(default)]
    pub bindings: BTreeMap<String, ProviderBinding>,
    /// Outputs computed by the last successful apply.
    #[serde(default)]
    pub outputs: Vec<Output>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Recent operations.
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Link between a logical resource and the remote objects backing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderBinding {
    /// Logical resource id.
    pub resource_id: String,
    /// Resource kind when applied.
    pub kind: ResourceKind,
    /// Provider holding the remote objects.
    pub provider: ProviderKind,
    /// Identifier of the primary remote object; absent until created.
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Attributes exposed by the remote object (endpoints, ports, ...).
    #[serde(default)]
    pub remote_attributes: BTreeMap<String, Value>,
    /// Hash of the desired form last applied.
    #[serde(default)]
    pub config_hash: String,
    /// Ids this resource referenced when applied.
    #[serde(default)]
    pub references: BTreeSet<String>,
    /// Whether creation completed.
    pub status: BindingStatus,
    /// Every remote object making up the resource, in creation order.
    #[serde(default)]
    pub components: Vec<RemoteComponent>,
    /// When the binding was first created.
    pub created_at: DateTime<Utc>,
    /// When the binding was last updated.
    pub updated_at: DateTime<Utc>,
}

/// One remote object of a resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteComponent {
    /// API path of the object type (e.g. `ec2/vpc`).
    pub path: String,
    /// Remote identifier.
    pub id: String,
}

/// Binding lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindingStatus {
    /// Every remote object exists.
    Created,
    /// A composite create stopped part way; components must be cleaned up.
    Partial,
}

/// A single entry in the state history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the operation finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: Operation,
    /// Change set that was applied.
    pub change_set_id: String,
    /// Resources whose change succeeded.
    pub succeeded: Vec<String>,
    /// Resources whose change failed.
    #[serde(default)]
    pub failed: Vec<String>,
    /// Whether the operation succeeded.
    pub success: bool,
}

/// Types of state-changing operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Apply of the configured topology.
    Apply,
    /// Apply of an empty topology.
    Destroy,
}

impl StateSnapshot {
    /// Creates a new empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            lineage: Uuid::new_v4().to_string(),
            serial: 0,
            project: project.to_string(),
            environment: environment.to_string(),
            provider: None,
            bindings: BTreeMap::new(),
            outputs: Vec::new(),
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a binding by resource id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ProviderBinding> {
        self.bindings.get(id)
    }

    /// Adds or replaces a binding.
    pub fn set_binding(&mut self, binding: ProviderBinding) {
        self.bindings.insert(binding.resource_id.clone(), binding);
        self.last_updated = Utc::now();
    }

    /// Removes a binding.
    pub fn remove_binding(&mut self, id: &str) -> Option<ProviderBinding> {
        let result = self.bindings.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
    }

    /// Returns `project/environment`.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project, self.environment)
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

impl ProviderBinding {
    /// Creates a binding that has no remote object yet.
    #[must_use]
    pub fn new(resource_id: &str, kind: ResourceKind, provider: ProviderKind) -> Self {
        let now = Utc::now();
        Self {
            resource_id: resource_id.to_string(),
            kind,
            provider,
            remote_id: None,
            remote_attributes: BTreeMap::new(),
            config_hash: String::new(),
            references: BTreeSet::new(),
            status: BindingStatus::Created,
            components: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the primary remote object exists.
    #[must_use]
    pub fn is_created(&self) -> bool {
        self.remote_id.is_some() && self.status == BindingStatus::Created
    }

    /// Returns true if remote objects may be left over from an earlier attempt.
    #[must_use]
    pub fn has_leftovers(&self) -> bool {
        !self.components.is_empty()
    }

    /// Records an additional remote object.
    pub fn push_component(&mut self, path: &str, id: &str) {
        self.components.push(RemoteComponent {
            path: path.to_string(),
            id: id.to_string(),
        });
        self.updated_at = Utc::now();
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(
        operation: Operation,
        change_set_id: &str,
        succeeded: Vec<String>,
        failed: Vec<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            change_set_id: change_set_id.to_string(),
            success: failed.is_empty(),
            succeeded,
            failed,
        }
    }
}

impl std::fmt::Display for BindingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Created => "created",
            Self::Partial => "partial",
        };
        write!(f, "{status}")
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}
