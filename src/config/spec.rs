//! Configuration specification types for topoform.
//!
//! This module defines all the structs that map to the `topoform.yaml` file.
//! These types are declarative and fully describe the desired topology.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::model::ResourceKind;

/// The root configuration structure for a topoform project.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopologyConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// Target provider settings.
    pub provider: ProviderConfig,
    /// Declared input variables.
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Resources making up the topology.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    /// Declared outputs.
    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Provider selection and connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Which cloud the topology is materialized on.
    pub kind: ProviderKind,
    /// Region or location passed to every API call.
    pub region: String,
    /// API endpoint. `sim` or `sim:<path>` selects the simulated cloud.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Credential source, `env:NAME`.
    #[serde(default)]
    pub credentials: Option<String>,
}

/// Supported cloud providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// AWS-like provider.
    Aws,
    /// GCP-like provider.
    Gcp,
    /// Azure-like provider.
    Azure,
}

/// Declared input variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct VariableDecl {
    /// Value type.
    #[serde(rename = "type", default)]
    pub var_type: VariableType,
    /// Default value; a variable without one is required.
    #[serde(default)]
    pub default: Option<Value>,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Variable value types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    /// Any string.
    #[default]
    String,
    /// Integer or float.
    Number,
    /// `true` or `false`.
    Bool,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 object key. Defaults to `<project>/<environment>/state.json`.
    #[serde(default)]
    pub key: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Configuration for a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Logical id, unique within the topology.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-agnostic attributes; string values may hold `${id.attr}` placeholders.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit ordering dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Declared output.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputConfig {
    /// Output name.
    pub name: String,
    /// Value template, usually a single `${id.attr}` placeholder.
    pub value: String,
    /// Hidden from plain `output` listings when true.
    #[serde(default)]
    pub sensitive: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

fn default_environment() -> String {
    String::from("dev")
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Aws => "aws",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        };
        write!(f, "{s}")
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "gcp" => Ok(Self::Gcp),
            "azure" => Ok(Self::Azure),
            other => Err(format!("Unknown provider: {other}. Expected: aws, gcp, or azure")),
        }
    }
}

impl fmt::Display for VariableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
        };
        write!(f, "{s}")
    }
}

impl TopologyConfig {
    /// Returns the fully qualified project name including environment.
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project.name, self.project.environment)
    }

    /// Returns resource ids in declaration order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }

    /// Returns the S3 key for the state object.
    #[must_use]
    pub fn state_key(&self) -> String {
        self.state.key.clone().unwrap_or_else(|| {
            format!(
                "{}/{}/state.json",
                self.project.name, self.project.environment
            )
        })
    }

    /// Returns the local state directory.
    #[must_use]
    pub fn state_dir(&self) -> String {
        let base = self.state.path.as_deref().unwrap_or(".topoform");
        format!("{}/{}", base.trim_end_matches('/'), self.project.environment)
    }
}

impl ProviderConfig {
    /// Returns true when the simulated cloud is selected.
    #[must_use]
    pub fn is_simulated(&self) -> bool {
        self.endpoint
            .as_deref()
            .is_some_and(|e| e == "sim" || e.starts_with("sim:"))
    }

    /// Returns the persistence file of the simulated cloud, if any.
    #[must_use]
    pub fn simulation_file(&self) -> Option<&str> {
        self.endpoint.as_deref().and_then(|e| e.strip_prefix("sim:"))
    }

    /// Returns the environment variable holding the API token, if configured.
    #[must_use]
    pub fn credentials_env(&self) -> Option<&str> {
        self.credentials.as_deref().and_then(|c| c.strip_prefix("env:"))
    }
}
