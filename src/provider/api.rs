//! Transport between adapters and a cloud's control plane.
//!
//! Every provider is reached through the same four verbs on typed object
//! paths (`ec2/vpc`, `sql/instances`, ...). The HTTP gateway and the
//! simulated cloud both implement [`CloudApi`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::ProviderResult;
use crate::config::ProviderKind;

/// A create request for one remote object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiCall {
    /// Object type path.
    pub path: String,
    /// Provider-specific parameters.
    pub params: BTreeMap<String, Value>,
}

/// A remote object as reported by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Remote identifier.
    pub id: String,
    /// Object type path.
    pub path: String,
    /// Current attributes, including any the provider assigned (`hostname`).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// Control-plane operations used by provider adapters.
#[async_trait]
pub trait CloudApi: Send + Sync + std::fmt::Debug {
    /// Provider this API belongs to.
    fn provider(&self) -> ProviderKind;

    /// Region every call targets.
    fn region(&self) -> &str;

    /// Creates an object.
    async fn create(&self, call: &ApiCall) -> ProviderResult<RemoteObject>;

    /// Describes an object; `None` when it does not exist.
    async fn describe(&self, path: &str, id: &str) -> ProviderResult<Option<RemoteObject>>;

    /// Changes parameters of an existing object.
    async fn modify(
        &self,
        path: &str,
        id: &str,
        params: &BTreeMap<String, Value>,
    ) -> ProviderResult<RemoteObject>;

    /// Deletes an object; `ProviderError::NotFound` when it does not exist.
    async fn delete(&self, path: &str, id: &str) -> ProviderResult<()>;
}

impl ApiCall {
    /// Creates a call with no parameters.
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Adds a parameter when a value is present.
    #[must_use]
    pub fn param_opt(self, key: &str, value: Option<impl Into<Value>>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    /// Returns the `name` parameter, if any.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.params.get("name").and_then(Value::as_str)
    }
}

impl RemoteObject {
    /// Returns the provider-assigned hostname, if any.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.attributes.get("hostname").and_then(Value::as_str)
    }
}
