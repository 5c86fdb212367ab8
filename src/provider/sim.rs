//! Simulated control plane.
//!
//! Objects get deterministic ids and a synthetic hostname. Faults can be
//! injected per operation, path and object name, and the whole cloud can be
//! persisted to a JSON file so separate CLI runs see the same objects.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::ProviderResult;
use super::api::{ApiCall, CloudApi, RemoteObject};
use crate::config::ProviderKind;
use crate::error::ProviderError;

/// Operation kinds recorded and matched by the simulated cloud.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOp {
    /// Object creation.
    Create,
    /// Object lookup.
    Describe,
    /// Object modification.
    Modify,
    /// Object deletion.
    Delete,
}

/// Error returned by an injected fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultKind {
    /// Rate limiting with no wait.
    Throttle,
    /// Service outage.
    Unavailable,
    /// Rejected credentials.
    Unauthorized,
    /// Permanent rejection with a message.
    Rejected(String),
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    op: SimOp,
    path_prefix: String,
    name: Option<String>,
    kind: FaultKind,
    remaining: Option<u32>,
}

/// One call observed by the simulated cloud.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    /// Operation.
    pub op: SimOp,
    /// Object type path.
    pub path: String,
    /// Object name, when known.
    pub name: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SimState {
    next_id: u64,
    objects: BTreeMap<String, RemoteObject>,
    #[serde(skip)]
    faults: Vec<Fault>,
    #[serde(skip)]
    calls: Vec<SimCall>,
}

/// In-process control plane used for tests and dry runs.
#[derive(Debug)]
pub struct SimulatedCloud {
    provider: ProviderKind,
    region: String,
    persist: Option<PathBuf>,
    state: Mutex<SimState>,
}

impl Fault {
    /// Fails every `op` on paths starting with `path_prefix`.
    #[must_use]
    pub fn on(op: SimOp, path_prefix: &str) -> Self {
        Self {
            op,
            path_prefix: path_prefix.to_string(),
            name: None,
            kind: FaultKind::Rejected(String::from("injected failure")),
            remaining: None,
        }
    }

    /// Restricts the fault to objects with this name.
    #[must_use]
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Sets the error returned.
    #[must_use]
    pub fn with(mut self, kind: FaultKind) -> Self {
        self.kind = kind;
        self
    }

    /// Fires only `n` times.
    #[must_use]
    pub const fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, op: SimOp, path: &str, name: Option<&str>) -> bool {
        self.op == op
            && path.starts_with(&self.path_prefix)
            && self.remaining != Some(0)
            && self.name.as_deref().is_none_or(|n| Some(n) == name)
    }

    fn error(&self, provider: ProviderKind) -> ProviderError {
        match &self.kind {
            FaultKind::Throttle => ProviderError::Throttled {
                provider,
                retry_after_secs: 0,
            },
            FaultKind::Unavailable => ProviderError::unavailable(provider, "simulated outage"),
            FaultKind::Unauthorized => ProviderError::Unauthorized {
                provider,
                message: String::from("simulated credential rejection"),
            },
            FaultKind::Rejected(message) => ProviderError::api(provider, 400, message.clone()),
        }
    }
}

impl SimState {
    fn check_fault(
        &mut self,
        provider: ProviderKind,
        op: SimOp,
        path: &str,
        name: Option<&str>,
    ) -> ProviderResult<()> {
        self.calls.push(SimCall {
            op,
            path: path.to_string(),
            name: name.map(str::to_string),
        });

        let Some(fault) = self.faults.iter_mut().find(|f| f.matches(op, path, name)) else {
            return Ok(());
        };
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        debug!("Injected fault on {op:?} {path}");
        Err(fault.error(provider))
    }

    fn object_name(&self, id: &str) -> Option<String> {
        self.objects
            .get(id)
            .and_then(|o| o.attributes.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

fn type_prefix(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

impl SimulatedCloud {
    /// Creates an empty in-memory cloud.
    #[must_use]
    pub fn new(provider: ProviderKind, region: &str) -> Self {
        Self {
            provider,
            region: region.to_string(),
            persist: None,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Opens a cloud persisted to `file`, starting empty if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn open(provider: ProviderKind, region: &str, file: &str) -> ProviderResult<Self> {
        let path = PathBuf::from(file);
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|e| ProviderError::InvalidResponse {
                    provider,
                    message: format!("Corrupt simulation file {file}: {e}"),
                })?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SimState::default(),
            Err(e) => {
                return Err(ProviderError::unavailable(
                    provider,
                    format!("Cannot read simulation file {file}: {e}"),
                ));
            }
        };

        Ok(Self {
            provider,
            region: region.to_string(),
            persist: Some(path),
            state: Mutex::new(state),
        })
    }

    /// Registers a fault.
    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    /// Removes every injected fault.
    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Returns every call observed so far.
    pub async fn calls(&self) -> Vec<SimCall> {
        self.state.lock().await.calls.clone()
    }

    /// Returns every live object.
    pub async fn objects(&self) -> Vec<RemoteObject> {
        self.state.lock().await.objects.values().cloned().collect()
    }

    /// Changes an attribute behind the adapters' back.
    pub async fn tamper(&self, id: &str, key: &str, value: Value) -> bool {
        let mut state = self.state.lock().await;
        match state.objects.get_mut(id) {
            Some(object) => {
                object.attributes.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Deletes an object behind the adapters' back.
    pub async fn remove(&self, id: &str) -> bool {
        self.state.lock().await.objects.remove(id).is_some()
    }

    async fn save(&self, state: &SimState) -> ProviderResult<()> {
        let Some(path) = &self.persist else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(state).map_err(|e| {
            ProviderError::unavailable(self.provider, format!("Cannot encode simulation: {e}"))
        })?;
        tokio::fs::write(path, content).await.map_err(|e| {
            warn!("Failed to persist simulation to {}: {e}", path.display());
            ProviderError::unavailable(self.provider, format!("Cannot write simulation: {e}"))
        })
    }

    fn hostname(&self, name: &str, serial: u64) -> String {
        format!(
            "{}-{serial}.{}.{}.sim.internal",
            name.replace('_', "-"),
            self.region,
            self.provider
        )
    }
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    fn provider(&self) -> ProviderKind {
        self.provider
    }

    fn region(&self) -> &str {
        &self.region
    }

    async fn create(&self, call: &ApiCall) -> ProviderResult<RemoteObject> {
        let mut state = self.state.lock().await;
        state.check_fault(self.provider, SimOp::Create, &call.path, call.name())?;

        state.next_id += 1;
        let serial = state.next_id;
        let id = format!("{}-{serial:06}", type_prefix(&call.path));
        let mut attributes = call.params.clone();
        let name = call.name().unwrap_or(&id).to_string();
        attributes.insert(
            String::from("hostname"),
            Value::String(self.hostname(&name, serial)),
        );

        let object = RemoteObject {
            id: id.clone(),
            path: call.path.clone(),
            attributes,
        };
        state.objects.insert(id, object.clone());
        self.save(&state).await?;
        Ok(object)
    }

    async fn describe(&self, path: &str, id: &str) -> ProviderResult<Option<RemoteObject>> {
        let mut state = self.state.lock().await;
        let name = state.object_name(id);
        state.check_fault(self.provider, SimOp::Describe, path, name.as_deref())?;
        Ok(state.objects.get(id).filter(|o| o.path == path).cloned())
    }

    async fn modify(
        &self,
        path: &str,
        id: &str,
        params: &BTreeMap<String, Value>,
    ) -> ProviderResult<RemoteObject> {
        let mut state = self.state.lock().await;
        let name = state.object_name(id);
        state.check_fault(self.provider, SimOp::Modify, path, name.as_deref())?;

        let Some(object) = state.objects.get_mut(id).filter(|o| o.path == path) else {
            return Err(ProviderError::NotFound {
                provider: self.provider,
                remote_id: id.to_string(),
            });
        };
        for (key, value) in params {
            object.attributes.insert(key.clone(), value.clone());
        }
        let object = object.clone();
        self.save(&state).await?;
        Ok(object)
    }

    async fn delete(&self, path: &str, id: &str) -> ProviderResult<()> {
        let mut state = self.state.lock().await;
        let name = state.object_name(id);
        state.check_fault(self.provider, SimOp::Delete, path, name.as_deref())?;

        if state.objects.get(id).is_none_or(|o| o.path != path) {
            return Err(ProviderError::NotFound {
                provider: self.provider,
                remote_id: id.to_string(),
            });
        }
        state.objects.remove(id);
        self.save(&state).await
    }
}
