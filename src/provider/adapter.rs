//! The adapter interface and the step-driven implementation shared by
//! every cloud.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::ProviderResult;
use super::api::{CloudApi, RemoteObject};
use super::common::{
    RetryPolicy, Step, carried_attributes, exposed_attributes, with_retry,
};
use crate::config::ProviderKind;
use crate::error::ProviderError;
use crate::model::Resource;
use crate::state::{BindingStatus, ProviderBinding};

/// Lifecycle operations of one cloud.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider this adapter targets.
    fn kind(&self) -> ProviderKind;

    /// Provider-specific desired attributes of the primary remote object.
    ///
    /// Pure; used to compare desired and observed attributes.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedConfiguration` if the resource cannot be expressed.
    fn normalize(&self, resource: &Resource) -> ProviderResult<BTreeMap<String, Value>>;

    /// Creates every remote object of a resource.
    ///
    /// # Errors
    ///
    /// Returns `PartialFailure` carrying the objects created so far when a
    /// later step of a composite create fails.
    async fn create(&self, resource: &Resource) -> ProviderResult<ProviderBinding>;

    /// Reads the primary object; `None` when it no longer exists.
    async fn read(&self, binding: &ProviderBinding) -> ProviderResult<Option<ProviderBinding>>;

    /// Updates the remote objects in place, replacing them when the layout
    /// of the resource changed.
    async fn update(
        &self,
        binding: &ProviderBinding,
        resource: &Resource,
    ) -> ProviderResult<ProviderBinding>;

    /// Deletes every remote object of a binding, newest first.
    async fn destroy(&self, binding: &ProviderBinding) -> ProviderResult<()>;
}

/// Provider-specific translation of resources into API calls.
pub trait Translator: Send + Sync + 'static {
    /// Provider the calls target.
    const PROVIDER: ProviderKind;

    /// Returns the ordered steps creating `resource`; exactly one is primary.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedConfiguration` for attributes this cloud cannot express.
    fn translate(&self, resource: &Resource, region: &str) -> ProviderResult<Vec<Step>>;

    /// Reference handed out for a secret store.
    fn secret_reference(&self, resource: &Resource, remote_id: &str, region: &str) -> String;
}

/// Adapter running a translator's steps against a control plane.
#[derive(Debug, Clone)]
pub struct CloudAdapter<T> {
    translator: T,
    api: Arc<dyn CloudApi>,
    retry: RetryPolicy,
}

impl<T: Translator> CloudAdapter<T> {
    /// Creates an adapter with the default retry policy.
    #[must_use]
    pub fn new(translator: T, api: Arc<dyn CloudApi>) -> Self {
        Self {
            translator,
            api,
            retry: RetryPolicy::default(),
        }
    }

    /// Replaces the retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn steps(&self, resource: &Resource) -> ProviderResult<Vec<Step>> {
        let steps = self.translator.translate(resource, self.api.region())?;
        if steps.iter().filter(|s| s.primary).count() == 1 {
            Ok(steps)
        } else {
            Err(ProviderError::InvalidResponse {
                provider: T::PROVIDER,
                message: format!("translation of '{}' has no single primary object", resource.id),
            })
        }
    }

    fn attributes(
        &self,
        resource: &Resource,
        object: &RemoteObject,
    ) -> ProviderResult<BTreeMap<String, Value>> {
        let reference = self
            .translator
            .secret_reference(resource, &object.id, self.api.region());
        let carried = carried_attributes(resource, Some(reference))?;
        exposed_attributes(T::PROVIDER, resource.kind, object, &carried)
    }

    fn primary_path<'a>(&self, binding: &'a ProviderBinding, remote_id: &str) -> ProviderResult<&'a str> {
        binding
            .components
            .iter()
            .find(|c| c.id == remote_id)
            .map(|c| c.path.as_str())
            .ok_or_else(|| ProviderError::InvalidResponse {
                provider: T::PROVIDER,
                message: format!(
                    "binding of '{}' does not list its primary object {remote_id}",
                    binding.resource_id
                ),
            })
    }
}

#[async_trait]
impl<T: Translator> ProviderAdapter for CloudAdapter<T> {
    fn kind(&self) -> ProviderKind {
        T::PROVIDER
    }

    fn normalize(&self, resource: &Resource) -> ProviderResult<BTreeMap<String, Value>> {
        let steps = self.steps(resource)?;
        Ok(steps
            .into_iter()
            .find(|s| s.primary)
            .map(|s| s.call.params)
            .unwrap_or_default())
    }

    async fn create(&self, resource: &Resource) -> ProviderResult<ProviderBinding> {
        let steps = self.steps(resource)?;
        let mut binding = ProviderBinding::new(&resource.id, resource.kind, T::PROVIDER);
        binding.references = resource.references.clone();

        let mut previous: Option<String> = None;
        let mut primary: Option<RemoteObject> = None;

        for (index, step) in steps.into_iter().enumerate() {
            let mut call = step.call;
            if let (Some(param), Some(id)) = (step.link, &previous) {
                call.params.insert(param.to_string(), Value::String(id.clone()));
            }

            debug!("Creating {} for {}", call.path, resource.id);
            let result = with_retry(&self.retry, &call.path, || self.api.create(&call)).await;
            let object = match result {
                Ok(object) => object,
                Err(e) if index == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        "Step {} ({}) of '{}' failed after {} objects were created",
                        index + 1,
                        call.path,
                        resource.id,
                        binding.components.len()
                    );
                    binding.status = BindingStatus::Partial;
                    return Err(ProviderError::PartialFailure {
                        resource: resource.id.clone(),
                        binding: Box::new(binding),
                        source: Box::new(e),
                    });
                }
            };

            binding.push_component(&object.path, &object.id);
            previous = Some(object.id.clone());
            if step.primary {
                primary = Some(object);
            }
        }

        let primary = primary.ok_or_else(|| ProviderError::InvalidResponse {
            provider: T::PROVIDER,
            message: format!("no primary object created for '{}'", resource.id),
        })?;

        binding.remote_attributes = self.attributes(resource, &primary)?;
        binding.remote_id = Some(primary.id);
        binding.status = BindingStatus::Created;
        info!("Created {} '{}' on {}", resource.kind, resource.id, T::PROVIDER);
        Ok(binding)
    }

    async fn read(&self, binding: &ProviderBinding) -> ProviderResult<Option<ProviderBinding>> {
        let Some(remote_id) = binding.remote_id.as_deref() else {
            return Ok(None);
        };
        let path = self.primary_path(binding, remote_id)?;

        let described =
            with_retry(&self.retry, path, || self.api.describe(path, remote_id)).await?;
        let Some(object) = described else {
            debug!("{} {remote_id} of '{}' no longer exists", path, binding.resource_id);
            return Ok(None);
        };

        let mut observed = binding.clone();
        observed.remote_attributes =
            exposed_attributes(T::PROVIDER, binding.kind, &object, &binding.remote_attributes)?;
        Ok(Some(observed))
    }

    async fn update(
        &self,
        binding: &ProviderBinding,
        resource: &Resource,
    ) -> ProviderResult<ProviderBinding> {
        if binding.remote_id.is_none() {
            return Err(ProviderError::NotFound {
                provider: T::PROVIDER,
                remote_id: resource.id.clone(),
            });
        }
        let steps = self.steps(resource)?;

        let same_layout = steps.len() == binding.components.len()
            && steps
                .iter()
                .zip(&binding.components)
                .all(|(step, component)| step.call.path == component.path);
        if !same_layout {
            info!("Remote layout of '{}' changed, replacing it", resource.id);
            self.destroy(binding).await?;
            return match self.create(resource).await {
                Err(e) if !matches!(e, ProviderError::PartialFailure { .. }) => {
                    // The old objects are gone; the caller must not keep them.
                    let mut gone = binding.clone();
                    gone.remote_id = None;
                    gone.remote_attributes.clear();
                    gone.components.clear();
                    gone.status = BindingStatus::Partial;
                    Err(ProviderError::PartialFailure {
                        resource: resource.id.clone(),
                        binding: Box::new(gone),
                        source: Box::new(e),
                    })
                }
                other => other,
            };
        }

        let mut primary: Option<RemoteObject> = None;
        for (index, (step, component)) in steps.into_iter().zip(&binding.components).enumerate() {
            let mut params = step.call.params;
            let previous = index.checked_sub(1).and_then(|i| binding.components.get(i));
            if let (Some(param), Some(previous)) = (step.link, previous) {
                params.insert(param.to_string(), Value::String(previous.id.clone()));
            }

            debug!("Updating {} {} for {}", component.path, component.id, resource.id);
            let object = with_retry(&self.retry, &component.path, || {
                self.api.modify(&component.path, &component.id, &params)
            })
            .await?;
            if step.primary {
                primary = Some(object);
            }
        }

        let primary = primary.ok_or_else(|| ProviderError::InvalidResponse {
            provider: T::PROVIDER,
            message: format!("no primary object updated for '{}'", resource.id),
        })?;

        let mut updated = binding.clone();
        updated.kind = resource.kind;
        updated.references = resource.references.clone();
        updated.remote_attributes = self.attributes(resource, &primary)?;
        updated.updated_at = Utc::now();
        info!("Updated {} '{}' on {}", resource.kind, resource.id, T::PROVIDER);
        Ok(updated)
    }

    async fn destroy(&self, binding: &ProviderBinding) -> ProviderResult<()> {
        for component in binding.components.iter().rev() {
            let deleted = with_retry(&self.retry, &component.path, || {
                self.api.delete(&component.path, &component.id)
            })
            .await;
            match deleted {
                Ok(()) => debug!("Deleted {} {}", component.path, component.id),
                Err(ProviderError::NotFound { .. }) => {
                    debug!("{} {} already gone", component.path, component.id);
                }
                Err(e) => return Err(e),
            }
        }
        info!("Destroyed '{}' on {}", binding.resource_id, T::PROVIDER);
        Ok(())
    }
}
