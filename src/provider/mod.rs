//! Provider adapters.
//!
//! Adapters translate provider-agnostic resources into the API calls of one
//! cloud and report back bindings:
//! - [`CloudApi`]: control-plane transport (HTTP gateway or simulated cloud)
//! - [`ProviderAdapter`]: create/read/update/destroy of one resource
//! - [`AwsAdapter`], [`GcpAdapter`], [`AzureAdapter`]: attribute translation

mod adapter;
mod api;
mod aws;
mod azure;
mod common;
mod gcp;
mod http;
mod sim;

use std::sync::Arc;
use tracing::info;

pub use adapter::{CloudAdapter, ProviderAdapter, Translator};
pub use api::{ApiCall, CloudApi, RemoteObject};
pub use aws::{Aws, AwsAdapter};
pub use azure::{Azure, AzureAdapter};
pub use common::{RetryPolicy, SizeTier, Step, with_retry};
pub use gcp::{Gcp, GcpAdapter};
pub use http::HttpCloudApi;
pub use sim::{Fault, FaultKind, SimCall, SimOp, SimulatedCloud};

#[cfg(test)]
pub use adapter::MockProviderAdapter;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{ConfigError, ProviderError, Result, TopoformError};

/// Result type for adapter and transport calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Returns the adapter for a provider kind.
#[must_use]
pub fn adapter_for(kind: ProviderKind, api: Arc<dyn CloudApi>) -> Arc<dyn ProviderAdapter> {
    match kind {
        ProviderKind::Aws => Arc::new(AwsAdapter::new(Aws, api)),
        ProviderKind::Gcp => Arc::new(GcpAdapter::new(Gcp, api)),
        ProviderKind::Azure => Arc::new(AzureAdapter::new(Azure, api)),
    }
}

/// Opens the control-plane transport named by the provider configuration.
///
/// `sim` selects an in-memory simulated cloud, `sim:<file>` one persisted
/// to a file; anything else is an HTTP gateway base URL.
///
/// # Errors
///
/// Returns an error if no endpoint is configured, the HTTP client cannot be
/// built, or the simulation file is unreadable.
pub async fn connect(config: &ProviderConfig, token: Option<String>) -> Result<Arc<dyn CloudApi>> {
    let Some(endpoint) = config.endpoint.as_deref() else {
        return Err(TopoformError::Config(ConfigError::validation(
            "provider.endpoint is required",
            "provider.endpoint",
        )));
    };

    if config.is_simulated() {
        let sim = match config.simulation_file() {
            Some(file) => SimulatedCloud::open(config.kind, &config.region, file).await?,
            None => SimulatedCloud::new(config.kind, &config.region),
        };
        info!("Using simulated {} control plane", config.kind);
        return Ok(Arc::new(sim));
    }

    info!("Using {} gateway at {endpoint}", config.kind);
    let api = HttpCloudApi::new(config.kind, endpoint, &config.region, token)?;
    Ok(Arc::new(api))
}
