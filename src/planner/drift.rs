//! Refresh and drift detection.
//!
//! Refresh reads every recorded remote object back from the provider,
//! updates the observed attributes in the snapshot and compares them
//! against what the configuration asks for.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::model::interpolate::resolve_attributes;
use crate::model::{Graph, Resource};
use crate::provider::ProviderAdapter;
use crate::state::StateSnapshot;

/// One attribute whose observed value differs from the desired one.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDrift {
    /// Provider attribute name.
    pub attribute: String,
    /// Value the configuration asks for.
    pub desired: Value,
    /// Value read from the provider, `None` if absent.
    pub observed: Option<Value>,
}

/// Result of a refresh.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DriftReport {
    /// Drifted attributes per resource.
    pub drifted: BTreeMap<String, Vec<AttributeDrift>>,
    /// Resources whose remote object no longer exists.
    pub missing: Vec<String>,
    /// Resources that could not be compared because a dependency is unresolved.
    pub skipped: Vec<String>,
    /// Number of bindings read.
    pub checked: usize,
}

impl DriftReport {
    /// Returns true if anything drifted or went missing.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.missing.is_empty()
    }

    /// Ids of resources with drifted attributes.
    #[must_use]
    pub fn drifted_ids(&self) -> BTreeSet<String> {
        self.drifted.keys().cloned().collect()
    }
}

/// Reads every created binding back and records what changed remotely.
///
/// Missing objects lose their remote id so the next plan recreates them.
/// Observed attributes replace the recorded ones.
///
/// # Errors
///
/// Returns an error if a read fails for any reason other than the object
/// being gone.
pub async fn refresh(
    adapter: &dyn ProviderAdapter,
    graph: &Graph,
    snapshot: &mut StateSnapshot,
) -> Result<DriftReport> {
    let mut report = DriftReport::default();
    let ids: Vec<String> = snapshot
        .bindings
        .values()
        .filter(|b| b.is_created())
        .map(|b| b.resource_id.clone())
        .collect();

    for id in ids {
        let Some(binding) = snapshot.bindings.get(&id) else {
            continue;
        };
        report.checked += 1;

        match adapter.read(binding).await? {
            None => {
                warn!("Remote object of '{id}' is gone");
                if let Some(b) = snapshot.bindings.get_mut(&id) {
                    b.remote_id = None;
                }
                report.missing.push(id);
            }
            Some(observed) => {
                debug!("Read '{id}'");
                snapshot.set_binding(observed);
            }
        }
    }

    for resource in graph.resources() {
        let Some(binding) = snapshot.get(&resource.id) else {
            continue;
        };
        if !binding.is_created() || binding.kind != resource.kind {
            continue;
        }

        let resolved = match resolve_attributes(&resource.id, &resource.attributes, &snapshot.bindings) {
            Ok(attributes) => attributes,
            Err(e) => {
                debug!("Skipping drift check of '{}': {e}", resource.id);
                report.skipped.push(resource.id.clone());
                continue;
            }
        };
        let desired = Resource {
            attributes: resolved,
            ..resource.clone()
        };
        let Ok(params) = adapter.normalize(&desired) else {
            report.skipped.push(resource.id.clone());
            continue;
        };

        let drift: Vec<AttributeDrift> = params
            .into_iter()
            .filter_map(|(attribute, desired)| {
                let observed = binding.remote_attributes.get(&attribute);
                (observed != Some(&desired)).then(|| AttributeDrift {
                    observed: observed.cloned(),
                    attribute,
                    desired,
                })
            })
            .collect();

        if !drift.is_empty() {
            info!("'{}' drifted on {} attribute(s)", resource.id, drift.len());
            report.drifted.insert(resource.id.clone(), drift);
        }
    }

    Ok(report)
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_drift() {
            return writeln!(f, "No drift detected across {} resource(s)", self.checked);
        }
        for id in &self.missing {
            writeln!(f, "  - {id}: remote object missing")?;
        }
        for (id, attributes) in &self.drifted {
            writeln!(f, "  ~ {id}:")?;
            for d in attributes {
                let observed = d
                    .observed
                    .as_ref()
                    .map_or_else(|| String::from("(absent)"), Value::to_string);
                writeln!(f, "      {}: {} -> {}", d.attribute, observed, d.desired)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::model::{ResourceKind, build_graph};
    use crate::provider::{AwsAdapter, Aws, RetryPolicy, SimulatedCloud};
    use serde_json::json;
    use std::sync::Arc;

    async fn applied() -> (Arc<SimulatedCloud>, AwsAdapter, Graph, StateSnapshot) {
        let sim = Arc::new(SimulatedCloud::new(ProviderKind::Aws, "eu-west-1"));
        let adapter = AwsAdapter::new(Aws, sim.clone()).with_retry(RetryPolicy::immediate());
        let graph = build_graph(vec![
            Resource::new("net", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
            Resource::new("cache", ResourceKind::Cache)
                .with_attribute("size", "medium")
                .with_attribute("network", "${net.id}"),
        ])
        .expect("graph");

        let mut snapshot = StateSnapshot::new("shop", "dev");
        for resource in graph.resources() {
            let resolved =
                resolve_attributes(&resource.id, &resource.attributes, &snapshot.bindings)
                    .expect("resolve");
            let desired = Resource {
                attributes: resolved,
                ..resource.clone()
            };
            let binding = adapter.create(&desired).await.expect("create");
            snapshot.set_binding(binding);
        }
        (sim, adapter, graph, snapshot)
    }

    #[tokio::test]
    async fn test_clean_refresh() {
        let (_sim, adapter, graph, mut snapshot) = applied().await;
        let report = refresh(&adapter, &graph, &mut snapshot).await.expect("refresh");
        assert_eq!(report.checked, 2);
        assert!(!report.has_drift(), "{report}");
    }

    #[tokio::test]
    async fn test_tampered_attribute_is_reported() {
        let (sim, adapter, graph, mut snapshot) = applied().await;
        let remote_id = snapshot.bindings["cache"].remote_id.clone().expect("id");
        assert!(sim.tamper(&remote_id, "node_type", json!("cache.t4g.micro")).await);

        let report = refresh(&adapter, &graph, &mut snapshot).await.expect("refresh");
        let drift = &report.drifted["cache"];
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].attribute, "node_type");
        assert_eq!(drift[0].observed, Some(json!("cache.t4g.micro")));
        assert_eq!(
            snapshot.bindings["cache"].remote_attributes["node_type"],
            json!("cache.t4g.micro")
        );
    }

    #[tokio::test]
    async fn test_missing_object_clears_remote_id() {
        let (sim, adapter, graph, mut snapshot) = applied().await;
        let remote_id = snapshot.bindings["net"].remote_id.clone().expect("id");
        assert!(sim.remove(&remote_id).await);

        let report = refresh(&adapter, &graph, &mut snapshot).await.expect("refresh");
        assert_eq!(report.missing, vec![String::from("net")]);
        assert!(snapshot.bindings["net"].remote_id.is_none());
        assert_eq!(report.skipped, vec![String::from("cache")]);
    }
}
