//! Diff engine for comparing the desired graph with recorded state.
//!
//! The diff is pure: it looks only at the graph, the snapshot and the set
//! of resources refresh found drifted.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::debug;

use crate::config::ConfigHasher;
use crate::model::{Graph, ResourceKind};
use crate::state::{BindingStatus, StateSnapshot};

/// Engine for computing diffs between desired and recorded state.
#[derive(Debug, Default)]
pub struct DiffEngine {
    /// Configuration hasher.
    hasher: ConfigHasher,
}

/// What must happen to one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// Resource needs to be created.
    Create,
    /// Resource needs to be updated (or replaced).
    Update,
    /// Resource needs to be destroyed.
    Destroy,
    /// Resource is unchanged.
    NoOp,
}

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Resource id.
    pub resource_id: String,
    /// Desired kind, or the recorded kind for destroys.
    pub kind: ResourceKind,
    /// Action required.
    pub action: ChangeAction,
    /// Why.
    pub reason: String,
    /// Whether existing remote objects are deleted before creating new ones.
    pub replace: bool,
    /// Previously applied hash.
    pub old_hash: Option<String>,
    /// Desired hash.
    pub new_hash: Option<String>,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Diffs of desired resources in dependency order, then removed ones.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to update.
    pub updates: usize,
    /// Number of resources to destroy.
    pub destroys: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the diff between the desired graph and recorded state.
    ///
    /// `drifted` names resources whose observed attributes no longer match.
    #[must_use]
    pub fn compute_diff(
        &self,
        graph: &Graph,
        snapshot: &StateSnapshot,
        drifted: &BTreeSet<String>,
    ) -> DiffResult {
        let mut diffs = Vec::new();
        let mut recreated: BTreeSet<String> = BTreeSet::new();

        for resource in graph.resources() {
            let new_hash = self.hasher.hash_resource(resource);
            let binding = snapshot.get(&resource.id);

            let (action, reason, replace) = match binding {
                None => (ChangeAction::Create, String::from("not yet created"), false),
                Some(b) if b.status == BindingStatus::Partial => (
                    ChangeAction::Create,
                    String::from("previous create stopped part way"),
                    true,
                ),
                Some(b) if b.remote_id.is_none() => (
                    ChangeAction::Create,
                    String::from("remote object missing"),
                    b.has_leftovers(),
                ),
                Some(b) if b.kind != resource.kind => (
                    ChangeAction::Update,
                    format!("kind changed from {}", b.kind),
                    true,
                ),
                Some(b) if b.config_hash != new_hash => {
                    (ChangeAction::Update, String::from("configuration changed"), false)
                }
                Some(_) if drifted.contains(&resource.id) => {
                    (ChangeAction::Update, String::from("drift"), false)
                }
                Some(_) => match graph
                    .dependencies(&resource.id)
                    .into_iter()
                    .find(|d| recreated.contains(d))
                {
                    Some(dep) => (
                        ChangeAction::Update,
                        format!("dependency '{dep}' is recreated"),
                        false,
                    ),
                    None => (ChangeAction::NoOp, String::new(), false),
                },
            };

            if action == ChangeAction::Create || replace {
                recreated.insert(resource.id.clone());
            }
            debug!("{} -> {action} {reason}", resource.id);

            diffs.push(ResourceDiff {
                resource_id: resource.id.clone(),
                kind: resource.kind,
                action,
                reason,
                replace,
                old_hash: binding.map(|b| b.config_hash.clone()),
                new_hash: Some(new_hash),
            });
        }

        for (id, binding) in &snapshot.bindings {
            if !graph.contains(id) {
                debug!("{id} is no longer desired");
                diffs.push(ResourceDiff {
                    resource_id: id.clone(),
                    kind: binding.kind,
                    action: ChangeAction::Destroy,
                    reason: String::from("removed from configuration"),
                    replace: false,
                    old_hash: Some(binding.config_hash.clone()),
                    new_hash: None,
                });
            }
        }

        let count = |action: ChangeAction| diffs.iter().filter(|d| d.action == action).count();
        DiffResult {
            creates: count(ChangeAction::Create),
            updates: count(ChangeAction::Update),
            destroys: count(ChangeAction::Destroy),
            unchanged: count(ChangeAction::NoOp),
            diffs,
        }
    }
}

impl DiffResult {
    /// Returns true if anything must change.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates + self.updates + self.destroys > 0
    }
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::model::{Resource, build_graph};
    use crate::state::ProviderBinding;

    fn topology() -> Vec<Resource> {
        vec![
            Resource::new("n1", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
            Resource::new("d1", ResourceKind::Database).with_attribute("network", "${n1.id}"),
            Resource::new("c1", ResourceKind::ComputeService)
                .with_attribute("image", "app:1")
                .with_attribute("env", serde_json::json!({"DB": "${d1.endpoint}"})),
        ]
    }

    fn applied(resources: &[Resource]) -> StateSnapshot {
        let hasher = ConfigHasher::new();
        let mut snapshot = StateSnapshot::new("shop", "dev");
        for r in resources {
            let mut b = ProviderBinding::new(&r.id, r.kind, ProviderKind::Aws);
            b.remote_id = Some(format!("remote-{}", r.id));
            b.push_component("x/y", &format!("remote-{}", r.id));
            b.config_hash = hasher.hash_resource(r);
            b.references = r.references.clone();
            snapshot.set_binding(b);
        }
        snapshot
    }

    fn actions(result: &DiffResult) -> Vec<(&str, ChangeAction)> {
        result
            .diffs
            .iter()
            .map(|d| (d.resource_id.as_str(), d.action))
            .collect()
    }

    #[test]
    fn test_empty_state_creates_everything_in_order() {
        let graph = build_graph(topology()).expect("graph");
        let result = DiffEngine::new().compute_diff(
            &graph,
            &StateSnapshot::new("shop", "dev"),
            &BTreeSet::new(),
        );
        assert_eq!(
            actions(&result),
            vec![
                ("n1", ChangeAction::Create),
                ("d1", ChangeAction::Create),
                ("c1", ChangeAction::Create)
            ]
        );
        assert_eq!(result.creates, 3);
    }

    #[test]
    fn test_matching_state_is_noop() {
        let resources = topology();
        let snapshot = applied(&resources);
        let graph = build_graph(resources).expect("graph");
        let result = DiffEngine::new().compute_diff(&graph, &snapshot, &BTreeSet::new());
        assert!(result.diffs.iter().all(|d| d.action == ChangeAction::NoOp));
        assert!(!result.has_changes());
    }

    #[test]
    fn test_removed_resource_is_destroyed() {
        let resources = topology();
        let snapshot = applied(&resources);
        let graph = build_graph(resources[..2].to_vec()).expect("graph");
        let result = DiffEngine::new().compute_diff(&graph, &snapshot, &BTreeSet::new());
        assert_eq!(
            actions(&result),
            vec![
                ("n1", ChangeAction::NoOp),
                ("d1", ChangeAction::NoOp),
                ("c1", ChangeAction::Destroy)
            ]
        );
    }

    #[test]
    fn test_changed_drifted_and_replaced() {
        let resources = topology();
        let mut snapshot = applied(&resources);
        if let Some(b) = snapshot.bindings.get_mut("n1") {
            b.kind = ResourceKind::Subnet;
        }

        let mut changed = resources;
        changed[2] = changed[2].clone().with_attribute("replicas", 2);
        let graph = build_graph(changed).expect("graph");

        let drifted: BTreeSet<String> = [String::from("d1")].into();
        let result = DiffEngine::new().compute_diff(&graph, &snapshot, &drifted);

        let n1 = &result.diffs[0];
        assert_eq!(n1.action, ChangeAction::Update);
        assert!(n1.replace);
        let d1 = &result.diffs[1];
        assert_eq!(d1.action, ChangeAction::Update);
        assert_eq!(d1.reason, "drift");
        let c1 = &result.diffs[2];
        assert_eq!(c1.reason, "configuration changed");
    }

    #[test]
    fn test_missing_dependency_updates_dependents() {
        let resources = topology();
        let mut snapshot = applied(&resources);
        if let Some(b) = snapshot.bindings.get_mut("n1") {
            b.remote_id = None;
        }
        let graph = build_graph(resources).expect("graph");
        let result = DiffEngine::new().compute_diff(&graph, &snapshot, &BTreeSet::new());

        assert_eq!(result.diffs[0].action, ChangeAction::Create);
        assert!(result.diffs[0].replace);
        assert_eq!(result.diffs[1].action, ChangeAction::Update);
        assert_eq!(result.diffs[1].reason, "dependency 'n1' is recreated");
        assert_eq!(result.diffs[2].action, ChangeAction::NoOp);
    }

    #[test]
    fn test_partial_binding_is_recreated() {
        let resources = topology();
        let mut snapshot = applied(&resources);
        if let Some(b) = snapshot.bindings.get_mut("c1") {
            b.status = BindingStatus::Partial;
            b.remote_id = None;
        }
        let graph = build_graph(resources).expect("graph");
        let result = DiffEngine::new().compute_diff(&graph, &snapshot, &BTreeSet::new());
        let c1 = &result.diffs[2];
        assert_eq!(c1.action, ChangeAction::Create);
        assert!(c1.replace);
    }
}
