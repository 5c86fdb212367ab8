//! Change sets: ordered, dependency-annotated plans.
//!
//! Non-destroy changes follow the graph's topological order; destroys come
//! last, in reverse order of the references recorded in state. A change set
//! can be saved and later applied only if a fresh plan still matches it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};
use uuid::Uuid;

use super::diff::{ChangeAction, DiffEngine, DiffResult};
use crate::error::{PlanError, Result, TopoformError};
use crate::model::{Graph, ResourceKind};
use crate::state::StateSnapshot;

/// A complete plan for one apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSet {
    /// Plan identifier.
    pub id: String,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
    /// Lineage of the state the plan was computed against.
    pub lineage: String,
    /// Serial of the state the plan was computed against.
    pub base_serial: u64,
    /// Hash of the configuration the plan was computed from.
    pub config_hash: String,
    /// Every change, no-ops included, in execution order.
    pub changes: Vec<Change>,
}

/// A single planned change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    /// Resource id.
    pub resource_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Action.
    pub action: ChangeAction,
    /// Why the change is needed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Changes that must succeed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Whether the existing remote objects are deleted and recreated.
    #[serde(default)]
    pub replace: bool,
    /// Hash of the desired resource the change was planned for; absent for
    /// destroys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desired_hash: Option<String>,
}

/// Computes the change set for a graph against a snapshot.
#[must_use]
pub fn plan_changes(
    graph: &Graph,
    snapshot: &StateSnapshot,
    drifted: &BTreeSet<String>,
    config_hash: &str,
) -> ChangeSet {
    let diff = DiffEngine::new().compute_diff(graph, snapshot, drifted);
    ChangeSet::from_diff(&diff, graph, snapshot, config_hash)
}

/// Orders recorded resources so that every reference precedes its referrer.
///
/// Ties break by ascending id; members of a (corrupt) cycle go last.
fn state_order(snapshot: &StateSnapshot) -> Vec<String> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = snapshot
        .bindings
        .iter()
        .map(|(id, b)| {
            let refs = b
                .references
                .iter()
                .map(String::as_str)
                .filter(|r| *r != id.as_str() && snapshot.bindings.contains_key(*r))
                .collect();
            (id.as_str(), refs)
        })
        .collect();

    let mut order = Vec::with_capacity(remaining.len());
    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, refs)| refs.is_empty())
            .map(|(id, _)| *id)
            .collect();
        let Some(next) = ready.first().copied() else {
            break;
        };
        remaining.remove(next);
        for refs in remaining.values_mut() {
            refs.remove(next);
        }
        order.push(next.to_string());
    }
    order.extend(remaining.keys().map(|id| (*id).to_string()));
    order
}

impl ChangeSet {
    /// Builds the ordered change set from a diff.
    #[must_use]
    pub fn from_diff(
        diff: &DiffResult,
        graph: &Graph,
        snapshot: &StateSnapshot,
        config_hash: &str,
    ) -> Self {
        let actions: BTreeMap<&str, ChangeAction> = diff
            .diffs
            .iter()
            .map(|d| (d.resource_id.as_str(), d.action))
            .collect();

        let mut changes = Vec::with_capacity(diff.diffs.len());

        // Desired resources, already in topological order.
        for d in diff.diffs.iter().filter(|d| d.action != ChangeAction::Destroy) {
            let depends_on = if d.action == ChangeAction::NoOp {
                Vec::new()
            } else {
                graph
                    .dependencies(&d.resource_id)
                    .into_iter()
                    .filter(|dep| {
                        actions
                            .get(dep.as_str())
                            .is_some_and(|a| matches!(a, ChangeAction::Create | ChangeAction::Update))
                    })
                    .collect()
            };
            changes.push(Change {
                resource_id: d.resource_id.clone(),
                kind: d.kind,
                action: d.action,
                reason: d.reason.clone(),
                depends_on,
                replace: d.replace,
                desired_hash: d.new_hash.clone(),
            });
        }

        // Destroys: dependents first.
        let destroys: BTreeMap<&str, _> = diff
            .diffs
            .iter()
            .filter(|d| d.action == ChangeAction::Destroy)
            .map(|d| (d.resource_id.as_str(), d))
            .collect();
        for id in state_order(snapshot).iter().rev() {
            let Some(d) = destroys.get(id.as_str()) else {
                continue;
            };
            let depends_on = snapshot
                .bindings
                .iter()
                .filter(|(other, b)| *other != id && b.references.contains(id))
                .map(|(other, _)| other)
                .filter(|other| {
                    actions
                        .get(other.as_str())
                        .is_some_and(|a| matches!(a, ChangeAction::Destroy | ChangeAction::Update))
                })
                .cloned()
                .collect();
            changes.push(Change {
                resource_id: d.resource_id.clone(),
                kind: d.kind,
                action: ChangeAction::Destroy,
                reason: d.reason.clone(),
                depends_on,
                replace: false,
                desired_hash: None,
            });
        }

        let plan = Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            lineage: snapshot.lineage.clone(),
            base_serial: snapshot.serial,
            config_hash: config_hash.to_string(),
            changes,
        };
        debug!(
            "Planned {} changes ({} pending) against serial {}",
            plan.changes.len(),
            plan.pending().count(),
            plan.base_serial
        );
        plan
    }

    /// Returns the changes that do something.
    pub fn pending(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter().filter(|c| c.action != ChangeAction::NoOp)
    }

    /// Returns true if any change does something.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.pending().next().is_some()
    }

    /// Counts changes with the given action.
    #[must_use]
    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }

    /// Gets the change for a resource.
    #[must_use]
    pub fn get(&self, resource_id: &str) -> Option<&Change> {
        self.changes.iter().find(|c| c.resource_id == resource_id)
    }

    /// Writes the plan as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| TopoformError::internal(format!("Failed to encode plan: {e}")))?;
        std::fs::write(path, content)?;
        info!("Plan saved to {}", path.display());
        Ok(())
    }

    /// Reads a plan written by [`ChangeSet::save`].
    ///
    /// # Errors
    ///
    /// Returns `PlanError::InvalidPlanFile` if the file is unreadable.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let invalid = |message: String| {
            TopoformError::Plan(PlanError::InvalidPlanFile {
                path: path.to_path_buf(),
                message,
            })
        };
        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))
    }

    /// Checks that a freshly computed plan still matches this saved one.
    ///
    /// # Errors
    ///
    /// Returns `PlanError::StalePlan` if the state lineage, base serial,
    /// configuration hash or any change differs.
    pub fn ensure_matches(&self, fresh: &Self) -> Result<()> {
        let stale = |reason: String| Err(TopoformError::Plan(PlanError::StalePlan { reason }));

        if self.lineage != fresh.lineage {
            return stale(format!(
                "state lineage is {}, plan was made for {}",
                fresh.lineage, self.lineage
            ));
        }
        if self.base_serial != fresh.base_serial {
            return stale(format!(
                "state serial is {}, plan was made at {}",
                fresh.base_serial, self.base_serial
            ));
        }
        if self.config_hash != fresh.config_hash {
            return stale(String::from("configuration changed since the plan was made"));
        }
        if self.changes != fresh.changes {
            let differing = self
                .changes
                .iter()
                .zip(&fresh.changes)
                .find(|(a, b)| a != b)
                .map_or_else(
                    || String::from("number of changes differs"),
                    |(a, _)| format!("change for '{}' differs", a.resource_id),
                );
            return stale(differing);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigHasher, ProviderKind};
    use crate::model::{Resource, build_graph};
    use crate::state::ProviderBinding;
    use tempfile::TempDir;

    fn topology() -> Vec<Resource> {
        vec![
            Resource::new("n", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
            Resource::new("d", ResourceKind::Database).with_attribute("network", "${n.id}"),
            Resource::new("c", ResourceKind::ComputeService)
                .with_attribute("image", "app:1")
                .with_attribute("db", "${d.endpoint}"),
        ]
    }

    fn applied(resources: &[Resource]) -> StateSnapshot {
        let hasher = ConfigHasher::new();
        let mut snapshot = StateSnapshot::new("shop", "dev");
        snapshot.serial = 4;
        for r in resources {
            let mut b = ProviderBinding::new(&r.id, r.kind, ProviderKind::Gcp);
            b.remote_id = Some(format!("remote-{}", r.id));
            b.config_hash = hasher.hash_resource(r);
            b.references = r.references.clone();
            snapshot.set_binding(b);
        }
        snapshot
    }

    fn ids(plan: &ChangeSet, action: ChangeAction) -> Vec<&str> {
        plan.changes
            .iter()
            .filter(|c| c.action == action)
            .map(|c| c.resource_id.as_str())
            .collect()
    }

    #[test]
    fn test_create_dependencies() {
        let graph = build_graph(topology()).expect("graph");
        let plan = plan_changes(&graph, &StateSnapshot::new("shop", "dev"), &BTreeSet::new(), "h");

        assert_eq!(ids(&plan, ChangeAction::Create), vec!["n", "d", "c"]);
        assert_eq!(plan.get("d").expect("d").depends_on, vec![String::from("n")]);
        assert_eq!(plan.get("c").expect("c").depends_on, vec![String::from("d")]);
        assert!(plan.has_changes());
        assert_eq!(plan.base_serial, 0);
    }

    #[test]
    fn test_destroy_in_reverse_reference_order() {
        let resources = topology();
        let snapshot = applied(&resources);
        let graph = build_graph(Vec::new()).expect("empty graph");
        let plan = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");

        assert_eq!(ids(&plan, ChangeAction::Destroy), vec!["c", "d", "n"]);
        assert_eq!(plan.get("n").expect("n").depends_on, vec![String::from("d")]);
        assert_eq!(plan.get("d").expect("d").depends_on, vec![String::from("c")]);
        assert!(plan.get("c").expect("c").depends_on.is_empty());
    }

    #[test]
    fn test_partial_removal() {
        let resources = topology();
        let snapshot = applied(&resources);
        let graph = build_graph(resources[..2].to_vec()).expect("graph");
        let plan = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");

        assert_eq!(ids(&plan, ChangeAction::NoOp), vec!["n", "d"]);
        assert_eq!(ids(&plan, ChangeAction::Destroy), vec!["c"]);
        assert_eq!(plan.pending().count(), 1);
    }

    #[test]
    fn test_save_load_and_staleness() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("plan.json");

        let resources = topology();
        let snapshot = applied(&resources);
        let graph = build_graph(resources[..2].to_vec()).expect("graph");
        let plan = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");
        plan.save(&path).expect("save");

        let loaded = ChangeSet::load(&path).expect("load");
        assert_eq!(loaded, plan);

        let fresh = plan_changes(&graph, &snapshot, &BTreeSet::new(), "h");
        loaded.ensure_matches(&fresh).expect("still valid");

        let mut advanced = snapshot.clone();
        advanced.serial += 1;
        let fresh = plan_changes(&graph, &advanced, &BTreeSet::new(), "h");
        let err = loaded.ensure_matches(&fresh).expect_err("serial moved");
        assert!(matches!(err, TopoformError::Plan(PlanError::StalePlan { .. })));

        let full = build_graph(resources).expect("graph");
        let fresh = plan_changes(&full, &snapshot, &BTreeSet::new(), "h");
        assert!(loaded.ensure_matches(&fresh).is_err());

        let fresh = plan_changes(&graph, &snapshot, &BTreeSet::new(), "edited");
        let err = loaded.ensure_matches(&fresh).expect_err("config edited");
        assert!(err.to_string().contains("configuration changed"));

        std::fs::write(&path, "{").expect("write");
        let err = ChangeSet::load(&path).expect_err("corrupt");
        assert!(matches!(err, TopoformError::Plan(PlanError::InvalidPlanFile { .. })));
    }

    #[test]
    fn test_edited_attribute_makes_saved_plan_stale() {
        let cache = |size: &str| {
            vec![Resource::new("cache", ResourceKind::Cache).with_attribute("size", size)]
        };
        let snapshot = StateSnapshot::new("shop", "dev");

        let medium = build_graph(cache("medium")).expect("graph");
        let saved = plan_changes(&medium, &snapshot, &BTreeSet::new(), "h");

        // Same config hash, only the resource content moved: the change still
        // reads "create cache" but for a different desired resource.
        let xlarge = build_graph(cache("xlarge")).expect("graph");
        let fresh = plan_changes(&xlarge, &snapshot, &BTreeSet::new(), "h");
        assert_eq!(saved.get("cache").expect("cache").action, ChangeAction::Create);
        assert_ne!(
            saved.get("cache").expect("cache").desired_hash,
            fresh.get("cache").expect("cache").desired_hash
        );

        let err = saved.ensure_matches(&fresh).expect_err("edited");
        assert!(matches!(err, TopoformError::Plan(PlanError::StalePlan { .. })));
    }
}
