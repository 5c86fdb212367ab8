//! Dependency graph over resources.
//!
//! Edges run from a resource to each id it references. The graph is checked
//! for duplicate ids, dangling references and cycles, then ordered so every
//! dependency comes before its dependents. Independent resources are ordered
//! by ascending id, which keeps plans deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::Resource;
use crate::error::GraphError;

/// A validated, topologically ordered set of resources.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    resources: BTreeMap<String, Resource>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Active,
    Done,
}

/// Builds a graph from a list of resources.
///
/// # Errors
///
/// Returns an error if an id is declared twice, a reference names an
/// undeclared id, or the references form a cycle.
pub fn build_graph(resources: Vec<Resource>) -> Result<Graph, GraphError> {
    let mut by_id = BTreeMap::new();
    for resource in resources {
        if by_id.contains_key(&resource.id) {
            return Err(GraphError::DuplicateResource { id: resource.id });
        }
        by_id.insert(resource.id.clone(), resource);
    }

    for resource in by_id.values() {
        if let Some(missing) = resource.references.iter().find(|r| !by_id.contains_key(*r)) {
            return Err(GraphError::DanglingReference {
                from: resource.id.clone(),
                to: missing.clone(),
            });
        }
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    for id in by_id.keys() {
        visit(id, &by_id, &mut marks, &mut path)?;
    }

    let mut dependents: BTreeMap<String, BTreeSet<String>> = by_id
        .keys()
        .map(|id| (id.clone(), BTreeSet::new()))
        .collect();
    for resource in by_id.values() {
        for dep in &resource.references {
            if let Some(set) = dependents.get_mut(dep) {
                set.insert(resource.id.clone());
            }
        }
    }

    let order = topological_order(&by_id, &dependents);

    Ok(Graph {
        resources: by_id,
        dependents,
        order,
    })
}

fn visit<'a>(
    id: &'a str,
    resources: &'a BTreeMap<String, Resource>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<(), GraphError> {
    match marks.get(id) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Active) => {
            let start = path.iter().position(|p| *p == id).unwrap_or(0);
            let mut members: Vec<String> = path[start..].iter().map(|s| (*s).to_string()).collect();
            members.sort();
            return Err(GraphError::CyclicDependency { members });
        }
        None => {}
    }

    marks.insert(id, Mark::Active);
    path.push(id);

    if let Some(resource) = resources.get(id) {
        for dep in &resource.references {
            visit(dep, resources, marks, path)?;
        }
    }

    path.pop();
    marks.insert(id, Mark::Done);
    Ok(())
}

fn topological_order(
    resources: &BTreeMap<String, Resource>,
    dependents: &BTreeMap<String, BTreeSet<String>>,
) -> Vec<String> {
    let mut pending: BTreeMap<&str, usize> = resources
        .values()
        .map(|r| (r.id.as_str(), r.references.len()))
        .collect();

    let mut ready: BTreeSet<&str> = pending
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();

    let mut order = Vec::with_capacity(resources.len());
    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(count) = pending.get_mut(dependent.as_str()) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.insert(dependent.as_str());
                }
            }
        }
    }
    order
}

impl Graph {
    /// Returns resource ids in apply order.
    #[must_use]
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Returns resources in apply order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.order.iter().filter_map(|id| self.resources.get(id))
    }

    /// Looks up a resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Resource> {
        self.resources.get(id)
    }

    /// Returns true if the id is part of the graph.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.resources.contains_key(id)
    }

    /// Returns the ids a resource references directly.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> BTreeSet<String> {
        self.resources
            .get(id)
            .map(|r| r.references.clone())
            .unwrap_or_default()
    }

    /// Returns the ids referencing a resource directly.
    #[must_use]
    pub fn dependents(&self, id: &str) -> BTreeSet<String> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// Returns every id that depends on a resource, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents.get(current).into_iter().flatten() {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent);
                }
            }
        }
        seen
    }

    /// Returns the number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
