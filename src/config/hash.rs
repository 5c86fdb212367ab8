//! Configuration hashing for change detection.
//!
//! This module provides deterministic hashing of resources and whole
//! topologies so unchanged resources plan as no-ops.

use sha2::{Digest, Sha256};

use super::spec::TopologyConfig;
use crate::model::Resource;

/// Hasher for computing configuration hashes.
#[derive(Debug, Default)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new configuration hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the canonical hash of a resource's desired form.
    ///
    /// Attribute maps are `BTreeMap`s and JSON objects keep sorted keys, so
    /// the serialized form does not depend on declaration order.
    #[must_use]
    pub fn hash_resource(&self, resource: &Resource) -> String {
        let mut hasher = Sha256::new();

        hasher.update(resource.id.as_bytes());
        hasher.update([0u8]);
        hasher.update(resource.kind.as_str().as_bytes());
        hasher.update([0u8]);

        for (key, value) in &resource.attributes {
            hasher.update(key.as_bytes());
            hasher.update([b'=']);
            hasher.update(value.to_string().as_bytes());
            hasher.update([0u8]);
        }

        for reference in &resource.references {
            hasher.update(reference.as_bytes());
            hasher.update([b',']);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of the entire topology configuration.
    ///
    /// This hash changes when any part of the configuration changes.
    #[must_use]
    pub fn hash_config(&self, config: &TopologyConfig) -> String {
        let mut hasher = Sha256::new();

        // Project and provider
        hasher.update(config.project.name.as_bytes());
        hasher.update(config.project.environment.as_bytes());
        hasher.update(config.provider.kind.to_string().as_bytes());
        hasher.update(config.provider.region.as_bytes());

        // Resources (sorted by id for determinism)
        let mut resources: Vec<Resource> = config.resources.iter().map(Resource::from_config).collect();
        resources.sort_by(|a, b| a.id.cmp(&b.id));
        for resource in &resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }

        // Outputs (sorted by name for determinism)
        let mut outputs: Vec<_> = config.outputs.iter().collect();
        outputs.sort_by(|a, b| a.name.cmp(&b.name));
        for output in outputs {
            hasher.update(output.name.as_bytes());
            hasher.update(output.value.as_bytes());
            hasher.update(if output.sensitive { [1u8] } else { [0u8] });
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use serde_json::json;

    fn database(size: &str) -> Resource {
        Resource::new("db", ResourceKind::Database)
            .with_attribute("network", "${net.id}")
            .with_attribute("size", size)
            .with_attribute("tags", json!({ "team": "web", "cost": "shared" }))
    }

    #[test]
    fn test_resource_hash_deterministic() {
        let hasher = ConfigHasher::new();
        assert_eq!(hasher.hash_resource(&database("small")), hasher.hash_resource(&database("small")));
    }

    #[test]
    fn test_attribute_order_irrelevant() {
        let hasher = ConfigHasher::new();
        let a = Resource::new("c", ResourceKind::Cache)
            .with_attribute("size", "small")
            .with_attribute("engine", "redis");
        let b = Resource::new("c", ResourceKind::Cache)
            .with_attribute("engine", "redis")
            .with_attribute("size", "small");
        assert_eq!(hasher.hash_resource(&a), hasher.hash_resource(&b));
    }

    #[test]
    fn test_different_resources_different_hash() {
        let hasher = ConfigHasher::new();
        assert_ne!(hasher.hash_resource(&database("small")), hasher.hash_resource(&database("large")));

        let other_kind = Resource::new("db", ResourceKind::Cache);
        let same_id = Resource::new("db", ResourceKind::Database);
        assert_ne!(hasher.hash_resource(&other_kind), hasher.hash_resource(&same_id));
    }

    #[test]
    fn test_short_hash() {
        let hasher = ConfigHasher::new();
        let full_hash = "abcdef1234567890abcdef1234567890";
        let short = hasher.short_hash(full_hash);

        assert_eq!(short, "abcdef12");
        assert_eq!(short.len(), 8);
    }
}
