//! Output contract.
//!
//! Outputs are recomputed from the committed bindings after every successful
//! apply. Five standard outputs are always attempted; each comes from the
//! first resource of the matching kind, by ascending id, that exposes the
//! attribute. Declared outputs are rendered from their `${id.attr}`
//! templates and win over a standard output of the same name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::config::OutputConfig;
use crate::error::GraphError;
use crate::model::ResourceKind;
use crate::model::interpolate::resolve_attributes;
use crate::state::ProviderBinding;

/// A named value exposed after apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Output {
    /// Output name.
    pub name: String,
    /// Rendered value.
    pub value: Value,
    /// Hidden from non-sensitive listings.
    pub sensitive: bool,
}

/// Standard outputs: name, source kind, source attribute.
pub const STANDARD_OUTPUTS: [(&str, ResourceKind, &str); 5] = [
    ("database_endpoint", ResourceKind::Database, "endpoint"),
    ("cache_endpoint", ResourceKind::Cache, "endpoint"),
    ("secret_store_ref", ResourceKind::SecretStore, "reference"),
    ("compute_url", ResourceKind::ComputeService, "url"),
    ("load_balancer_dns", ResourceKind::LoadBalancer, "dns_name"),
];

/// Computes every output from a set of bindings.
///
/// # Errors
///
/// Returns `GraphError::UnresolvedPlaceholder` if a declared output refers
/// to a missing binding or attribute.
pub fn compute_outputs(
    declared: &[OutputConfig],
    bindings: &BTreeMap<String, ProviderBinding>,
) -> Result<Vec<Output>, GraphError> {
    let mut outputs: BTreeMap<String, Output> = BTreeMap::new();

    for (name, kind, attribute) in STANDARD_OUTPUTS {
        let found = bindings
            .values()
            .filter(|b| b.kind == kind && b.is_created())
            .find_map(|b| b.remote_attributes.get(attribute));

        if let Some(value) = found {
            outputs.insert(
                name.to_string(),
                Output {
                    name: name.to_string(),
                    value: value.clone(),
                    sensitive: false,
                },
            );
        }
    }

    for output in declared {
        let mut template = BTreeMap::new();
        template.insert(String::from("value"), Value::String(output.value.clone()));

        let owner = format!("output.{}", output.name);
        let mut rendered = resolve_attributes(&owner, &template, bindings)?;
        let value = rendered.remove("value").unwrap_or(Value::Null);

        outputs.insert(
            output.name.clone(),
            Output {
                name: output.name.clone(),
                value,
                sensitive: output.sensitive,
            },
        );
    }

    Ok(outputs.into_values().collect())
}

/// Looks up an output by name.
#[must_use]
pub fn find<'a>(outputs: &'a [Output], name: &str) -> Option<&'a Output> {
    outputs.iter().find(|o| o.name == name)
}

impl Output {
    /// Returns the value as display text, strings without quotes.
    #[must_use]
    pub fn display_value(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Returns false for a sensitive output when only non-sensitive ones may
    /// be shown.
    #[must_use]
    pub const fn is_visible(&self, non_sensitive: bool) -> bool {
        !(non_sensitive && self.sensitive)
    }
}
