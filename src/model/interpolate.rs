//! `${target.attribute}` placeholder scanning and substitution.
//!
//! A string made of a single placeholder is replaced by the referenced JSON
//! value as-is. Placeholders embedded in longer strings are stringified.

use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::GraphError;
use crate::state::ProviderBinding;

/// Namespace used by input variables (`${var.name}`).
pub const VARIABLE_NAMESPACE: &str = "var";

/// A parsed `${target.attribute}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    /// Resource id, or `var` for variables.
    pub target: String,
    /// Attribute path after the first dot.
    pub attribute: String,
}

impl Placeholder {
    /// Returns the placeholder body, `target.attribute`.
    #[must_use]
    pub fn body(&self) -> String {
        format!("{}.{}", self.target, self.attribute)
    }
}

enum Segment<'a> {
    Text(&'a str),
    Ref(Placeholder),
}

fn parse_body(body: &str) -> Option<Placeholder> {
    let (target, attribute) = body.trim().split_once('.')?;
    let target_ok = !target.is_empty()
        && target
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    let attribute_ok = !attribute.is_empty()
        && attribute
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');

    (target_ok && attribute_ok).then(|| Placeholder {
        target: target.to_string(),
        attribute: attribute.to_string(),
    })
}

fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            break;
        };
        let raw_end = start + 2 + end + 1;

        match parse_body(&after[..end]) {
            Some(placeholder) => {
                if start > 0 {
                    out.push(Segment::Text(&rest[..start]));
                }
                out.push(Segment::Ref(placeholder));
            }
            None => out.push(Segment::Text(&rest[..raw_end])),
        }
        rest = &rest[raw_end..];
    }

    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    out
}

/// Returns every placeholder in a string, in order of appearance.
#[must_use]
pub fn scan(text: &str) -> Vec<Placeholder> {
    segments(text)
        .into_iter()
        .filter_map(|s| match s {
            Segment::Ref(p) => Some(p),
            Segment::Text(_) => None,
        })
        .collect()
}

/// Collects placeholders from every string nested inside a value.
pub fn collect(value: &Value, out: &mut Vec<Placeholder>) {
    match value {
        Value::String(s) => out.extend(scan(s)),
        Value::Array(items) => items.iter().for_each(|v| collect(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect(v, out)),
        _ => {}
    }
}

/// Replaces placeholders inside a value.
///
/// The lookup returns `Ok(Some(value))` to substitute, `Ok(None)` to leave the
/// placeholder untouched, or an error to abort.
///
/// # Errors
///
/// Returns the first error produced by the lookup.
pub fn substitute<E, F>(value: &Value, lookup: &mut F) -> Result<Value, E>
where
    F: FnMut(&Placeholder) -> Result<Option<Value>, E>,
{
    match value {
        Value::String(s) => substitute_str(s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, lookup))
            .collect::<Result<Vec<_>, E>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), substitute(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str<E, F>(text: &str, lookup: &mut F) -> Result<Value, E>
where
    F: FnMut(&Placeholder) -> Result<Option<Value>, E>,
{
    let parts = segments(text);

    if let [Segment::Ref(placeholder)] = parts.as_slice() {
        return Ok(lookup(placeholder)?.unwrap_or_else(|| Value::String(text.to_string())));
    }

    let mut out = String::with_capacity(text.len());
    for part in parts {
        match part {
            Segment::Text(t) => out.push_str(t),
            Segment::Ref(placeholder) => match lookup(&placeholder)? {
                Some(Value::String(s)) => out.push_str(&s),
                Some(other) => out.push_str(&other.to_string()),
                None => {
                    out.push_str("${");
                    out.push_str(&placeholder.body());
                    out.push('}');
                }
            },
        }
    }
    Ok(Value::String(out))
}

/// Resolves resource placeholders in a resource's attributes from bindings.
///
/// `${id.id}` yields the remote id; any other attribute comes from the
/// binding's remote attributes.
///
/// # Errors
///
/// Returns `GraphError::UnresolvedPlaceholder` when a target has no binding,
/// no remote id, or no such attribute.
pub fn resolve_attributes(
    resource_id: &str,
    attributes: &BTreeMap<String, Value>,
    bindings: &BTreeMap<String, ProviderBinding>,
) -> Result<BTreeMap<String, Value>, GraphError> {
    let mut lookup = |p: &Placeholder| -> Result<Option<Value>, GraphError> {
        if p.target == VARIABLE_NAMESPACE {
            return Ok(None);
        }
        let unresolved = || GraphError::UnresolvedPlaceholder {
            resource: resource_id.to_string(),
            placeholder: p.body(),
        };
        let binding = bindings.get(&p.target).ok_or_else(unresolved)?;
        let value = if p.attribute == "id" {
            binding.remote_id.clone().map(Value::String)
        } else {
            binding.remote_attributes.get(&p.attribute).cloned()
        };
        value.map(Some).ok_or_else(unresolved)
    };

    let mut resolved = BTreeMap::new();
    for (key, value) in attributes {
        resolved.insert(key.clone(), substitute(value, &mut lookup)?);
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::model::ResourceKind;
    use serde_json::json;
    use std::convert::Infallible;

    fn binding(id: &str, remote_id: &str, attrs: Value) -> ProviderBinding {
        let mut b = ProviderBinding::new(id, ResourceKind::Database, ProviderKind::Aws);
        b.remote_id = Some(remote_id.to_string());
        if let Value::Object(map) = attrs {
            b.remote_attributes = map.into_iter().collect();
        }
        b
    }

    #[test]
    fn test_scan() {
        let found = scan("postgres://${db.endpoint}:${db.port}/${ broken");
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].target, "db");
        assert_eq!(found[1].attribute, "port");

        assert!(scan("${nodot} and ${.x} and $plain").is_empty());
    }

    #[test]
    fn test_whole_string_keeps_type() {
        let mut lookup = |_: &Placeholder| Ok::<_, Infallible>(Some(json!(5432)));
        let out = substitute(&json!("${db.port}"), &mut lookup).expect("substitute");
        assert_eq!(out, json!(5432));

        let out = substitute(&json!("port=${db.port}"), &mut lookup).expect("substitute");
        assert_eq!(out, json!("port=5432"));
    }

    #[test]
    fn test_untouched_placeholder() {
        let mut lookup = |_: &Placeholder| Ok::<_, Infallible>(None);
        let out = substitute(&json!({ "a": ["x-${n.id}-y"] }), &mut lookup).expect("substitute");
        assert_eq!(out, json!({ "a": ["x-${n.id}-y"] }));
    }

    #[test]
    fn test_resolve_attributes() {
        let mut bindings = BTreeMap::new();
        bindings.insert(
            String::from("db"),
            binding("db", "db-000002", json!({ "endpoint": "db.internal", "port": 5432 })),
        );

        let mut attributes = BTreeMap::new();
        attributes.insert(String::from("database"), json!("${db.id}"));
        attributes.insert(String::from("url"), json!("pg://${db.endpoint}:${db.port}"));

        let resolved = resolve_attributes("app", &attributes, &bindings).expect("resolve");
        assert_eq!(resolved["database"], json!("db-000002"));
        assert_eq!(resolved["url"], json!("pg://db.internal:5432"));

        attributes.insert(String::from("cache"), json!("${cache.endpoint}"));
        let err = resolve_attributes("app", &attributes, &bindings).expect_err("unresolved");
        assert!(err.to_string().contains("${cache.endpoint}"));
    }
}
