//! Typed input variables.
//!
//! Values come from `--var name=value`, then `TOPOFORM_VAR_<name>`
//! environment variables, then the declared default. `${var.name}`
//! placeholders are substituted in provider settings, resource attributes
//! and output templates before anything else looks at the configuration.

use serde_json::{Number, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::spec::{TopologyConfig, VariableDecl, VariableType};
use crate::error::{ConfigError, Result, TopoformError};
use crate::model::interpolate::{Placeholder, VARIABLE_NAMESPACE, substitute};

/// Prefix of environment variables that set input variables.
pub const ENV_PREFIX: &str = "TOPOFORM_VAR_";

/// Resolves declared variables and substitutes them into a configuration.
#[derive(Debug, Clone, Default)]
pub struct VariableResolver {
    overrides: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl VariableResolver {
    /// Creates a resolver from command-line assignments only.
    #[must_use]
    pub fn new(overrides: BTreeMap<String, String>) -> Self {
        Self {
            overrides,
            env: BTreeMap::new(),
        }
    }

    /// Creates a resolver that also reads `TOPOFORM_VAR_*` from the process environment.
    #[must_use]
    pub fn from_process_env(overrides: BTreeMap<String, String>) -> Self {
        let env = std::env::vars()
            .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|name| (name.to_string(), v)))
            .collect();
        Self { overrides, env }
    }

    /// Adds an environment-sourced value.
    #[must_use]
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Parses a `name=value` assignment.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no `=` or the name is empty.
    pub fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
        match s.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok((name.trim().to_string(), value.to_string()))
            }
            _ => Err(format!("Invalid variable assignment: {s}. Expected NAME=VALUE")),
        }
    }

    /// Resolves every declared variable to a typed value.
    ///
    /// # Errors
    ///
    /// Returns `MissingVariable` for a required variable without a value,
    /// `InvalidVariable` for a type mismatch and `UnknownVariable` for an
    /// assignment to an undeclared name.
    pub fn resolve(&self, declared: &BTreeMap<String, VariableDecl>) -> Result<BTreeMap<String, Value>> {
        if let Some(unknown) = self.overrides.keys().find(|k| !declared.contains_key(*k)) {
            return Err(TopoformError::Config(ConfigError::UnknownVariable {
                name: unknown.clone(),
            }));
        }

        let mut values = BTreeMap::new();
        for (name, decl) in declared {
            let value = if let Some(raw) = self.overrides.get(name) {
                debug!("Variable {name} set on the command line");
                coerce(name, decl.var_type, raw)?
            } else if let Some(raw) = self.env.get(name) {
                debug!("Variable {name} set from {ENV_PREFIX}{name}");
                coerce(name, decl.var_type, raw)?
            } else if let Some(default) = &decl.default {
                check_default(name, decl.var_type, default)?
            } else {
                return Err(TopoformError::Config(ConfigError::MissingVariable {
                    name: name.clone(),
                }));
            };
            values.insert(name.clone(), value);
        }
        Ok(values)
    }

    /// Returns the configuration with every `${var.*}` placeholder substituted.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be resolved or a placeholder
    /// names an undeclared variable.
    pub fn apply(&self, mut config: TopologyConfig) -> Result<TopologyConfig> {
        let values = self.resolve(&config.variables)?;

        let mut lookup = |p: &Placeholder| -> std::result::Result<Option<Value>, ConfigError> {
            if p.target != VARIABLE_NAMESPACE {
                return Ok(None);
            }
            values
                .get(&p.attribute)
                .cloned()
                .map(Some)
                .ok_or_else(|| ConfigError::UnknownVariable {
                    name: p.attribute.clone(),
                })
        };

        let mut substitute_text = |text: &str| -> std::result::Result<String, ConfigError> {
            match substitute(&Value::String(text.to_string()), &mut lookup)? {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            }
        };

        config.provider.region = substitute_text(&config.provider.region)?;
        if let Some(endpoint) = &config.provider.endpoint {
            config.provider.endpoint = Some(substitute_text(endpoint)?);
        }
        if let Some(credentials) = &config.provider.credentials {
            config.provider.credentials = Some(substitute_text(credentials)?);
        }
        for output in &mut config.outputs {
            output.value = substitute_text(&output.value)?;
        }

        for resource in &mut config.resources {
            let mut attributes = BTreeMap::new();
            for (key, value) in &resource.attributes {
                attributes.insert(key.clone(), substitute(value, &mut lookup)?);
            }
            resource.attributes = attributes;
        }

        Ok(config)
    }
}

fn invalid(name: &str, expected: VariableType, found: impl Into<String>) -> TopoformError {
    TopoformError::Config(ConfigError::InvalidVariable {
        name: name.to_string(),
        expected: expected.to_string(),
        found: found.into(),
    })
}

fn coerce(name: &str, var_type: VariableType, raw: &str) -> Result<Value> {
    match var_type {
        VariableType::String => Ok(Value::String(raw.to_string())),
        VariableType::Number => {
            let trimmed = raw.trim();
            if let Ok(n) = trimmed.parse::<i64>() {
                return Ok(Value::Number(n.into()));
            }
            trimmed
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| invalid(name, var_type, raw))
        }
        VariableType::Bool => match raw.trim().to_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(invalid(name, var_type, raw)),
        },
    }
}

fn check_default(name: &str, var_type: VariableType, value: &Value) -> Result<Value> {
    let matches = match var_type {
        VariableType::String => value.is_string(),
        VariableType::Number => value.is_number(),
        VariableType::Bool => value.is_boolean(),
    };
    if matches {
        Ok(value.clone())
    } else {
        Err(invalid(name, var_type, value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> TopologyConfig {
        serde_yaml::from_str(
            r#"
project:
  name: shop
provider:
  kind: gcp
  region: ${var.region}
variables:
  region:
    type: string
    default: europe-west1
  replicas:
    type: number
  public:
    type: bool
    default: false
resources:
  - id: app
    kind: compute_service
    attributes:
      image: "shop:${var.replicas}"
      replicas: ${var.replicas}
      public: ${var.public}
outputs:
  - name: where
    value: "${var.region}"
"#,
        )
        .expect("parse")
    }

    fn overrides(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect()
    }

    #[test]
    fn test_missing_required_variable() {
        let err = VariableResolver::new(BTreeMap::new())
            .apply(config())
            .expect_err("missing");
        assert!(matches!(
            err,
            TopoformError::Config(ConfigError::MissingVariable { ref name }) if name == "replicas"
        ));
    }

    #[test]
    fn test_precedence_and_types() {
        let resolved = VariableResolver::new(overrides(&[("replicas", "3")]))
            .with_env("replicas", "9")
            .with_env("region", "us-central1")
            .apply(config())
            .expect("apply");

        assert_eq!(resolved.provider.region, "us-central1");
        let app = &resolved.resources[0];
        assert_eq!(app.attributes["replicas"], json!(3));
        assert_eq!(app.attributes["public"], json!(false));
        assert_eq!(app.attributes["image"], json!("shop:3"));
        assert_eq!(resolved.outputs[0].value, "us-central1");
    }

    #[test]
    fn test_invalid_values() {
        let err = VariableResolver::new(overrides(&[("replicas", "many")]))
            .apply(config())
            .expect_err("invalid number");
        assert!(matches!(err, TopoformError::Config(ConfigError::InvalidVariable { .. })));

        let err = VariableResolver::new(overrides(&[("replicas", "1"), ("public", "yes")]))
            .apply(config())
            .expect_err("invalid bool");
        assert!(matches!(err, TopoformError::Config(ConfigError::InvalidVariable { .. })));
    }

    #[test]
    fn test_unknown_variable() {
        let err = VariableResolver::new(overrides(&[("replicas", "1"), ("nope", "x")]))
            .apply(config())
            .expect_err("unknown");
        assert!(matches!(err, TopoformError::Config(ConfigError::UnknownVariable { .. })));

        let mut cfg = config();
        cfg.provider.region = String::from("${var.zone}");
        let err = VariableResolver::new(overrides(&[("replicas", "1")]))
            .apply(cfg)
            .expect_err("undeclared placeholder");
        assert!(matches!(err, TopoformError::Config(ConfigError::UnknownVariable { .. })));
    }

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            VariableResolver::parse_assignment("region=eu-west-1"),
            Ok((String::from("region"), String::from("eu-west-1")))
        );
        assert_eq!(
            VariableResolver::parse_assignment("dsn=a=b"),
            Ok((String::from("dsn"), String::from("a=b")))
        );
        assert!(VariableResolver::parse_assignment("novalue").is_err());
    }
}
