//! Configuration validation for topology specs.
//!
//! This module validates a topology before any remote call is made, so
//! configuration mistakes surface as validation errors rather than provider
//! failures half way through an apply.

use crate::error::{ConfigError, Result, TopoformError};
use crate::model::{ResourceKind, is_valid_id, references_in};
use crate::outputs::STANDARD_OUTPUTS;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    OutputConfig, ProjectConfig, ProviderConfig, ResourceConfig, StateBackend, StateConfig,
    TopologyConfig,
};

/// Generic size tiers understood by every provider adapter.
pub const SIZE_TIERS: &[&str] = &["small", "medium", "large", "xlarge"];

/// Validator for topology configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a topology configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn validate(&self, config: &TopologyConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if let Some(first_error) = result.errors.first() {
            return Err(TopoformError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }));
        }
        debug!("Configuration validation passed");
        Ok(result)
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &TopologyConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_provider(&config.provider, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_variables(config, &mut result);
        Self::validate_resources(&config.resources, &mut result);
        Self::validate_outputs(&config.outputs, &config.resources, &mut result);

        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        } else if !is_valid_name(&project.environment) {
            result.error(
                "project.environment",
                format!("Environment '{}' is invalid", project.environment),
            );
        }
    }

    /// Validates provider settings.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.region.trim().is_empty() {
            result.error("provider.region", "Region cannot be empty");
        }

        match provider.endpoint.as_deref() {
            None => result.error(
                "provider.endpoint",
                "An API endpoint (http(s) URL, `sim` or `sim:<file>`) is required",
            ),
            Some(endpoint)
                if !(provider.is_simulated()
                    || endpoint.starts_with("http://")
                    || endpoint.starts_with("https://")) =>
            {
                result.error(
                    "provider.endpoint",
                    format!("Endpoint '{endpoint}' must be an http(s) URL, `sim` or `sim:<file>`"),
                );
            }
            Some(_) => {}
        }

        if let Some(credentials) = &provider.credentials {
            if provider.credentials_env().is_none_or(str::is_empty) {
                result.error(
                    "provider.credentials",
                    format!("Credentials '{credentials}' must have the form env:NAME"),
                );
            }
        } else if !provider.is_simulated() {
            result
                .warnings
                .push(String::from("provider.credentials: no credentials configured"));
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    /// Validates variable declarations.
    fn validate_variables(config: &TopologyConfig, result: &mut ValidationResult) {
        for name in config.variables.keys() {
            if !is_valid_id(name) {
                result.error(
                    format!("variables.{name}"),
                    format!("Variable name '{name}' is invalid"),
                );
            }
        }
    }

    /// Validates all resource configurations.
    fn validate_resources(resources: &[ResourceConfig], result: &mut ValidationResult) {
        if resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources defined in configuration"));
            return;
        }

        let declared: HashSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen_ids = HashSet::new();

        for (i, resource) in resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_ids.insert(resource.id.as_str()) {
                result.error(
                    format!("{prefix}.id"),
                    format!("Duplicate resource id: {}", resource.id),
                );
            }

            if !is_valid_id(&resource.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with '-' or '_', starting with a letter.",
                        resource.id
                    ),
                );
            }

            for dep in &resource.depends_on {
                if dep == &resource.id {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Resource '{}' depends on itself", resource.id),
                    );
                } else if !declared.contains(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Unknown resource '{dep}'"),
                    );
                }
            }

            for (key, value) in &resource.attributes {
                for target in references_in(value) {
                    if !declared.contains(target.as_str()) {
                        result.error(
                            format!("{prefix}.attributes.{key}"),
                            format!("Placeholder references unknown resource '{target}'"),
                        );
                    }
                }
            }

            Self::validate_attributes(resource, &prefix, result);
        }
    }

    /// Validates kind-specific required attributes.
    fn validate_attributes(resource: &ResourceConfig, prefix: &str, result: &mut ValidationResult) {
        let required: &[&str] = match resource.kind {
            ResourceKind::Network => &["cidr"],
            ResourceKind::Subnet => &["network", "cidr"],
            ResourceKind::ComputeService => &["image"],
            ResourceKind::LoadBalancer => &["target"],
            ResourceKind::Database
            | ResourceKind::Cache
            | ResourceKind::SecretStore
            | ResourceKind::LogGroup => &[],
        };

        for attribute in required {
            if !resource.attributes.contains_key(*attribute) {
                result.error(
                    format!("{prefix}.attributes.{attribute}"),
                    format!(
                        "{} '{}' requires attribute '{attribute}'",
                        resource.kind, resource.id
                    ),
                );
            }
        }

        if let Some(size) = resource.attributes.get("size") {
            let valid = size.as_str().is_some_and(|s| SIZE_TIERS.contains(&s));
            if !valid {
                result.error(
                    format!("{prefix}.attributes.size"),
                    format!("Size {size} is not one of {}", SIZE_TIERS.join(", ")),
                );
            }
        }

        if let Some(image) = resource.attributes.get("image").and_then(|v| v.as_str()) {
            if image.ends_with(":latest") {
                result.warnings.push(format!(
                    "{prefix}.attributes.image: Using ':latest' tag is not recommended for production"
                ));
            }
        }
    }

    /// Validates declared outputs.
    fn validate_outputs(
        outputs: &[OutputConfig],
        resources: &[ResourceConfig],
        result: &mut ValidationResult,
    ) {
        let declared: HashSet<&str> = resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen_names = HashSet::new();

        for (i, output) in outputs.iter().enumerate() {
            let prefix = format!("outputs[{i}]");

            if !seen_names.insert(output.name.as_str()) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Duplicate output name: {}", output.name),
                );
            }

            if !is_valid_id(&output.name) {
                result.error(
                    format!("{prefix}.name"),
                    format!("Output name '{}' is invalid", output.name),
                );
            }

            if STANDARD_OUTPUTS.iter().any(|(name, _, _)| *name == output.name) {
                result.warnings.push(format!(
                    "{prefix}.name: '{}' replaces the standard output of the same name",
                    output.name
                ));
            }

            let value = serde_json::Value::String(output.value.clone());
            for target in references_in(&value) {
                if !declared.contains(target.as_str()) {
                    result.error(
                        format!("{prefix}.value"),
                        format!("Output references unknown resource '{target}'"),
                    );
                }
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    // First character must be a letter
    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    // Rest must be lowercase alphanumeric or hyphen
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    // Cannot end with hyphen or have consecutive hyphens
    !name.ends_with('-') && !name.contains("--")
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;

    fn parse(yaml: &str) -> TopologyConfig {
        ConfigParser::new().parse_yaml(yaml, None).expect("parse")
    }

    const BASE: &str = r"
project:
  name: shop
provider:
  kind: aws
  region: eu-west-1
  endpoint: sim
";

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("shop"));
        assert!(is_valid_name("my-shop-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Shop")); // uppercase
        assert!(!is_valid_name("123-shop")); // starts with number
        assert!(!is_valid_name("shop_api")); // underscore
        assert!(!is_valid_name("shop-")); // ends with hyphen
        assert!(!is_valid_name("shop--api")); // consecutive hyphens
    }

    #[test]
    fn test_valid_topology() {
        let config = parse(&format!(
            "{BASE}
resources:
  - id: net
    kind: network
    attributes:
      cidr: 10.0.0.0/16
  - id: db
    kind: database
    attributes:
      network: ${{net.id}}
      size: medium
outputs:
  - name: db_host
    value: ${{db.endpoint}}
"
        ));
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_reports_every_problem() {
        let config = parse(&format!(
            "{BASE}
resources:
  - id: net
    kind: network
  - id: net
    kind: cache
    attributes:
      size: huge
      network: ${{vpc.id}}
    depends_on: [missing]
outputs:
  - name: x
    value: ${{ghost.url}}
"
        ));
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();

        assert!(fields.contains(&"resources[0].attributes.cidr"));
        assert!(fields.contains(&"resources[1].id"));
        assert!(fields.contains(&"resources[1].attributes.size"));
        assert!(fields.contains(&"resources[1].attributes.network"));
        assert!(fields.contains(&"resources[1].depends_on"));
        assert!(fields.contains(&"outputs[0].value"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_provider_and_state_rules() {
        let mut config = parse(BASE);
        config.provider.endpoint = Some(String::from("ftp://nope"));
        config.provider.credentials = Some(String::from("plain-token"));
        config.state.backend = StateBackend::S3;

        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["provider.endpoint", "provider.credentials", "state.bucket"]);

        let err = ConfigValidator::new().validate(&config).expect_err("invalid");
        let TopoformError::Config(ConfigError::ValidationError { field, .. }) = err else {
            panic!("expected validation error, got {err:?}");
        };
        assert_eq!(field.as_deref(), Some("provider.endpoint"));
    }
}
