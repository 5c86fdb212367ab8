//! Configuration parser for loading and merging configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, Result, TopoformError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::spec::TopologyConfig;

/// Configuration parser for loading topology configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<TopologyConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(TopoformError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            TopoformError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<TopologyConfig> {
        debug!("Parsing YAML configuration");

        let config: TopologyConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source
                .map(|p| p.display().to_string())
                .or_else(|| e.location().map(|l| format!("line {}, column {}", l.line(), l.column())));
            TopoformError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!("Successfully parsed configuration for project: {}", config.project.name);
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `TOPOFORM_<SECTION>_<KEY>` (e.g., `TOPOFORM_PROJECT_ENVIRONMENT`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<TopologyConfig> {
        let mut config = self.load_file(path)?;

        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok());

        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(config: &mut TopologyConfig, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(env) = lookup("TOPOFORM_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Some(region) = lookup("TOPOFORM_PROVIDER_REGION") {
            debug!("Overriding provider.region from environment");
            config.provider.region = region;
        }

        if let Some(endpoint) = lookup("TOPOFORM_PROVIDER_ENDPOINT") {
            debug!("Overriding provider.endpoint from environment");
            config.provider.endpoint = Some(endpoint);
        }

        if let Some(bucket) = lookup("TOPOFORM_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                TopoformError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Reads the API token named by `provider.credentials` (`env:NAME`).
    ///
    /// Returns `None` when no credentials are configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the named variable is not set.
    pub fn resolve_credentials(config: &TopologyConfig) -> Result<Option<String>> {
        let Some(name) = config.provider.credentials_env() else {
            return Ok(None);
        };

        std::env::var(name).map(Some).map_err(|_| {
            TopoformError::Config(ConfigError::MissingEnvVar {
                name: name.to_string(),
            })
        })
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["topoform.yaml", "topoform.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(TopoformError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderKind, StateBackend};
    use crate::model::ResourceKind;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
provider:
  kind: aws
  region: eu-west-1
";
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("parse");

        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: shop
  environment: prod

provider:
  kind: azure
  region: westeurope
  credentials: env:AZURE_TOKEN

state:
  backend: s3
  bucket: shop-state

variables:
  db_size:
    type: string
    default: medium

resources:
  - id: net
    kind: network
    attributes:
      cidr: 10.0.0.0/16
  - id: db
    kind: database
    attributes:
      network: ${net.id}
      size: ${var.db_size}
  - id: app
    kind: compute_service
    attributes:
      image: ghcr.io/shop/app:1.4
      env:
        DATABASE_HOST: ${db.endpoint}
    depends_on: [db]

outputs:
  - name: api
    value: ${app.url}
"#;
        let parser = ConfigParser::new();
        let config = parser.parse_yaml(yaml, None).expect("parse");

        assert_eq!(config.provider.kind, ProviderKind::Azure);
        assert_eq!(config.resources.len(), 3);
        assert_eq!(config.resources[2].kind, ResourceKind::ComputeService);
        assert_eq!(config.resources[2].depends_on, vec![String::from("db")]);
        assert_eq!(config.outputs[0].value, "${app.url}");
        assert_eq!(config.state_key(), "shop/prod/state.json");
    }

    #[test]
    fn test_parse_error_reports() {
        let err = ConfigParser::new()
            .parse_yaml("project: [", None)
            .expect_err("invalid yaml");
        assert!(matches!(err, TopoformError::Config(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let yaml = r"
project:
  name: shop
provider:
  kind: gcp
  region: europe-west1
";
        let mut config = ConfigParser::new().parse_yaml(yaml, None).expect("parse");
        ConfigParser::apply_env_overrides(&mut config, |name| match name {
            "TOPOFORM_PROJECT_ENVIRONMENT" => Some(String::from("staging")),
            "TOPOFORM_PROVIDER_ENDPOINT" => Some(String::from("sim")),
            _ => None,
        });
        assert_eq!(config.project.environment, "staging");
        assert!(config.provider.is_simulated());
        assert_eq!(config.provider.region, "europe-west1");
    }

    #[test]
    fn test_find_config_file() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("a/b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(temp.path().join("topoform.yaml"), "x").expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, temp.path().join("topoform.yaml"));
    }
}
