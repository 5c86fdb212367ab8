//! Configuration module for topoform.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `topoform.yaml`
//! - Typed input variables and `${var.*}` substitution
//! - Validation of configuration values
//! - Computing configuration hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;
mod variables;

pub use hash::ConfigHasher;
pub use parser::{ConfigParser, DEFAULT_CONFIG_FILES, find_config_file};
pub use spec::{
    OutputConfig, ProjectConfig, ProviderConfig, ProviderKind, ResourceConfig, StateBackend,
    StateConfig, TopologyConfig, VariableDecl, VariableType,
};
pub use validator::{ConfigValidator, SIZE_TIERS, ValidationError, ValidationResult};
pub use variables::{ENV_PREFIX, VariableResolver};
