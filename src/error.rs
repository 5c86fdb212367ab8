//! Error types for the topoform provisioning system.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state management, provider calls,
//! planning and applying.

use std::path::PathBuf;
use thiserror::Error;

use crate::config::ProviderKind;
use crate::planner::ApplyReport;
use crate::state::ProviderBinding;

/// The main error type for topoform.
#[derive(Debug, Error)]
pub enum TopoformError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider API errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse error classes surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad configuration or graph, caught before any remote call.
    Validation,
    /// Lock or state race.
    Conflict,
    /// Remote API failure.
    Provider,
    /// A composite create that only partly succeeded.
    PartialFailure,
    /// Anything else.
    Internal,
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A required input variable has no value and no default.
    #[error("Variable '{name}' is required but has no value and no default")]
    MissingVariable {
        /// Variable name.
        name: String,
    },

    /// A variable value does not match its declared type.
    #[error("Variable '{name}' expects a {expected} value, got '{found}'")]
    InvalidVariable {
        /// Variable name.
        name: String,
        /// Declared type.
        expected: String,
        /// Offending raw value.
        found: String,
    },

    /// A placeholder names an undeclared variable.
    #[error("Undeclared variable referenced: {name}")]
    UnknownVariable {
        /// Variable name.
        name: String,
    },
}

/// Resource graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two resources share the same logical id.
    #[error("Duplicate resource id: {id}")]
    DuplicateResource {
        /// The duplicated id.
        id: String,
    },

    /// A resource references an id that is not declared.
    #[error("Resource '{from}' references undeclared resource '{to}'")]
    DanglingReference {
        /// Referencing resource.
        from: String,
        /// Missing target.
        to: String,
    },

    /// The references form a cycle.
    #[error("Cyclic dependency between: {}", members.join(", "))]
    CyclicDependency {
        /// Every resource id on the cycle, sorted.
        members: Vec<String>,
    },

    /// A placeholder could not be resolved from dependency bindings.
    #[error("Resource '{resource}' cannot resolve '${{{placeholder}}}'")]
    UnresolvedPlaceholder {
        /// Resource holding the placeholder.
        resource: String,
        /// The placeholder body (`id.attr`).
        placeholder: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// The lock could not be obtained before the timeout elapsed.
    #[error("Timed out after {waited_secs}s waiting for state lock held by {holder}")]
    LockTimeout {
        /// Identifier of the lock holder at the last attempt.
        holder: String,
        /// Seconds spent waiting.
        waited_secs: u64,
    },

    /// The stored state advanced or the lock was lost since it was loaded.
    #[error("State conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The stored state belongs to another project or environment.
    #[error("State belongs to {found}, expected {expected}")]
    EnvironmentMismatch {
        /// Expected `project/environment`.
        expected: String,
        /// Found `project/environment`.
        found: String,
    },

    /// Storage backend error.
    #[error("State backend error: {message}")]
    Backend {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Provider API errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials were rejected.
    #[error("{provider} rejected credentials: {message}")]
    Unauthorized {
        /// Provider that rejected the call.
        provider: ProviderKind,
        /// Description of the failure.
        message: String,
    },

    /// Rate limited.
    #[error("{provider} API throttled, retry after {retry_after_secs} seconds")]
    Throttled {
        /// Throttling provider.
        provider: ProviderKind,
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// The remote service is temporarily unavailable or unreachable.
    #[error("{provider} API unavailable: {message}")]
    Unavailable {
        /// Provider.
        provider: ProviderKind,
        /// Description of the outage.
        message: String,
    },

    /// Remote object not found.
    #[error("{provider} object not found: {remote_id}")]
    NotFound {
        /// Provider.
        provider: ProviderKind,
        /// Remote identifier.
        remote_id: String,
    },

    /// API request failed with a non-retryable status.
    #[error("{provider} API request failed: {status} - {message}")]
    Api {
        /// Provider.
        provider: ProviderKind,
        /// HTTP-like status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// The API answered with something unreadable.
    #[error("Invalid response from {provider} API: {message}")]
    InvalidResponse {
        /// Provider.
        provider: ProviderKind,
        /// Description of the response issue.
        message: String,
    },

    /// An attribute combination this provider cannot express.
    #[error("Unsupported configuration for '{resource}': attribute '{attribute}' {reason}")]
    UnsupportedConfiguration {
        /// Resource id.
        resource: String,
        /// Offending attribute.
        attribute: String,
        /// Why it is unsupported.
        reason: String,
    },

    /// A composite create that stopped part way.
    #[error("Partial failure creating '{resource}' ({} remote objects recorded): {source}", binding.components.len())]
    PartialFailure {
        /// Resource id.
        resource: String,
        /// Binding carrying every remote id obtained so far.
        binding: Box<ProviderBinding>,
        /// The step failure.
        source: Box<ProviderError>,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A saved plan no longer matches the state it was computed against.
    #[error("Saved plan is stale: {reason}")]
    StalePlan {
        /// What changed.
        reason: String,
    },

    /// A saved plan file could not be read.
    #[error("Invalid plan file {path}: {message}")]
    InvalidPlanFile {
        /// Plan file path.
        path: PathBuf,
        /// Description.
        message: String,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// The operator declined the plan or the run was interrupted.
    #[error("Apply cancelled: {reason}")]
    Cancelled {
        /// Reason for cancellation.
        reason: String,
    },

    /// A worker task died before reporting.
    #[error("Worker for '{resource}' terminated abnormally: {message}")]
    WorkerPanicked {
        /// Resource the worker was handling.
        resource: String,
        /// Join error text.
        message: String,
    },

    /// State could not be committed mid-apply; the report holds every
    /// outcome observed before the run stopped.
    #[error("State checkpoint failed: {source}")]
    CheckpointFailed {
        /// Outcomes recorded up to the failure.
        report: Box<ApplyReport>,
        /// Commit error.
        source: Box<TopoformError>,
    },
}

impl ApplyError {
    /// Returns the operator-facing class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::CheckpointFailed { source, .. } => source.class(),
            Self::Cancelled { .. } | Self::WorkerPanicked { .. } => ErrorClass::Internal,
        }
    }
}

/// Result type alias for topoform operations.
pub type Result<T> = std::result::Result<T, TopoformError>;

impl TopoformError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns the operator-facing class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Config(_) | Self::Graph(_) | Self::Plan(_) => ErrorClass::Validation,
            Self::State(e) => e.class(),
            Self::Provider(e) => e.class(),
            Self::Apply(e) => e.class(),
            Self::Io(_) | Self::Internal(_) => ErrorClass::Internal,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_transient(),
            Self::State(StateError::LockedByOther { .. } | StateError::Conflict { .. }) => true,
            _ => false,
        }
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(e) => e.retry_delay_secs(),
            Self::State(StateError::LockedByOther { .. } | StateError::Conflict { .. }) => Some(2),
            _ => None,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a conflict error with the given message.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Returns the operator-facing class of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::LockFailed { .. }
            | Self::LockedByOther { .. }
            | Self::LockTimeout { .. }
            | Self::Conflict { .. } => ErrorClass::Conflict,
            Self::EnvironmentMismatch { .. } | Self::VersionMismatch { .. } => {
                ErrorClass::Validation
            }
            Self::Corrupted { .. } | Self::Backend { .. } | Self::SerializationError { .. } => {
                ErrorClass::Internal
            }
        }
    }
}

impl ProviderError {
    /// Creates an API error.
    #[must_use]
    pub fn api(provider: ProviderKind, status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            provider,
            status,
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(provider: ProviderKind, message: impl Into<String>) -> Self {
        Self::Unavailable {
            provider,
            message: message.into(),
        }
    }

    /// Creates an unsupported configuration error.
    #[must_use]
    pub fn unsupported(
        resource: impl Into<String>,
        attribute: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::UnsupportedConfiguration {
            resource: resource.into(),
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// Returns true for failure classes worth retrying (throttling, outages).
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled { .. } | Self::Unavailable { .. })
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Throttled {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            Self::Unavailable { .. } => Some(2),
            _ => None,
        }
    }

    /// Returns the operator-facing class of this error.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::UnsupportedConfiguration { .. } => ErrorClass::Validation,
            Self::PartialFailure { .. } => ErrorClass::PartialFailure,
            _ => ErrorClass::Provider,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Conflict => "conflict",
            Self::Provider => "provider",
            Self::PartialFailure => "partial_failure",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}
