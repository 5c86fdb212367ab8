// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // Public items should be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Topoform
//!
//! Declarative provisioning of one application topology on AWS, GCP or Azure.
//!
//! ## Overview
//!
//! A topology is a set of provider-agnostic resources (network, subnet,
//! database, cache, compute service, secret store, load balancer, log group)
//! that reference each other through `${id.attribute}` placeholders.
//! Topoform:
//!
//! - Builds a dependency graph from the declared resources
//! - Compares it with recorded state and computes an ordered change set
//! - Applies the change set through the selected provider adapter, in parallel
//!   where the graph allows
//! - Persists state under a lock, locally or in S3
//! - Renders outputs (endpoints, URLs, secret references) for consumers
//!
//! ## Architecture
//!
//! 1. **Desired graph**: built from `topoform.yaml`
//! 2. **Recorded state**: provider bindings from the last apply
//! 3. **Engine**: plans, waits for approval, applies and commits
//!
//! ## Modules
//!
//! - [`config`]: Configuration parsing, variables and validation
//! - [`model`]: Resources, placeholders and the dependency graph
//! - [`provider`]: Cloud transports and per-provider adapters
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`planner`]: Diffing, change sets, drift and execution
//! - [`engine`]: Plan/apply lifecycle
//! - [`outputs`]: Output contract
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   environment: dev
//!
//! provider:
//!   kind: aws
//!   region: eu-west-1
//!   endpoint: sim
//!
//! resources:
//!   - id: net
//!     kind: network
//!     attributes:
//!       cidr: 10.0.0.0/16
//!   - id: db
//!     kind: database
//!     attributes:
//!       network: ${net.id}
//!       size: medium
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod outputs;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, TopologyConfig};
pub use engine::{ApplyOutcome, Approver, AutoApprove, Desired, Engine, Phase};
pub use error::{ErrorClass, Result, TopoformError};
pub use model::{Graph, Resource, ResourceKind, build_graph};
pub use outputs::Output;
pub use planner::{ChangeAction, ChangeSet, DriftReport, PlanExecutor};
pub use provider::{ProviderAdapter, adapter_for, connect};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
