//! Resource model and dependency graph.
//!
//! - Typed resource descriptions built from configuration
//! - `${id.attr}` placeholder handling
//! - Graph construction, cycle detection and ordering

mod graph;
pub mod interpolate;
mod resource;

pub use graph::{Graph, build_graph};
pub use resource::{Resource, ResourceKind, is_valid_id, references_in};
