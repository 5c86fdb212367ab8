//! Planning module for provisioning runs.
//!
//! This module compares the desired graph with recorded state, produces
//! ordered change sets, detects drift and executes changes against a
//! provider.

mod diff;
mod drift;
mod executor;
mod plan;

pub use diff::{ChangeAction, DiffEngine, DiffResult, ResourceDiff};
pub use drift::{AttributeDrift, DriftReport, refresh};
pub use executor::{ApplyReport, DEFAULT_PARALLELISM, FailedChange, PlanExecutor};
pub use plan::{Change, ChangeSet, plan_changes};
