//! CLI module for topoform.
//!
//! This module provides the command-line interface: argument parsing,
//! result formatting and interactive approval.

mod commands;
mod output;
mod prompt;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
pub use prompt::PromptApprover;
