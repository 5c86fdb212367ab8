//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{ProviderKind, VariableResolver};

/// Topoform - declarative provisioning of one topology on AWS, GCP or Azure.
#[derive(Parser, Debug)]
#[command(name = "topoform")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "TOPOFORM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Sets an input variable (`name=value`); may be repeated.
    #[arg(long = "var", global = true, value_parser = VariableResolver::parse_assignment)]
    pub vars: Vec<(String, String)>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format on stderr (text, json).
    #[arg(long, global = true, default_value = "text", env = "TOPOFORM_LOG_FORMAT")]
    pub log_format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new topoform project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Provider the generated configuration targets.
        #[arg(long, default_value = "aws", value_parser = parse_provider)]
        template: ProviderKind,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute the change set. Exits 0 with no changes, 2 with changes.
    Plan {
        /// Save the change set for a later `apply`.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Read remote objects back before planning.
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        refresh: bool,

        /// Hold the state lock while planning.
        #[arg(long)]
        lock: bool,
    },

    /// Apply the configuration, or a saved plan.
    Apply {
        /// Saved plan file from `plan --out`.
        plan: Option<PathBuf>,

        /// Skip the confirmation prompt.
        #[arg(long)]
        auto_approve: bool,

        /// Number of changes in flight.
        #[arg(long, default_value = "4")]
        parallelism: usize,
    },

    /// Destroy every resource recorded in state.
    Destroy {
        /// Skip the confirmation prompt.
        #[arg(long)]
        auto_approve: bool,

        /// Number of changes in flight.
        #[arg(long, default_value = "4")]
        parallelism: usize,
    },

    /// Show outputs of the last successful apply.
    Output {
        /// Single output to print.
        name: Option<String>,

        /// Leave out sensitive outputs.
        #[arg(long)]
        non_sensitive: bool,
    },

    /// Check for drift between configuration and remote objects.
    Drift,

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock; must match the current lock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Remove the lock whoever holds it (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

fn parse_provider(s: &str) -> Result<ProviderKind, String> {
    s.parse()
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Command-line variable assignments, later ones winning.
    #[must_use]
    pub fn variable_overrides(&self) -> std::collections::BTreeMap<String, String> {
        self.vars.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_flags() {
        let cli = Cli::try_parse_from([
            "topoform",
            "--var",
            "size=large",
            "--var",
            "size=xlarge",
            "plan",
            "--refresh",
            "false",
            "--out",
            "plan.json",
        ])
        .expect("parse");

        assert_eq!(cli.variable_overrides()["size"], "xlarge");
        let Commands::Plan { out, refresh, lock } = cli.command else {
            panic!("expected plan");
        };
        assert_eq!(out, Some(PathBuf::from("plan.json")));
        assert!(!refresh);
        assert!(!lock);
    }

    #[test]
    fn test_apply_and_globals() {
        let cli = Cli::try_parse_from([
            "topoform",
            "apply",
            "saved.json",
            "--auto-approve",
            "--parallelism",
            "8",
            "--output",
            "json",
        ])
        .expect("parse");

        assert_eq!(cli.output, OutputFormat::Json);
        let Commands::Apply {
            plan,
            auto_approve,
            parallelism,
        } = cli.command
        else {
            panic!("expected apply");
        };
        assert_eq!(plan, Some(PathBuf::from("saved.json")));
        assert!(auto_approve);
        assert_eq!(parallelism, 8);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Cli::try_parse_from(["topoform", "--var", "novalue", "plan"]).is_err());
        assert!(Cli::try_parse_from(["topoform", "init", "--template", "openstack"]).is_err());

        let cli = Cli::try_parse_from(["topoform", "init", "--template", "gcp"]).expect("parse");
        assert!(matches!(
            cli.command,
            Commands::Init {
                template: ProviderKind::Gcp,
                ..
            }
        ));
    }
}
