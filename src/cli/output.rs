//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; text output uses tables and colors,
//! JSON output is meant for scripts.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{TopologyConfig, ValidationResult};
use crate::engine::{ApplyOutcome, Phase};
use crate::outputs::Output;
use crate::planner::{ApplyReport, ChangeAction, ChangeSet, DriftReport};
use crate::state::{LockInfo, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Change row for table display.
#[derive(Tabled)]
struct ChangeRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Binding row for table display.
#[derive(Tabled)]
struct BindingRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Remote ID")]
    remote_id: String,
}

/// Output row for table display.
#[derive(Tabled)]
struct OutputRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Serialize)]
struct PlanJson<'a> {
    #[serde(flatten)]
    changes: &'a ChangeSet,
    creates: usize,
    updates: usize,
    destroys: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    drift: Option<&'a DriftReport>,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a change set.
    #[must_use]
    pub fn format_plan(&self, changes: &ChangeSet, drift: Option<&DriftReport>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&PlanJson {
                changes,
                creates: changes.count(ChangeAction::Create),
                updates: changes.count(ChangeAction::Update),
                destroys: changes.count(ChangeAction::Destroy),
                drift,
            }),
            OutputFormat::Text => Self::format_plan_text(changes, drift),
        }
    }

    fn format_plan_text(changes: &ChangeSet, drift: Option<&DriftReport>) -> String {
        let mut output = String::new();

        if let Some(report) = drift.filter(|r| r.has_drift()) {
            let _ = writeln!(output, "\n{} Refresh found changes made outside topoform:", "⚠".yellow());
            output.push_str(&report.to_string());
        }

        if !changes.has_changes() {
            let _ = writeln!(
                output,
                "{} No changes. Infrastructure matches the configuration.",
                "✓".green()
            );
            return output;
        }

        let _ = writeln!(output, "\nChange set {}", changes.id.dimmed());
        let rows: Vec<ChangeRow> = changes
            .pending()
            .enumerate()
            .map(|(i, c)| ChangeRow {
                index: i + 1,
                action: Self::format_action(c.action, c.replace),
                resource: c.resource_id.clone(),
                kind: c.kind.to_string(),
                reason: truncate(&c.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to destroy",
            changes.count(ChangeAction::Create).to_string().green(),
            changes.count(ChangeAction::Update).to_string().yellow(),
            changes.count(ChangeAction::Destroy).to_string().red()
        );
        output
    }

    /// Formats the result of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, outcome: &ApplyOutcome) -> String {
        match self.format {
            OutputFormat::Json => to_json(outcome),
            OutputFormat::Text => {
                let mut output = String::new();
                let report = &outcome.report;

                let headline = match outcome.phase {
                    Phase::Committed if report.succeeded.is_empty() => {
                        format!("{} No changes applied.", "✓".green())
                    }
                    Phase::Committed => format!("{} Apply complete.", "✓".green()),
                    Phase::Cancelled => format!("{} Apply cancelled.", "⚠".yellow()),
                    _ => format!("{} Apply failed.", "✗".red()),
                };
                let _ = writeln!(output, "\n{headline}");
                let _ = writeln!(
                    output,
                    "   {} succeeded, {} failed, {} blocked, {} cancelled (state serial {})",
                    report.succeeded.len().to_string().green(),
                    report.failed.len().to_string().red(),
                    report.blocked.len().to_string().yellow(),
                    report.cancelled.len(),
                    outcome.serial
                );

                Self::report_details(report, &mut output);
                if let Some(error) = &outcome.output_error {
                    let _ = writeln!(output, "\nOutputs not updated: {error}");
                }
                if outcome.phase == Phase::Committed && !outcome.outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    output.push_str(&Self::outputs_table(&outcome.outputs));
                }
                output
            }
        }
    }

    /// Formats the outcomes of an apply that stopped on a failed checkpoint.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                let mut output = format!(
                    "\n{} Apply interrupted; recorded state may lag behind the provider.\n",
                    "✗".red()
                );
                if !report.succeeded.is_empty() {
                    let _ = writeln!(output, "\nChanged: {}", report.succeeded.join(", "));
                }
                Self::report_details(report, &mut output);
                output
            }
        }
    }

    fn report_details(report: &ApplyReport, output: &mut String) {
        if !report.failed.is_empty() {
            output.push_str("\nFailed:\n");
            for failure in &report.failed {
                let _ = writeln!(
                    output,
                    "   - {} [{}] {}: {}",
                    failure.resource_id, failure.class, failure.action, failure.message
                );
            }
        }
        if !report.blocked.is_empty() {
            let _ = writeln!(output, "\nBlocked: {}", report.blocked.join(", "));
        }
        if !report.cancelled.is_empty() {
            let _ = writeln!(output, "\nNot started: {}", report.cancelled.join(", "));
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.has_drift() {
                    let mut output = format!("{} Drift detected:\n", "⚠".yellow());
                    output.push_str(&report.to_string());
                    output
                } else {
                    format!("{} {report}", "✓".green())
                }
            }
        }
    }

    /// Formats outputs; sensitive values are masked in text listings.
    #[must_use]
    pub fn format_outputs(&self, outputs: &[Output]) -> String {
        match self.format {
            OutputFormat::Json => to_json(&outputs),
            OutputFormat::Text if outputs.is_empty() => String::from("No outputs.\n"),
            OutputFormat::Text => Self::outputs_table(outputs),
        }
    }

    /// Formats a single output value.
    #[must_use]
    pub fn format_output_value(&self, output: &Output) -> String {
        match self.format {
            OutputFormat::Json => to_json(&output.value),
            OutputFormat::Text => format!("{}\n", output.display_value()),
        }
    }

    fn outputs_table(outputs: &[Output]) -> String {
        let rows: Vec<OutputRow> = outputs
            .iter()
            .map(|o| OutputRow {
                name: o.name.clone(),
                value: if o.sensitive {
                    String::from("(sensitive)")
                } else {
                    o.display_value()
                },
            })
            .collect();
        let mut table = Table::new(rows).to_string();
        table.push('\n');
        table
    }

    /// Formats recorded state and the current lock.
    #[must_use]
    pub fn format_state(&self, state: &StateSnapshot, lock: Option<&LockInfo>) -> String {
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({ "state": state, "lock": lock })),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}/{}", state.project, state.environment);
                let _ = writeln!(output, "   Lineage: {}", state.lineage);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let provider = state.provider.map_or_else(|| String::from("-"), |p| p.to_string());
                let _ = writeln!(output, "   Provider: {provider}");
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                match lock {
                    Some(lock) => {
                        let _ = writeln!(
                            output,
                            "   Lock: {} held by {} for {} (expires {})",
                            lock.lock_id,
                            lock.holder,
                            lock.operation,
                            lock.expires_at.format("%Y-%m-%d %H:%M:%S")
                        );
                    }
                    None => output.push_str("   Lock: none\n"),
                }

                if !state.bindings.is_empty() {
                    output.push('\n');
                    let rows: Vec<BindingRow> = state
                        .bindings
                        .values()
                        .map(|b| BindingRow {
                            resource: b.resource_id.clone(),
                            kind: b.kind.to_string(),
                            status: if b.remote_id.is_some() {
                                b.status.to_string()
                            } else {
                                String::from("missing")
                            },
                            remote_id: b.remote_id.clone().unwrap_or_default(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} succeeded, {} failed)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.succeeded.len(),
                            entry.failed.len()
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a validation result with a configuration summary.
    #[must_use]
    pub fn format_validation(
        &self,
        config: &TopologyConfig,
        result: &ValidationResult,
        show_warnings: bool,
    ) -> String {
        let errors: Vec<String> = result
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        match self.format {
            OutputFormat::Json => to_json(&serde_json::json!({
                "valid": result.is_valid(),
                "errors": errors,
                "warnings": result.warnings,
                "project": config.qualified_name(),
                "provider": config.provider.kind,
                "resources": config.resources.len(),
            })),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Configuration is valid.", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Configuration is invalid:", "✗".red());
                    for error in &errors {
                        let _ = writeln!(output, "  - {error}");
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    output.push_str("\nWarnings:\n");
                    for warning in &result.warnings {
                        let _ = writeln!(output, "  - {warning}");
                    }
                }
                let _ = writeln!(output, "\nConfiguration summary:");
                let _ = writeln!(output, "  Project: {}", config.qualified_name());
                let _ = writeln!(
                    output,
                    "  Provider: {} ({})",
                    config.provider.kind, config.provider.region
                );
                let _ = writeln!(output, "  Resources: {}", config.resources.len());
                let _ = writeln!(output, "  Outputs: {}", config.outputs.len());
                output
            }
        }
    }

    /// Formats an action with color.
    fn format_action(action: ChangeAction, replace: bool) -> String {
        match action {
            ChangeAction::Create if replace => "+/-recreate".green().to_string(),
            ChangeAction::Create => "+create".green().to_string(),
            ChangeAction::Update if replace => "-/+replace".yellow().to_string(),
            ChangeAction::Update => "~update".yellow().to_string(),
            ChangeAction::Destroy => "-destroy".red().to_string(),
            ChangeAction::NoOp => "no-op".dimmed().to_string(),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    let mut json = serde_json::to_string_pretty(value).unwrap_or_default();
    json.push('\n');
    json
}

/// Truncates a string to a maximum number of characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;
    use crate::model::{Resource, ResourceKind, build_graph};
    use crate::planner::plan_changes;
    use serde_json::{Value, json};
    use std::collections::BTreeSet;

    fn changes() -> ChangeSet {
        let graph = build_graph(vec![
            Resource::new("net", ResourceKind::Network).with_attribute("cidr", "10.0.0.0/16"),
        ])
        .expect("graph");
        plan_changes(&graph, &StateSnapshot::new("shop", "dev"), &BTreeSet::new(), "h")
    }

    #[test]
    fn test_plan_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let json: Value = serde_json::from_str(&formatter.format_plan(&changes(), None)).expect("json");
        assert_eq!(json["creates"], json!(1));
        assert_eq!(json["changes"][0]["resource_id"], json!("net"));
        assert_eq!(json["changes"][0]["action"], json!("create"));
    }

    #[test]
    fn test_plan_text() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&changes(), None);
        assert!(text.contains("+create"));
        assert!(text.contains("Plan: 1 to create, 0 to update, 0 to destroy"));
    }

    #[test]
    fn test_outputs_mask_sensitive_values() {
        let outputs = vec![
            Output {
                name: String::from("db_password_ref"),
                value: json!("arn:secret"),
                sensitive: true,
            },
            Output {
                name: String::from("compute_url"),
                value: json!("https://api.example"),
                sensitive: false,
            },
        ];
        let text = OutputFormatter::new(OutputFormat::Text).format_outputs(&outputs);
        assert!(text.contains("(sensitive)"));
        assert!(!text.contains("arn:secret"));
        assert!(text.contains("https://api.example"));

        let single = OutputFormatter::new(OutputFormat::Text).format_output_value(&outputs[0]);
        assert_eq!(single, "arn:secret\n");
    }

    #[test]
    fn test_state_json_includes_lock() {
        let mut state = StateSnapshot::new("shop", "dev");
        state.provider = Some(ProviderKind::Gcp);
        let lock = LockInfo::new("ci", "apply");
        let json: Value = serde_json::from_str(
            &OutputFormatter::new(OutputFormat::Json).format_state(&state, Some(&lock)),
        )
        .expect("json");
        assert_eq!(json["state"]["provider"], json!("gcp"));
        assert_eq!(json["lock"]["holder"], json!("ci"));
    }

    #[test]
    fn test_interrupted_report_lists_finished_changes() {
        colored::control::set_override(false);
        let report = ApplyReport {
            change_set_id: String::from("plan-1"),
            succeeded: vec![String::from("net"), String::from("logs")],
            cancelled: vec![String::from("db")],
            ..ApplyReport::default()
        };

        let text = OutputFormatter::new(OutputFormat::Text).format_report(&report);
        assert!(text.contains("Apply interrupted"));
        assert!(text.contains("Changed: net, logs"));
        assert!(text.contains("Not started: db"));

        let json: Value =
            serde_json::from_str(&OutputFormatter::new(OutputFormat::Json).format_report(&report))
                .expect("json");
        assert_eq!(json["succeeded"], json!(["net", "logs"]));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a rather long reason", 10), "a rathe...");
    }
}
