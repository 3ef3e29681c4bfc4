//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::graph::Graph;
use crate::outputs::ProbeResult;
use crate::planner::{ActionKind, OutcomeStatus, Plan};
use crate::reconciler::{ApplyReport, DriftReport};
use crate::state::{LockInfo, StackState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "After")]
    after: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Graph node row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Result")]
    result: String,
    #[tabled(rename = "Attempts")]
    attempts: u32,
    #[tabled(rename = "ms")]
    duration_ms: u64,
}

/// Recorded resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Node")]
    node: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Provider ID")]
    provider_id: String,
    #[tabled(rename = "Synced")]
    synced: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true when writing JSON.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => to_json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes required - {} resources up to date.\n",
                "✓".green(),
                plan.noop_count
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nReconciliation Plan");
        let _ = writeln!(output, "   Config hash: {}\n", short(&plan.config_hash));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .map(|a| PlanActionRow {
                index: a.id,
                action: Self::format_action_kind(a.kind, a.replacement),
                node: a.node_id.to_string(),
                after: join(a.depends_on.iter()),
                reason: truncate(&a.reason, 40),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            output.push_str("\nChanged attributes:\n");
            for action in plan.actions.iter().filter(|a| !a.changed_fields.is_empty()) {
                let _ = writeln!(
                    output,
                    "   {} {}: {}",
                    action.id,
                    action.node_id,
                    action.changed_fields.join(", ")
                );
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete ({} replaced), {} unchanged",
            plan.count(ActionKind::Create).to_string().green(),
            plan.count(ActionKind::Update).to_string().yellow(),
            plan.count(ActionKind::Delete).to_string().red(),
            plan.replacement_count(),
            plan.noop_count
        );
        output
    }

    /// Formats the resource graph in dependency order.
    #[must_use]
    pub fn format_graph(&self, graph: &Graph) -> String {
        let order = graph.topological_order();
        match self.format {
            OutputFormat::Json => {
                let nodes: Vec<GraphJson> = order
                    .iter()
                    .filter_map(|id| graph.node(id))
                    .map(|n| GraphJson {
                        id: n.id.to_string(),
                        kind: n.kind.to_string(),
                        depends_on: n.edges().iter().map(ToString::to_string).collect(),
                    })
                    .collect();
                to_json(&nodes)
            }
            OutputFormat::Text => {
                let rows: Vec<GraphRow> = order
                    .iter()
                    .filter_map(|id| graph.node(id))
                    .map(|n| GraphRow {
                        node: n.id.to_string(),
                        kind: n.kind.to_string(),
                        depends_on: join(n.edges().iter()),
                    })
                    .collect();
                format!("\n{}\n{} nodes\n", Table::new(rows), graph.len())
            }
        }
    }

    /// Formats the report of an apply or destroy.
    #[must_use]
    pub fn format_report(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(&ReportJson::from(report)),
            OutputFormat::Text => {
                let mut output = String::new();
                let header = if report.is_converged() {
                    format!("{} Reconciliation converged", "✓".green())
                } else {
                    format!("{} Reconciliation incomplete", "✗".red())
                };
                let _ = writeln!(output, "{header} ({})\n", report.result.summary());

                if !report.result.outcomes.is_empty() {
                    let rows: Vec<OutcomeRow> = report
                        .result
                        .outcomes
                        .iter()
                        .map(|o| OutcomeRow {
                            action: o.kind.to_string(),
                            node: o.node_id.to_string(),
                            result: Self::format_status(o.status),
                            attempts: o.attempts,
                            duration_ms: o.duration_ms,
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !report.result.failed.is_empty() {
                    let _ = write!(output, "\n{} Failures:\n", "⚠".yellow());
                    for (node, error) in &report.result.failed {
                        let _ = writeln!(output, "   - {node}: {error}");
                    }
                }

                if !report.refresh.unrecorded.is_empty() {
                    let _ = write!(output, "\n{} Refresh not recorded:\n", "⚠".yellow());
                    for node in &report.refresh.unrecorded {
                        let _ = writeln!(output, "   - {node}: {}", "state write failed".red());
                    }
                }

                if let Some(outputs) = &report.outputs {
                    output.push('\n');
                    output.push_str(&Self::format_outputs_text(outputs));
                } else if let Some(error) = &report.output_error {
                    let _ = writeln!(output, "\nOutputs unavailable: {error}");
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => to_json(report),
            OutputFormat::Text => {
                if report.is_converged() {
                    return format!("{} No drift detected - state is converged.\n", "✓".green());
                }
                let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                for node in &report.refresh.missing {
                    let _ = writeln!(output, "   - {node}: {}", "deleted outside of tiered".red());
                }
                for node in &report.refresh.changed {
                    let _ = writeln!(output, "   - {node}: {}", "provider attributes changed".yellow());
                }
                for node in &report.refresh.unreadable {
                    let _ = writeln!(output, "   - {node}: {}", "could not be read".dimmed());
                }
                let _ = write!(output, "\n{}", Self::format_plan_text(&report.plan, false));
                output
            }
        }
    }

    /// Formats resolved outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, Value>) -> String {
        match self.format {
            OutputFormat::Json => to_json(outputs),
            OutputFormat::Text => Self::format_outputs_text(outputs),
        }
    }

    fn format_outputs_text(outputs: &BTreeMap<String, Value>) -> String {
        let mut output = String::from("Outputs:\n");
        for (name, value) in outputs {
            let shown = value.as_str().map_or_else(|| value.to_string(), ToString::to_string);
            let _ = writeln!(output, "   {name} = {}", shown.cyan());
        }
        output
    }

    /// Formats a probe result.
    #[must_use]
    pub fn format_probe(&self, result: &ProbeResult) -> String {
        match self.format {
            OutputFormat::Json => to_json(result),
            OutputFormat::Text => {
                let mark = if result.healthy { "✓".green() } else { "✗".red() };
                format!("{mark} {result}\n")
            }
        }
    }

    /// Formats recorded state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => to_json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}/{}\n", state.stack, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Config hash: {}", short(&state.config_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            node: r.node_id.to_string(),
                            status: format!("{:?}", r.status).to_lowercase(),
                            provider_id: truncate(&r.provider_id, 48),
                            synced: r.last_synced_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let mark = if entry.failed.is_empty() && entry.skipped == 0 && entry.cancelled == 0 {
                            "✓".green()
                        } else {
                            "✗".red()
                        };
                        let _ = writeln!(
                            output,
                            "     {mark} {} - {:?} ({} actions, {} ok, {} failed, {} skipped)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.actions,
                            entry.succeeded,
                            entry.failed.len(),
                            entry.skipped
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: Option<&LockInfo>) -> String {
        match (self.format, lock) {
            (OutputFormat::Json, _) => to_json(&lock),
            (OutputFormat::Text, None) => String::from("State is not locked.\n"),
            (OutputFormat::Text, Some(lock)) => format!(
                "Locked by {} for {} since {} (lock id {}, expires in {}s)\n",
                lock.holder,
                lock.operation,
                lock.acquired_at.format("%Y-%m-%d %H:%M:%S"),
                lock.lock_id,
                lock.remaining_secs()
            ),
        }
    }

    fn format_action_kind(kind: ActionKind, replacement: bool) -> String {
        match (kind, replacement) {
            (ActionKind::Create, false) => "+create".green().to_string(),
            (ActionKind::Create, true) => "+recreate".green().to_string(),
            (ActionKind::Update, _) => "~update".yellow().to_string(),
            (ActionKind::Delete, false) => "-delete".red().to_string(),
            (ActionKind::Delete, true) => "-replace".red().to_string(),
            (ActionKind::Noop, _) => "noop".dimmed().to_string(),
        }
    }

    fn format_status(status: OutcomeStatus) -> String {
        match status {
            OutcomeStatus::Succeeded => "ok".green().to_string(),
            OutcomeStatus::Failed => "failed".red().to_string(),
            OutcomeStatus::Skipped => "skipped".yellow().to_string(),
            OutcomeStatus::Cancelled => "cancelled".dimmed().to_string(),
        }
    }
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

fn short(hash: &str) -> &str {
    let hex = hash.strip_prefix("sha256:").unwrap_or(hash);
    hex.get(..8).unwrap_or(hex)
}

fn join<T: ToString>(items: impl Iterator<Item = T>) -> String {
    items.map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_default()
}

// JSON serialization helpers

#[derive(Serialize)]
struct GraphJson {
    id: String,
    kind: String,
    depends_on: Vec<String>,
}

#[derive(Serialize)]
struct ReportJson<'a> {
    run_id: &'a str,
    converged: bool,
    summary: String,
    refresh: &'a crate::reconciler::RefreshSummary,
    outcomes: &'a [crate::planner::ActionOutcome],
    failed: BTreeMap<String, String>,
    skipped: Vec<String>,
    cancelled: Vec<String>,
    outputs: Option<&'a BTreeMap<String, Value>>,
    output_error: Option<&'a str>,
}

impl<'a> From<&'a ApplyReport> for ReportJson<'a> {
    fn from(report: &'a ApplyReport) -> Self {
        Self {
            run_id: &report.run_id,
            converged: report.is_converged(),
            summary: report.result.summary(),
            refresh: &report.refresh,
            outcomes: &report.result.outcomes,
            failed: report
                .result
                .failed
                .iter()
                .map(|(node, error)| (node.to_string(), error.to_string()))
                .collect(),
            skipped: report.result.skipped.iter().map(ToString::to_string).collect(),
            cancelled: report.result.cancelled.iter().map(ToString::to_string).collect(),
            outputs: report.outputs.as_ref(),
            output_error: report.output_error.as_deref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Planner;
    use crate::topology::two_tier::tests::sample_graph;

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("héllo wörld", 8), "héllo...");
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short("sha256:0123456789abcdef"), "01234567");
        assert_eq!(short("abc"), "abc");
    }

    #[test]
    fn test_plan_json_lists_every_action() {
        let graph = sample_graph();
        let plan = Planner::new()
            .plan(&graph, &StackState::new("shop", "prod"), "sha256:00")
            .expect("plan");
        let json: Value = serde_json::from_str(&OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false))
            .expect("valid json");
        assert_eq!(json["actions"].as_array().map(Vec::len), Some(21));
        assert_eq!(json["actions"][0]["kind"], "create");
    }

    #[test]
    fn test_empty_plan_text() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&Plan::empty("h"), false);
        assert!(text.contains("No changes required"));
    }

    #[test]
    fn test_graph_text_lists_nodes() {
        colored::control::set_override(false);
        let text = OutputFormatter::new(OutputFormat::Text).format_graph(&sample_graph());
        assert!(text.contains("db_instance.main"));
        assert!(text.contains("21 nodes"));
    }
}
