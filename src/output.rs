//! Plan rendering: kubectl-style table, JSON and YAML.

use anyhow::{Context, Result};
use clap::ValueEnum;
use colored::Colorize;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::plan::phase::base_name;
use crate::plan::{PhaseIndex, PhaseState, Plan};
use crate::store::Operation;

/// Output format of `plan show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Yaml,
}

/// Row of the plan table.
#[derive(Tabled)]
struct PhaseRow {
    #[tabled(rename = "PHASE")]
    phase: String,
    #[tabled(rename = "DESCRIPTION")]
    description: String,
    #[tabled(rename = "STATE")]
    state: String,
    #[tabled(rename = "NODE")]
    node: String,
    #[tabled(rename = "REQUIRES")]
    requires: String,
    #[tabled(rename = "UPDATED")]
    updated: String,
}

fn state_label(state: PhaseState) -> String {
    match state {
        PhaseState::Unstarted => format!("* {state}").normal().to_string(),
        PhaseState::InProgress => format!("→ {state}").yellow().to_string(),
        PhaseState::Completed => format!("✓ {state}").green().to_string(),
        PhaseState::Failed => format!("⚠ {state}").red().to_string(),
        PhaseState::RolledBack => format!("⤺ {state}").cyan().to_string(),
    }
}

/// Phase column: the last path segment indented by depth.
fn phase_label(plan: &Plan, index: PhaseIndex) -> String {
    let depth = plan.depth(index).saturating_sub(1);
    format!("{}{}", "  ".repeat(depth), base_name(plan.path(index)))
}

fn rows(plan: &Plan) -> Vec<PhaseRow> {
    plan.phases()
        .iter()
        .enumerate()
        .skip(1)
        .map(|(index, phase)| PhaseRow {
            phase: phase_label(plan, index),
            description: phase.description.clone(),
            state: state_label(phase.state),
            node: phase
                .data
                .target_server()
                .map_or_else(|| "-".to_string(), |s| s.hostname.clone()),
            requires: if phase.requires.is_empty() {
                "-".to_string()
            } else {
                phase
                    .requires
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")
            },
            updated: phase.updated.map_or_else(
                || "-".to_string(),
                |t| t.format("%a %b %e %H:%M:%S UTC").to_string(),
            ),
        })
        .collect()
}

/// Apply kubectl-style table formatting: no borders, no separators, 2-space column gap.
fn apply_table_style(table: &mut Table) {
    use tabled::settings::object::Columns;
    use tabled::settings::themes::Theme;
    use tabled::settings::{Modify, Padding};

    let mut theme = Theme::from_style(Style::empty());
    theme.remove_horizontal_lines();
    table.with(theme);
    table.with(Modify::new(Columns::new(..)).with(Padding::new(0, 2, 0, 0)));
}

/// Render the plan of an operation in the requested format.
pub fn render_operation(operation: &Operation, format: OutputFormat) -> Result<String> {
    match format {
        OutputFormat::Table => {
            let header = format!(
                "{} (cluster: {}, state: {}, {} → {}):",
                format!("Operation/{}", operation.id).bold(),
                operation.cluster,
                operation.state,
                operation.plan.versions.installed_app.version,
                operation.plan.versions.target_app.version,
            );
            Ok(format!("{header}\n{}", render_table(&operation.plan)))
        }
        OutputFormat::Json => {
            serde_json::to_string_pretty(operation).context("Failed to encode operation as JSON")
        }
        OutputFormat::Yaml => {
            serde_yaml::to_string(operation).context("Failed to encode operation as YAML")
        }
    }
}

/// Render the phase table of a plan.
pub fn render_table(plan: &Plan) -> String {
    let mut table = Table::new(rows(plan));
    apply_table_style(&mut table);
    table.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{Server, ServerRole};
    use crate::package::Locator;
    use crate::plan::{Dependency, Phase, PhaseData, PhaseKind, PlanVersions, ROOT_PATH};

    fn plan() -> Plan {
        let server = Server {
            hostname: "node-1".to_string(),
            advertise_ip: "10.0.0.1".to_string(),
            role: ServerRole::Master,
        };
        let init =
            Phase::root("init", "Initialize update operation").with_executor(PhaseKind::Init);
        let mut masters = Phase::root("masters", "Update master nodes");
        let mut node = Phase::new("node-1", "Update system software on master node \"node-1\"");
        node.add_sequential([Phase::new("drain", "Drain node")
            .with_executor(PhaseKind::Drain)
            .with_data(PhaseData {
                server: Some(server),
                ..Default::default()
            })]);
        masters.add_with_dependency(Dependency::on(&init), node);

        let mut root = Phase::new(ROOT_PATH, "Update cluster prod");
        root.add_sequential([init, masters]);
        Plan::new(
            "op-1",
            "prod",
            vec![],
            PlanVersions {
                installed_app: Locator::new("gravitational.io", "telekube", "5.5.0"),
                target_app: Locator::new("gravitational.io", "telekube", "6.0.0"),
                installed_etcd: None,
                target_etcd: None,
            },
            root,
        )
        .unwrap()
    }

    #[test]
    fn test_phase_label_indents_by_depth() {
        let plan = plan();
        assert_eq!(phase_label(&plan, plan.phase("/init").unwrap()), "init");
        assert_eq!(
            phase_label(&plan, plan.phase("/masters/node-1/drain").unwrap()),
            "    drain"
        );
    }

    #[test]
    fn test_rows_skip_root() {
        let plan = plan();
        let rows = rows(&plan);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0].phase, "init");
        assert_eq!(rows[0].node, "-");
        assert_eq!(rows[2].requires, "/init");
        assert_eq!(rows[3].node, "node-1");
        assert!(rows[3].state.contains("Unstarted"));
        assert_eq!(rows[3].updated, "-");
    }

    #[test]
    fn test_render_table_has_headers() {
        let table = render_table(&plan());
        let first = table.lines().next().unwrap();
        assert!(first.starts_with("PHASE"));
        assert!(first.contains("DESCRIPTION"));
        assert!(first.contains("STATE"));
        assert!(table.contains("Initialize update operation"));
    }
}
