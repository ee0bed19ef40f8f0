//! Notifications for operation lifecycle events.

pub mod slack;

use std::time::Duration;

pub use slack::{SlackMessage, SlackNotifier};

use crate::plan::Plan;
use crate::store::OperationState;

fn context(plan: &Plan) -> String {
    format!("Sent by cuo for operation {}", plan.operation_id)
}

fn upgrade_path(plan: &Plan) -> String {
    format!(
        "{} → {}",
        plan.versions.installed_app.version, plan.versions.target_app.version
    )
}

/// Human readable duration such as `45m 30s`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}m {}s", secs / 60, secs % 60)
}

/// Build the message sent when an execute request finished successfully.
pub fn build_execution_completed_message(
    plan: &Plan,
    phase: &str,
    phases: usize,
    elapsed: Duration,
) -> SlackMessage {
    SlackMessage {
        header: "Cluster Update Phase Completed".to_string(),
        fields: vec![
            ("Cluster".to_string(), plan.cluster_name.clone()),
            ("Upgrade Path".to_string(), upgrade_path(plan)),
            ("Phase".to_string(), phase.to_string()),
            ("Executed".to_string(), format!("{phases} phases")),
            ("Duration".to_string(), format_duration(elapsed)),
        ],
        detail: None,
        context: context(plan),
    }
}

/// Build the message sent when a phase fails.
pub fn build_phase_failed_message(plan: &Plan, phase: &str, error: &str) -> SlackMessage {
    SlackMessage {
        header: "Cluster Update Phase Failed".to_string(),
        fields: vec![
            ("Cluster".to_string(), plan.cluster_name.clone()),
            ("Upgrade Path".to_string(), upgrade_path(plan)),
            ("Failed Phase".to_string(), phase.to_string()),
        ],
        detail: Some(error.to_string()),
        context: context(plan),
    }
}

/// Build the message sent when an operation is marked finished.
pub fn build_operation_finished_message(plan: &Plan, state: OperationState) -> SlackMessage {
    let header = match state {
        OperationState::Completed => "Cluster Update Completed",
        OperationState::Failed => "Cluster Update Failed",
        OperationState::InProgress => "Cluster Update In Progress",
    };
    let (completed, total) = plan
        .phases()
        .iter()
        .filter(|p| p.is_leaf())
        .fold((0, 0), |(done, total), p| {
            let done = done + usize::from(p.state == crate::plan::PhaseState::Completed);
            (done, total + 1)
        });

    SlackMessage {
        header: header.to_string(),
        fields: vec![
            ("Cluster".to_string(), plan.cluster_name.clone()),
            ("Upgrade Path".to_string(), upgrade_path(plan)),
            ("Result".to_string(), state.to_string()),
            ("Phases".to_string(), format!("{completed}/{total} completed")),
        ],
        detail: None,
        context: context(plan),
    }
}
