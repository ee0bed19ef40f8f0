//! CLI configuration and argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::output::OutputFormat;
use crate::telemetry::logging::LogFormat;
use crate::{BUILD_DATE, COMMIT, VERSION};

/// Environment variable names shared between argument parsing and docs.
pub mod env {
    pub const STATE_DIR: &str = "CUO_STATE_DIR";
    pub const LOG_LEVEL: &str = "CUO_LOG_LEVEL";
    pub const LOG_FORMAT: &str = "CUO_LOG_FORMAT";
    pub const AGENT_PORT: &str = "CUO_AGENT_PORT";
    pub const SLACK_WEBHOOK_URL: &str = "SLACK_WEBHOOK_URL";
}

/// Cluster update orchestrator.
///
/// Builds a phased update plan for a cluster and executes, resumes or
/// rolls back its phases.
#[derive(Parser, Debug, Clone)]
#[command(name = "cuo")]
#[command(about = "Cluster update orchestrator")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Directory holding operation state
    #[arg(long, global = true, env = env::STATE_DIR, default_value = ".cuo")]
    pub state_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = env::LOG_LEVEL, default_value = "info")]
    pub log_level: String,

    /// Log line format
    #[arg(long, global = true, env = env::LOG_FORMAT, value_enum, default_value_t)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create or inspect update plans
    #[command(subcommand)]
    Plan(PlanCommand),

    /// Execute a phase and everything below it (the whole plan by default)
    #[command(after_help = r#"Examples:
  cuo execute                        Execute or resume the whole plan
  cuo execute /masters               Execute the masters phase
  cuo execute /checks --force        Re-run a completed phase"#)]
    Execute {
        /// Phase path
        #[arg(value_name = "PHASE", default_value = "/")]
        phase: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Roll back a phase and everything below it
    Rollback {
        /// Phase path
        #[arg(value_name = "PHASE")]
        phase: String,

        #[command(flatten)]
        run: RunArgs,
    },

    /// Mark the operation finished, completed or failed by plan state
    Complete {
        #[arg(long)]
        operation_id: Option<String>,

        /// Slack Incoming Webhook for lifecycle notifications
        #[arg(long, env = env::SLACK_WEBHOOK_URL, hide_env_values = true)]
        slack_webhook_url: Option<String>,
    },
}

/// Plan subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum PlanCommand {
    /// Build a plan from a cluster snapshot and store it as a new operation
    Create {
        /// Cluster snapshot (YAML)
        #[arg(long, value_name = "FILE")]
        snapshot: PathBuf,

        /// Operation id [default: <cluster>-<timestamp>]
        #[arg(long)]
        operation_id: Option<String>,
    },

    /// Show the plan of an operation
    Show {
        #[arg(long)]
        operation_id: Option<String>,

        #[arg(short, long, value_enum, default_value_t)]
        output: OutputFormat,
    },
}

/// Flags shared by `execute` and `rollback`.
#[derive(ClapArgs, Debug, Clone)]
pub struct RunArgs {
    /// Operation to act on [default: the operation in progress]
    #[arg(long)]
    pub operation_id: Option<String>,

    /// Skip prerequisite and dependent checks
    #[arg(long, default_value = "false")]
    pub force: bool,

    /// Log what would be done without running executors or saving state
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Port of the update agent on each server
    #[arg(long, env = env::AGENT_PORT, default_value = "3012")]
    pub agent_port: u16,

    /// Limit on the duration of a single phase, in seconds
    #[arg(long, default_value = "3600")]
    pub phase_timeout: u64,

    /// Do not use the Kubernetes API; node operations go to the agent
    #[arg(long, default_value = "false")]
    pub no_kube: bool,

    /// Serve Prometheus metrics on this port while running
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Slack Incoming Webhook for lifecycle notifications
    #[arg(long, env = env::SLACK_WEBHOOK_URL, hide_env_values = true)]
    pub slack_webhook_url: Option<String>,
}

impl RunArgs {
    pub const fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.phase_timeout)
    }

    pub fn slack_webhook_url(&self) -> Option<&str> {
        non_empty(self.slack_webhook_url.as_deref())
    }
}

/// Treat an empty flag or variable as unset.
pub fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_execute_defaults_to_root() {
        let args = Args::try_parse_from(["cuo", "execute"]).unwrap();
        let Command::Execute { phase, run } = args.command else {
            panic!("expected execute");
        };
        assert_eq!(phase, "/");
        assert!(!run.force);
        assert!(!run.dry_run);
        assert_eq!(run.phase_timeout(), Duration::from_secs(3600));
    }

    #[test]
    fn test_rollback_requires_phase() {
        assert!(Args::try_parse_from(["cuo", "rollback"]).is_err());
        let args =
            Args::try_parse_from(["cuo", "rollback", "/masters", "--force", "--dry-run"]).unwrap();
        let Command::Rollback { phase, run } = args.command else {
            panic!("expected rollback");
        };
        assert_eq!(phase, "/masters");
        assert!(run.force);
        assert!(run.dry_run);
    }

    #[test]
    fn test_plan_create_and_global_flags() {
        let args = Args::try_parse_from([
            "cuo",
            "plan",
            "create",
            "--snapshot",
            "snapshot.yaml",
            "--state-dir",
            "/var/lib/cuo",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.state_dir, PathBuf::from("/var/lib/cuo"));
        assert_eq!(args.log_format, LogFormat::Json);
        assert!(matches!(
            args.command,
            Command::Plan(PlanCommand::Create { ref snapshot, operation_id: None })
                if snapshot == &PathBuf::from("snapshot.yaml")
        ));
    }

    #[test]
    fn test_plan_show_output() {
        let args = Args::try_parse_from(["cuo", "plan", "show", "-o", "yaml"]).unwrap();
        assert!(matches!(
            args.command,
            Command::Plan(PlanCommand::Show {
                output: OutputFormat::Yaml,
                ..
            })
        ));
    }

    #[test]
    fn test_non_empty() {
        assert_eq!(non_empty(None), None);
        assert_eq!(non_empty(Some("")), None);
        assert_eq!(non_empty(Some("  ")), None);
        assert_eq!(
            non_empty(Some("https://hooks.slack.com/services/T0/B0/x")),
            Some("https://hooks.slack.com/services/T0/B0/x")
        );
    }
}
