//! cuo - cluster update orchestrator.
//!
//! Creates update operations from cluster snapshots and drives their plans:
//! execute, resume, roll back and complete.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

use cuo::config::{Args, Command, PlanCommand, RunArgs, non_empty};
use cuo::engine::{ABORT_WINDOW, Engine, Interrupt, InterruptEscalation};
use cuo::executor::{
    AgentExecutor, DryRunExecutor, Executor, ExecutorRegistry, KubeNodeExecutor,
};
use cuo::notify::SlackNotifier;
use cuo::output::{OutputFormat, render_operation, render_table};
use cuo::plan::build_plan;
use cuo::snapshot::ClusterSnapshot;
use cuo::store::{NoopSink, OperationState, OperationStore, PlanSink, new_operation_id};
use cuo::telemetry;
use cuo::{BUILD_DATE, COMMIT, VERSION};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = telemetry::logging::init_tracing(&args.log_level, args.log_format) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting cuo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run(args).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let store = OperationStore::open(&args.state_dir)?;

    match args.command {
        Command::Plan(PlanCommand::Create {
            snapshot,
            operation_id,
        }) => create_operation(&store, &snapshot, operation_id),
        Command::Plan(PlanCommand::Show {
            operation_id,
            output,
        }) => {
            let operation = store.resolve(operation_id.as_deref())?;
            println!("{}", render_operation(&operation, output)?);
            Ok(())
        }
        Command::Execute { phase, run } => run_phases(&store, &phase, &run, false).await,
        Command::Rollback { phase, run } => run_phases(&store, &phase, &run, true).await,
        Command::Complete {
            operation_id,
            slack_webhook_url,
        } => {
            complete_operation(
                &store,
                operation_id.as_deref(),
                slack_webhook_url.as_deref(),
            )
            .await
        }
    }
}

/// Build a plan from the snapshot and store it as a new operation.
fn create_operation(
    store: &OperationStore,
    path: &Path,
    operation_id: Option<String>,
) -> Result<()> {
    let snapshot = ClusterSnapshot::load(path)?;
    let operation_id = operation_id
        .unwrap_or_else(|| new_operation_id(&snapshot.cluster_name, chrono::Utc::now()));
    let catalog = snapshot.catalog();

    let plan = build_plan(&operation_id, &snapshot, &catalog)
        .with_context(|| format!("Failed to build update plan for {}", snapshot.cluster_name))?;
    let operation = store.create(plan)?;

    println!("{}", render_operation(&operation, OutputFormat::Table)?);
    Ok(())
}

async fn executor_registry(run: &RunArgs) -> Result<ExecutorRegistry> {
    if run.dry_run {
        return Ok(ExecutorRegistry::uniform(Arc::new(DryRunExecutor)));
    }

    let agent: Arc<dyn Executor> = Arc::new(AgentExecutor::new(run.agent_port)?);
    let node: Option<Arc<dyn Executor>> = if run.no_kube {
        None
    } else {
        match kube::Client::try_default().await {
            Ok(client) => {
                info!("Connected to Kubernetes API server");
                Some(Arc::new(KubeNodeExecutor::new(client)))
            }
            Err(e) => {
                warn!(
                    "Kubernetes client unavailable, node operations go to the agent: {}",
                    e
                );
                None
            }
        }
    };
    Ok(ExecutorRegistry::standard(agent, node))
}

/// Forward Ctrl-C to the engine: the first press stops scheduling, a second
/// one within the abort window cancels running phases.
fn spawn_interrupt_handler() -> watch::Receiver<Interrupt> {
    let (tx, rx) = watch::channel(Interrupt::Clear);
    tokio::spawn(async move {
        let mut escalation = InterruptEscalation::new(ABORT_WINDOW);
        while tokio::signal::ctrl_c().await.is_ok() {
            let interrupt = escalation.signal(Instant::now());
            match interrupt {
                Interrupt::Stop => warn!(
                    "Interrupt received, waiting for running phases (press Ctrl-C again within {}s to abort)",
                    ABORT_WINDOW.as_secs()
                ),
                Interrupt::Abort => warn!("Interrupt received again, aborting running phases"),
                Interrupt::Clear => {}
            }
            if tx.send(interrupt).is_err() {
                break;
            }
        }
    });
    rx
}

async fn run_phases(
    store: &OperationStore,
    phase: &str,
    run: &RunArgs,
    rollback: bool,
) -> Result<()> {
    let mut operation = store.resolve(run.operation_id.as_deref())?;
    if operation.state != OperationState::InProgress {
        bail!("Operation {} is already {}", operation.id, operation.state);
    }

    let sink: Arc<dyn PlanSink> = if run.dry_run {
        Arc::new(NoopSink)
    } else {
        Arc::new(store.clone())
    };
    let mut engine = Engine::new(executor_registry(run).await?, sink)
        .with_phase_timeout(run.phase_timeout())
        .with_interrupt(spawn_interrupt_handler());

    if let Some(port) = run.metrics_port {
        let mut registry = prometheus_client::registry::Registry::default();
        let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
        let registry = Arc::new(registry);
        tokio::spawn(async move {
            if let Err(e) = telemetry::metrics::serve(port, registry).await {
                error!("Metrics server failed: {}", e);
            }
        });
        engine = engine.with_metrics(metrics);
    }

    if let Some(url) = run.slack_webhook_url() {
        info!("Slack notifications enabled");
        engine = engine.with_notifier(Arc::new(SlackNotifier::new(url.to_string())));
    }

    let result = if rollback {
        engine.rollback(&mut operation.plan, phase, run.force).await
    } else {
        engine.execute(&mut operation.plan, phase, run.force).await
    };

    if !run.dry_run {
        println!("{}", render_table(&operation.plan));
    }
    let report = result?;
    info!(
        operation = %operation.id,
        phase = %report.phase,
        phases = report.phases.len(),
        elapsed_secs = report.elapsed.as_secs(),
        rollback,
        "Done"
    );
    Ok(())
}

async fn complete_operation(
    store: &OperationStore,
    operation_id: Option<&str>,
    slack_webhook_url: Option<&str>,
) -> Result<()> {
    let operation = store.resolve(operation_id)?;
    let mut engine = Engine::new(ExecutorRegistry::new(), Arc::new(NoopSink));
    if let Some(url) = non_empty(slack_webhook_url) {
        engine = engine.with_notifier(Arc::new(SlackNotifier::new(url.to_string())));
    }

    let state = engine.complete(&operation.plan).await;
    let operation = store.finish(&operation.id, state)?;
    println!("Operation {} marked {}", operation.id, operation.state);
    Ok(())
}
