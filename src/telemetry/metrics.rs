//! Prometheus metrics for plan execution.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::plan::PhaseKind;

/// Labels for phase execution results.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseResultLabels {
    pub kind: String,
    pub result: String,
}

/// Labels for per-kind metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PhaseKindLabels {
    pub kind: String,
}

/// Labels for operation outcomes.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub result: String,
}

/// All Prometheus metrics for the orchestrator.
pub struct Metrics {
    pub phase_executions: Family<PhaseResultLabels, Counter>,
    pub phase_duration_seconds: Family<PhaseKindLabels, Histogram>,
    pub phase_rollbacks: Family<PhaseKindLabels, Counter>,
    pub operations_finished: Family<OperationLabels, Counter>,
}

/// Buckets for phase duration (1s to 1h): system upgrades and drains can take
/// tens of minutes.
const PHASE_DURATION_BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let phase_executions = Family::<PhaseResultLabels, Counter>::default();
        registry.register(
            "cuo_phase_executions",
            "Total number of phase executions by kind and result",
            phase_executions.clone(),
        );

        let phase_duration_seconds =
            Family::<PhaseKindLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(PHASE_DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "cuo_phase_duration_seconds",
            "Time spent executing a phase in seconds",
            phase_duration_seconds.clone(),
        );

        let phase_rollbacks = Family::<PhaseKindLabels, Counter>::default();
        registry.register(
            "cuo_phase_rollbacks",
            "Total number of phases rolled back",
            phase_rollbacks.clone(),
        );

        let operations_finished = Family::<OperationLabels, Counter>::default();
        registry.register(
            "cuo_operations_finished",
            "Total number of operations marked finished by result",
            operations_finished.clone(),
        );

        Self {
            phase_executions,
            phase_duration_seconds,
            phase_rollbacks,
            operations_finished,
        }
    }

    /// Record one phase execution attempt.
    pub fn observe_phase(&self, kind: PhaseKind, result: &str, duration: Duration) {
        self.phase_executions
            .get_or_create(&PhaseResultLabels {
                kind: kind.to_string(),
                result: result.to_string(),
            })
            .inc();
        self.phase_duration_seconds
            .get_or_create(&PhaseKindLabels {
                kind: kind.to_string(),
            })
            .observe(duration.as_secs_f64());
    }

    pub fn record_rollback(&self, kind: PhaseKind) {
        self.phase_rollbacks
            .get_or_create(&PhaseKindLabels {
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_operation(&self, result: &str) {
        self.operations_finished
            .get_or_create(&OperationLabels {
                result: result.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
