//! Execution engine: runs, rolls back and completes the phases of a plan.
//!
//! The engine is the only writer of phase state. Every transition is
//! persisted through a [`PlanSink`] before the next phase is scheduled, so an
//! interrupted operation resumes from the last recorded state.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::CuoError;
use crate::executor::{Executor, ExecutorRegistry, PhaseContext};
use crate::notify::{self, SlackNotifier};
use crate::plan::{PhaseIndex, PhaseKind, PhaseState, Plan};
use crate::store::{OperationState, PlanSink};
use crate::telemetry::metrics::Metrics;

/// Default limit on the duration of a single phase.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Two interrupts closer together than this abort running phases.
pub const ABORT_WINDOW: Duration = Duration::from_secs(5);

/// Operator request delivered to a running engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Interrupt {
    #[default]
    Clear,
    /// Start no new phases; let running ones finish.
    Stop,
    /// Cancel running phases and mark them failed.
    Abort,
}

/// Turns a stream of operator signals into stop / abort requests.
#[derive(Debug)]
pub struct InterruptEscalation {
    window: Duration,
    last: Option<Instant>,
}

impl InterruptEscalation {
    pub const fn new(window: Duration) -> Self {
        Self { window, last: None }
    }

    /// Register a signal received at `now`.
    pub fn signal(&mut self, now: Instant) -> Interrupt {
        let escalate = self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) <= self.window);
        self.last = Some(now);
        if escalate {
            Interrupt::Abort
        } else {
            Interrupt::Stop
        }
    }
}

/// Summary of a successful execute or rollback request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Path of the requested phase.
    pub phase: String,
    /// Leaf phases acted on, in completion order.
    pub phases: Vec<String>,
    pub elapsed: Duration,
}

struct Outcome {
    index: PhaseIndex,
    result: Result<(), CuoError>,
    elapsed: Duration,
}

/// Operation state implied by the plan: completed only when every phase is.
pub fn completion_state(plan: &Plan) -> OperationState {
    if plan.state(plan.root()) == PhaseState::Completed {
        OperationState::Completed
    } else {
        OperationState::Failed
    }
}

pub struct Engine {
    registry: ExecutorRegistry,
    sink: Arc<dyn PlanSink>,
    metrics: Option<Arc<Metrics>>,
    notifier: Option<Arc<SlackNotifier>>,
    phase_timeout: Duration,
    interrupt: watch::Receiver<Interrupt>,
}

impl Engine {
    pub fn new(registry: ExecutorRegistry, sink: Arc<dyn PlanSink>) -> Self {
        let (_, interrupt) = watch::channel(Interrupt::Clear);
        Self {
            registry,
            sink,
            metrics: None,
            notifier: None,
            phase_timeout: DEFAULT_PHASE_TIMEOUT,
            interrupt,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<SlackNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    #[must_use]
    pub const fn with_phase_timeout(mut self, timeout: Duration) -> Self {
        self.phase_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: watch::Receiver<Interrupt>) -> Self {
        self.interrupt = interrupt;
        self
    }

    fn persist(&self, plan: &Plan) -> Result<(), CuoError> {
        self.sink.persist(plan)
    }

    fn executor_for(
        &self,
        plan: &Plan,
        index: PhaseIndex,
    ) -> Result<(PhaseKind, Arc<dyn Executor>), CuoError> {
        let kind = plan.get(index).executor.ok_or_else(|| {
            CuoError::InvalidPlan(format!("phase {} has no executor", plan.path(index)))
        })?;
        Ok((kind, self.registry.get(kind)?))
    }

    fn context(plan: &Plan, index: PhaseIndex, kind: PhaseKind) -> PhaseContext {
        PhaseContext {
            operation_id: plan.operation_id.clone(),
            path: plan.path(index).to_string(),
            kind,
            data: plan.get(index).data.clone(),
            lead_master: plan.lead_master().cloned(),
        }
    }

    async fn notify(&self, plan: &Plan, message: &notify::SlackMessage) {
        if let Some(notifier) = &self.notifier {
            notifier.send(&plan.operation_id, message).await;
        }
    }

    /// Execute the phase at `path` and everything below it.
    ///
    /// Completed phases are skipped. Failed, rolled back and stale in-progress
    /// phases in the subtree are reattempted. Unless `force` is set, every
    /// phase outside the subtree that gates it must already be completed.
    pub async fn execute(
        &self,
        plan: &mut Plan,
        path: &str,
        force: bool,
    ) -> Result<Report, CuoError> {
        let started = Instant::now();
        let target = plan.phase(path)?;
        let target_path = plan.path(target).to_string();
        let leaves = plan.leaves(target);
        let scope: HashSet<PhaseIndex> = leaves.iter().copied().collect();

        self.reset_for_retry(plan, target, &leaves, force)?;
        if !force {
            check_prerequisites(plan, &target_path, &scope)?;
        }

        let mut pending: Vec<PhaseIndex> = plan
            .execution_order()?
            .into_iter()
            .filter(|i| scope.contains(i) && plan.state(*i) != PhaseState::Completed)
            .collect();
        for &index in &pending {
            self.executor_for(plan, index)?;
        }
        if pending.is_empty() {
            info!(phase = %target_path, "All phases already completed");
            return Ok(Report {
                phase: target_path,
                phases: Vec::new(),
                elapsed: started.elapsed(),
            });
        }

        info!(
            operation = %plan.operation_id,
            phase = %target_path,
            phases = pending.len(),
            force,
            "Executing phases"
        );

        let mut in_flight = FuturesUnordered::new();
        let mut running = BTreeSet::new();
        let mut executed = Vec::new();
        let mut failure: Option<(String, String)> = None;
        // First persistence error; no phase starts after it.
        let mut sink_error: Option<CuoError> = None;
        let mut interrupt = self.interrupt.clone();
        let mut watching = true;

        loop {
            let signal = *interrupt.borrow();
            if signal == Interrupt::Abort {
                drop(in_flight);
                for &index in &running {
                    error!(phase = %plan.path(index), "Phase aborted");
                    plan.set_state(index, PhaseState::Failed, Some("aborted".to_string()));
                }
                self.persist(plan)?;
                return Err(CuoError::Interrupted(format!(
                    "aborted {} running phases",
                    running.len()
                )));
            }

            if failure.is_none() && sink_error.is_none() && signal == Interrupt::Clear {
                let ready: Vec<PhaseIndex> = pending
                    .iter()
                    .copied()
                    .filter(|&i| is_ready(plan, i, &scope))
                    .collect();
                for index in ready {
                    let (kind, executor) = self.executor_for(plan, index)?;
                    plan.set_state(index, PhaseState::InProgress, None);
                    if let Err(e) = self.persist(plan) {
                        plan.set_state(index, PhaseState::Unstarted, None);
                        hold_sink_error(&mut sink_error, e, running.len());
                        break;
                    }
                    pending.retain(|&i| i != index);
                    info!(
                        phase = %plan.path(index),
                        kind = %kind,
                        executor = executor.name(),
                        "Phase started"
                    );
                    running.insert(index);
                    in_flight.push(run_phase(
                        executor,
                        Self::context(plan, index, kind),
                        index,
                        self.phase_timeout,
                        false,
                    ));
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                Some(outcome) = in_flight.next() => {
                    running.remove(&outcome.index);
                    let path = plan.path(outcome.index).to_string();
                    if let Err(message) = self.record(plan, outcome) {
                        if failure.is_none() {
                            failure = Some((path.clone(), message));
                        }
                    } else {
                        executed.push(path);
                    }
                    if let Err(e) = self.persist(plan) {
                        hold_sink_error(&mut sink_error, e, running.len());
                    }
                }
                changed = interrupt.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                    } else if *interrupt.borrow() == Interrupt::Stop {
                        warn!(
                            running = running.len(),
                            "Stop requested, waiting for running phases"
                        );
                    }
                }
            }
        }

        if let Some(e) = sink_error {
            return Err(e);
        }
        if let Some((phase, message)) = failure {
            let notice = notify::build_phase_failed_message(plan, &phase, &message);
            self.notify(plan, &notice).await;
            return Err(CuoError::PhaseFailed { phase, message });
        }
        if !pending.is_empty() {
            warn!(pending = pending.len(), "Execution stopped before all phases ran");
            return Err(CuoError::Interrupted(format!(
                "stopped with {} phases pending",
                pending.len()
            )));
        }

        let elapsed = started.elapsed();
        info!(
            phase = %target_path,
            phases = executed.len(),
            elapsed_secs = elapsed.as_secs(),
            "Execution completed"
        );
        let notice =
            notify::build_execution_completed_message(plan, &target_path, executed.len(), elapsed);
        self.notify(plan, &notice).await;

        Ok(Report {
            phase: target_path,
            phases: executed,
            elapsed,
        })
    }

    /// Apply a phase outcome to the plan. Returns the error message on failure.
    fn record(&self, plan: &mut Plan, outcome: Outcome) -> Result<(), String> {
        let Outcome {
            index,
            result,
            elapsed,
        } = outcome;
        let kind = plan.get(index).executor;
        let path = plan.path(index).to_string();

        let (label, recorded) = match result {
            Ok(()) => {
                plan.set_state(index, PhaseState::Completed, None);
                info!(phase = %path, elapsed_secs = elapsed.as_secs(), "Phase completed");
                ("completed", Ok(()))
            }
            Err(e) => {
                let message = e.to_string();
                plan.set_state(index, PhaseState::Failed, Some(message.clone()));
                error!(phase = %path, transient = e.is_transient(), error = %e, "Phase failed");
                ("failed", Err(message))
            }
        };
        if let (Some(metrics), Some(kind)) = (&self.metrics, kind) {
            metrics.observe_phase(kind, label, elapsed);
        }
        recorded
    }

    /// Put phases that will be reattempted back into the unstarted state.
    fn reset_for_retry(
        &self,
        plan: &mut Plan,
        target: PhaseIndex,
        leaves: &[PhaseIndex],
        force: bool,
    ) -> Result<(), CuoError> {
        let mut changed = false;
        for &index in leaves {
            let retry = match plan.state(index) {
                PhaseState::Failed | PhaseState::RolledBack => true,
                PhaseState::InProgress => {
                    warn!(phase = %plan.path(index), "Phase was left in progress, retrying");
                    true
                }
                // An explicitly targeted leaf is re-run when forced.
                PhaseState::Completed => force && index == target,
                PhaseState::Unstarted => false,
            };
            if retry {
                info!(
                    phase = %plan.path(index),
                    from = %plan.state(index),
                    "Phase reset for retry"
                );
                plan.set_state(index, PhaseState::Unstarted, None);
                changed = true;
            }
        }
        if changed {
            self.persist(plan)?;
        }
        Ok(())
    }

    /// Roll back the phase at `path` and everything below it, in reverse
    /// execution order, one phase at a time.
    ///
    /// Only completed and failed phases are rolled back. Unless `force` is
    /// set, phases outside the subtree that depend on it must not be in a
    /// completed, failed or in-progress state.
    pub async fn rollback(
        &self,
        plan: &mut Plan,
        path: &str,
        force: bool,
    ) -> Result<Report, CuoError> {
        let started = Instant::now();
        let target = plan.phase(path)?;
        let target_path = plan.path(target).to_string();
        let scope: HashSet<PhaseIndex> = plan.leaves(target).into_iter().collect();

        let candidates: Vec<PhaseIndex> = plan
            .execution_order()?
            .into_iter()
            .rev()
            .filter(|i| {
                scope.contains(i)
                    && matches!(plan.state(*i), PhaseState::Completed | PhaseState::Failed)
            })
            .collect();

        if !force {
            let dependents = active_dependents(plan, &scope, &candidates);
            if !dependents.is_empty() {
                return Err(CuoError::DependentsNotRolledBack {
                    phase: target_path,
                    dependents: dependents.into_iter().collect::<Vec<_>>().join(", "),
                });
            }
        }
        for &index in &candidates {
            self.executor_for(plan, index)?;
        }

        info!(
            operation = %plan.operation_id,
            phase = %target_path,
            phases = candidates.len(),
            force,
            "Rolling back phases"
        );

        let mut interrupt = self.interrupt.clone();
        let mut rolled_back = Vec::new();
        for index in candidates {
            if *interrupt.borrow() != Interrupt::Clear {
                return Err(CuoError::Interrupted(format!(
                    "rollback stopped before {}",
                    plan.path(index)
                )));
            }

            let (kind, executor) = self.executor_for(plan, index)?;
            let phase = plan.path(index).to_string();
            plan.set_state(index, PhaseState::InProgress, None);
            self.persist(plan)?;
            info!(phase = %phase, kind = %kind, executor = executor.name(), "Rolling back phase");

            let run = run_phase(
                executor,
                Self::context(plan, index, kind),
                index,
                self.phase_timeout,
                true,
            );
            let outcome = tokio::select! {
                outcome = run => outcome,
                () = wait_for_abort(&mut interrupt) => {
                    error!(phase = %phase, "Rollback aborted");
                    plan.set_state(index, PhaseState::Failed, Some("aborted".to_string()));
                    self.persist(plan)?;
                    return Err(CuoError::Interrupted(format!("rollback of {phase} aborted")));
                }
            };

            match outcome.result {
                Ok(()) => {
                    plan.set_state(index, PhaseState::RolledBack, None);
                    info!(
                        phase = %phase,
                        elapsed_secs = outcome.elapsed.as_secs(),
                        "Phase rolled back"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_rollback(kind);
                    }
                    self.persist(plan)?;
                    rolled_back.push(phase);
                }
                Err(e) => {
                    let message = format!("rollback failed: {e}");
                    plan.set_state(index, PhaseState::Failed, Some(message.clone()));
                    error!(phase = %phase, error = %e, "Phase rollback failed");
                    self.persist(plan)?;
                    let notice = notify::build_phase_failed_message(plan, &phase, &message);
                    self.notify(plan, &notice).await;
                    return Err(CuoError::PhaseFailed { phase, message });
                }
            }
        }

        Ok(Report {
            phase: target_path,
            phases: rolled_back,
            elapsed: started.elapsed(),
        })
    }

    /// Final state of the operation, recorded in metrics and notifications.
    pub async fn complete(&self, plan: &Plan) -> OperationState {
        let state = completion_state(plan);
        info!(operation = %plan.operation_id, state = %state, "Completing operation");
        if let Some(metrics) = &self.metrics {
            metrics.record_operation(&state.to_string());
        }
        let notice = notify::build_operation_finished_message(plan, state);
        self.notify(plan, &notice).await;
        state
    }
}

/// Keep the first persistence error; running phases still finish.
fn hold_sink_error(held: &mut Option<CuoError>, e: CuoError, running: usize) {
    error!(error = %e, running, "Failed to persist plan, waiting for running phases");
    held.get_or_insert(e);
}

/// Whether every gate of a leaf inside the execution scope has completed.
fn is_ready(plan: &Plan, index: PhaseIndex, scope: &HashSet<PhaseIndex>) -> bool {
    plan.leaf_prerequisites(index)
        .into_iter()
        .all(|p| !scope.contains(&p) || plan.state(p) == PhaseState::Completed)
}

fn check_prerequisites(
    plan: &Plan,
    target_path: &str,
    scope: &HashSet<PhaseIndex>,
) -> Result<(), CuoError> {
    let missing: BTreeSet<PhaseIndex> = scope
        .iter()
        .filter(|&&i| plan.state(i) != PhaseState::Completed)
        .flat_map(|&i| plan.leaf_prerequisites(i))
        .filter(|p| !scope.contains(p) && plan.state(*p) != PhaseState::Completed)
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    debug!(phase = target_path, missing = missing.len(), "Prerequisites not met");
    Err(CuoError::PrerequisitesNotMet {
        phase: target_path.to_string(),
        missing: missing
            .into_iter()
            .map(|i| plan.path(i))
            .collect::<Vec<_>>()
            .join(", "),
    })
}

/// Paths of leaves outside `scope` that have run and gate on a rollback candidate.
fn active_dependents(
    plan: &Plan,
    scope: &HashSet<PhaseIndex>,
    candidates: &[PhaseIndex],
) -> BTreeSet<String> {
    let candidates: HashSet<PhaseIndex> = candidates.iter().copied().collect();
    plan.leaves(plan.root())
        .into_iter()
        .filter(|i| !scope.contains(i))
        .filter(|&i| {
            matches!(
                plan.state(i),
                PhaseState::Completed | PhaseState::Failed | PhaseState::InProgress
            )
        })
        .filter(|&i| {
            plan.leaf_prerequisites(i)
                .iter()
                .any(|p| candidates.contains(p))
        })
        .map(|i| plan.path(i).to_string())
        .collect()
}

fn run_phase(
    executor: Arc<dyn Executor>,
    ctx: PhaseContext,
    index: PhaseIndex,
    timeout: Duration,
    rollback: bool,
) -> BoxFuture<'static, Outcome> {
    async move {
        let started = Instant::now();
        let action = if rollback {
            executor.rollback(&ctx)
        } else {
            executor.execute(&ctx)
        };
        let result = match tokio::time::timeout(timeout, action).await {
            Ok(result) => result,
            Err(_) => Err(CuoError::Timeout {
                operation: ctx.path.clone(),
                details: format!("phase did not finish within {timeout:?}"),
            }),
        };
        Outcome {
            index,
            result,
            elapsed: started.elapsed(),
        }
    }
    .boxed()
}

/// Resolves once an abort is requested; never if the sender goes away.
async fn wait_for_abort(interrupt: &mut watch::Receiver<Interrupt>) {
    loop {
        if *interrupt.borrow_and_update() == Interrupt::Abort {
            return;
        }
        if interrupt.changed().await.is_err() {
            futures::future::pending::<()>().await;
        }
    }
}
