//! Custom error types for cuo.

use thiserror::Error;

/// Errors that can occur while building or executing an update plan.
#[derive(Error, Debug)]
pub enum CuoError {
    #[error("Invalid cluster topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid package locator: {0}")]
    InvalidLocator(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Dependency cycle detected at phase {0}")]
    DependencyCycle(String),

    #[error("Phase not found: {0}")]
    PhaseNotFound(String),

    #[error("Phase {phase} requires {missing} to be completed first")]
    PrerequisitesNotMet { phase: String, missing: String },

    #[error("Phase {phase} cannot be rolled back before its dependents: {dependents}")]
    DependentsNotRolledBack { phase: String, dependents: String },

    #[error("Phase {phase} failed: {message}")]
    PhaseFailed { phase: String, message: String },

    #[error("Execution interrupted: {0}")]
    Interrupted(String),

    #[error("Operation {0} is already in progress for this cluster")]
    OperationInProgress(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("No executor registered for phase kind {0}")]
    NoExecutor(String),

    #[error("[{0}] {1}")]
    Executor(String, String),

    #[error("Kubernetes API error: {0}")]
    KubernetesApi(String),

    #[error("[{0}] agent request failed: {1}")]
    Agent(String, String),

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("State store error: {0}")]
    Store(String),
}

impl CuoError {
    /// Create an agent error for the given server, keeping a single-line message.
    pub fn agent<E: std::fmt::Display>(server: &str, err: E) -> Self {
        let message = err.to_string();
        let line = message.lines().next().unwrap_or_default().trim().to_string();
        Self::Agent(server.to_string(), line)
    }

    /// Create a Kubernetes API error with the failing action as context.
    pub fn kube<E: std::fmt::Display>(action: &str, err: E) -> Self {
        Self::KubernetesApi(format!("{action}: {err}"))
    }

    /// Returns true if this error reports a missing object rather than a failure.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this error is transient and the phase can simply be retried.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Agent(_, _) | Self::KubernetesApi(_) | Self::Timeout { .. }
        )
    }
}
