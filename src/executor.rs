//! Phase executors and the dispatch table mapping phase kinds to them.

pub mod agent;
pub mod dryrun;
pub mod node;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;

use crate::cluster::Server;
use crate::error::CuoError;
use crate::plan::{PhaseData, PhaseKind};

pub use agent::AgentExecutor;
pub use dryrun::DryRunExecutor;
pub use node::KubeNodeExecutor;

/// Everything an executor needs to run one leaf phase.
#[derive(Clone, Debug)]
pub struct PhaseContext {
    pub operation_id: String,
    /// Full path of the phase.
    pub path: String,
    pub kind: PhaseKind,
    pub data: PhaseData,
    /// Lead master of the operation, used when the phase names no server.
    pub lead_master: Option<Server>,
}

impl PhaseContext {
    /// Server remote actions are executed from.
    pub fn exec_server(&self) -> Option<&Server> {
        self.data
            .exec_server
            .as_ref()
            .or(self.data.server.as_ref())
            .or(self.lead_master.as_ref())
    }

    /// Server the phase operates on.
    pub fn target_server(&self) -> Result<&Server, CuoError> {
        self.data.target_server().ok_or_else(|| {
            CuoError::Executor(self.path.clone(), "phase does not name a server".to_string())
        })
    }
}

/// Handler for one or more phase kinds.
pub trait Executor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn execute<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>>;

    /// Reverse action; a no-op unless the executor defines one.
    fn rollback<'a>(&'a self, _ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        futures::future::ready(Ok(())).boxed()
    }
}

/// Dispatch table from phase kind to executor.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<PhaseKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor for a kind, replacing any previous one.
    pub fn register(&mut self, kind: PhaseKind, executor: Arc<dyn Executor>) {
        self.executors.insert(kind, executor);
    }

    /// Register one executor for several kinds.
    pub fn register_all(
        &mut self,
        kinds: impl IntoIterator<Item = PhaseKind>,
        executor: &Arc<dyn Executor>,
    ) {
        for kind in kinds {
            self.register(kind, Arc::clone(executor));
        }
    }

    /// Agent dispatch for every kind, with Kubernetes node operations handled
    /// by `node` when a client is available.
    pub fn standard(agent: Arc<dyn Executor>, node: Option<Arc<dyn Executor>>) -> Self {
        let mut registry = Self::new();
        registry.register_all(PhaseKind::ALL, &agent);
        if let Some(node) = node {
            registry.register_all(
                PhaseKind::ALL.into_iter().filter(|k| k.is_node_operation()),
                &node,
            );
        }
        registry
    }

    /// One executor for every kind.
    pub fn uniform(executor: Arc<dyn Executor>) -> Self {
        let mut registry = Self::new();
        registry.register_all(PhaseKind::ALL, &executor);
        registry
    }

    pub fn get(&self, kind: PhaseKind) -> Result<Arc<dyn Executor>, CuoError> {
        self.executors
            .get(&kind)
            .cloned()
            .ok_or_else(|| CuoError::NoExecutor(kind.to_string()))
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<_> = self
            .executors
            .iter()
            .map(|(kind, executor)| format!("{kind}={}", executor.name()))
            .collect();
        kinds.sort();
        f.debug_struct("ExecutorRegistry")
            .field("executors", &kinds)
            .finish()
    }
}
