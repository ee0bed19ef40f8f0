//! File-backed operation store: one JSON document per operation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CuoError;
use crate::plan::Plan;

const OPERATIONS_DIR: &str = "operations";

/// Lifecycle state of an update operation.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// An update operation and its plan.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub cluster: String,
    pub state: OperationState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub plan: Plan,
}

/// Destination for plan progress written by the engine.
pub trait PlanSink: Send + Sync {
    fn persist(&self, plan: &Plan) -> Result<(), CuoError>;
}

/// Operations stored under `<state-dir>/operations/<id>.json`.
#[derive(Clone, Debug)]
pub struct OperationStore {
    root: PathBuf,
}

impl OperationStore {
    /// Open (and create if needed) the store rooted at the state directory.
    pub fn open(state_dir: &Path) -> Result<Self, CuoError> {
        let root = state_dir.join(OPERATIONS_DIR);
        fs::create_dir_all(&root)
            .map_err(|e| CuoError::Store(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    /// Store a freshly built plan as a new in-progress operation.
    ///
    /// Fails while another operation for the same cluster is in progress.
    pub fn create(&self, plan: Plan) -> Result<Operation, CuoError> {
        validate_id(&plan.operation_id)?;
        if self.path(&plan.operation_id).exists() {
            return Err(CuoError::Store(format!(
                "operation {} already exists",
                plan.operation_id
            )));
        }
        if let Some(active) = self
            .list()?
            .into_iter()
            .find(|op| op.cluster == plan.cluster_name && op.state == OperationState::InProgress)
        {
            return Err(CuoError::OperationInProgress(active.id));
        }

        let now = Utc::now();
        let operation = Operation {
            id: plan.operation_id.clone(),
            cluster: plan.cluster_name.clone(),
            state: OperationState::InProgress,
            created: now,
            updated: now,
            plan,
        };
        self.write(&operation)?;
        info!(operation = %operation.id, cluster = %operation.cluster, "Created update operation");
        Ok(operation)
    }

    pub fn load(&self, id: &str) -> Result<Operation, CuoError> {
        validate_id(id)?;
        let path = self.path(id);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CuoError::OperationNotFound(id.to_string()));
            }
            Err(e) => return Err(CuoError::Store(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&content)
            .map_err(|e| CuoError::Store(format!("parse {}: {e}", path.display())))
    }

    /// All stored operations, oldest first. Unreadable files are skipped.
    pub fn list(&self) -> Result<Vec<Operation>, CuoError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| CuoError::Store(format!("read {}: {e}", self.root.display())))?;
        let mut operations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CuoError::Store(e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            match self.load(id) {
                Ok(operation) => operations.push(operation),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable operation");
                }
            }
        }
        operations.sort_by_key(|op| op.created);
        Ok(operations)
    }

    /// The operation to act on: the given id, or the only one in progress.
    pub fn resolve(&self, id: Option<&str>) -> Result<Operation, CuoError> {
        if let Some(id) = id {
            return self.load(id);
        }
        let mut active: Vec<_> = self
            .list()?
            .into_iter()
            .filter(|op| op.state == OperationState::InProgress)
            .collect();
        match active.len() {
            0 => Err(CuoError::OperationNotFound("no operation in progress".to_string())),
            1 => Ok(active.remove(0)),
            n => Err(CuoError::Store(format!(
                "{n} operations in progress, select one with --operation-id"
            ))),
        }
    }

    /// Persist the operation, stamping its update time.
    pub fn save(&self, operation: &mut Operation) -> Result<(), CuoError> {
        operation.updated = Utc::now();
        self.write(operation)
    }

    /// Mark the operation finished with the given state.
    pub fn finish(&self, id: &str, state: OperationState) -> Result<Operation, CuoError> {
        let mut operation = self.load(id)?;
        operation.state = state;
        self.save(&mut operation)?;
        info!(operation = id, state = %state, "Operation finished");
        Ok(operation)
    }

    /// Write through a temporary file so readers never see a partial document.
    fn write(&self, operation: &Operation) -> Result<(), CuoError> {
        let path = self.path(&operation.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(operation)
            .map_err(|e| CuoError::Store(format!("encode operation {}: {e}", operation.id)))?;
        fs::write(&tmp, content)
            .map_err(|e| CuoError::Store(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &path)
            .map_err(|e| CuoError::Store(format!("rename {}: {e}", tmp.display())))?;
        debug!(path = %path.display(), "Saved operation");
        Ok(())
    }
}

impl PlanSink for OperationStore {
    fn persist(&self, plan: &Plan) -> Result<(), CuoError> {
        let mut operation = self.load(&plan.operation_id)?;
        operation.plan = plan.clone();
        self.save(&mut operation)
    }
}

/// Plan sink that keeps nothing, for callers without a store.
pub struct NoopSink;

impl PlanSink for NoopSink {
    fn persist(&self, _plan: &Plan) -> Result<(), CuoError> {
        Ok(())
    }
}

fn validate_id(id: &str) -> Result<(), CuoError> {
    if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
        return Err(CuoError::Store(format!("invalid operation id {id:?}")));
    }
    Ok(())
}

/// Default operation id for a cluster: name plus creation timestamp.
pub fn new_operation_id(cluster: &str, now: DateTime<Utc>) -> String {
    format!("{cluster}-{}", now.format("%Y%m%d%H%M%S"))
}
