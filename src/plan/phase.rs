//! Phase model: the building block of an update plan.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::{Server, UpdateServer};
use crate::package::Locator;

/// Path of the plan root. Every other phase path is `/`-separated below it.
pub const ROOT_PATH: &str = "/";

/// Join a phase path and a child segment.
pub fn join_path(parent: &str, segment: &str) -> String {
    if parent == ROOT_PATH || parent.is_empty() {
        format!("/{segment}")
    } else {
        format!("{parent}/{segment}")
    }
}

/// Last segment of a phase path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Kind of operation a leaf phase performs; selects its executor.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    Init,
    Checks,
    PreUpdate,
    BootstrapSelinux,
    Bootstrap,
    Coredns,
    Openebs,
    Config,
    UpdateApp,
    MigrateLinks,
    UpdateLabels,
    MigrateRoles,
    Election,
    Drain,
    SystemUpgrade,
    Taint,
    Uncordon,
    Endpoints,
    Untaint,
    EtcdBackup,
    EtcdShutdown,
    EtcdUpgrade,
    EtcdRestore,
    EtcdRestart,
    EtcdRestartGravity,
    Cleanup,
}

impl PhaseKind {
    pub const ALL: [Self; 26] = [
        Self::Init,
        Self::Checks,
        Self::PreUpdate,
        Self::BootstrapSelinux,
        Self::Bootstrap,
        Self::Coredns,
        Self::Openebs,
        Self::Config,
        Self::UpdateApp,
        Self::MigrateLinks,
        Self::UpdateLabels,
        Self::MigrateRoles,
        Self::Election,
        Self::Drain,
        Self::SystemUpgrade,
        Self::Taint,
        Self::Uncordon,
        Self::Endpoints,
        Self::Untaint,
        Self::EtcdBackup,
        Self::EtcdShutdown,
        Self::EtcdUpgrade,
        Self::EtcdRestore,
        Self::EtcdRestart,
        Self::EtcdRestartGravity,
        Self::Cleanup,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Checks => "checks",
            Self::PreUpdate => "pre-update",
            Self::BootstrapSelinux => "bootstrap-selinux",
            Self::Bootstrap => "bootstrap",
            Self::Coredns => "coredns",
            Self::Openebs => "openebs",
            Self::Config => "config",
            Self::UpdateApp => "update-app",
            Self::MigrateLinks => "migrate-links",
            Self::UpdateLabels => "update-labels",
            Self::MigrateRoles => "migrate-roles",
            Self::Election => "election",
            Self::Drain => "drain",
            Self::SystemUpgrade => "system-upgrade",
            Self::Taint => "taint",
            Self::Uncordon => "uncordon",
            Self::Endpoints => "endpoints",
            Self::Untaint => "untaint",
            Self::EtcdBackup => "etcd-backup",
            Self::EtcdShutdown => "etcd-shutdown",
            Self::EtcdUpgrade => "etcd-upgrade",
            Self::EtcdRestore => "etcd-restore",
            Self::EtcdRestart => "etcd-restart",
            Self::EtcdRestartGravity => "etcd-restart-gravity",
            Self::Cleanup => "cleanup",
        }
    }

    /// Kinds handled through the Kubernetes API rather than a node agent.
    pub const fn is_node_operation(self) -> bool {
        matches!(
            self,
            Self::Drain | Self::Taint | Self::Uncordon | Self::Endpoints | Self::Untaint
        )
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a child is ordered relative to its preceding sibling.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChildOrder {
    /// No ordering constraint among siblings.
    #[default]
    Parallel,
    /// Starts only after the preceding sibling has completed.
    Sequential,
}

/// Execution state of a phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unstarted => write!(f, "Unstarted"),
            Self::InProgress => write!(f, "In Progress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
            Self::RolledBack => write!(f, "Rolled Back"),
        }
    }
}

/// Servers to enable and disable as leader election candidates.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElectionChange {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable_servers: Vec<Server>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable_servers: Vec<Server>,
}

/// Servers updated together by a single phase.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOperationData {
    #[serde(default)]
    pub servers: Vec<UpdateServer>,
}

/// Executor-specific phase payload.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseData {
    /// Target package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package: Option<Locator>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_package: Option<Locator>,

    /// Server the phase operates on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Server>,

    /// Server remote actions are executed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_server: Option<Server>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<UpdateOperationData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub election_change: Option<ElectionChange>,

    /// Free-form executor data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl PhaseData {
    /// Server the phase operates on: explicit target first, then the execution server.
    pub fn target_server(&self) -> Option<&Server> {
        self.server.as_ref().or(self.exec_server.as_ref())
    }
}

/// Reference to another phase, optionally narrowed to one server.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Full path of the referenced phase.
    pub phase: String,
    /// Hostname of the server the reference is scoped to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
}

impl Dependency {
    /// Dependency on the whole phase.
    pub fn on(phase: &Phase) -> Self {
        Self {
            phase: phase.id.clone(),
            server: None,
        }
    }

    /// Dependency on the part of `phase` that targets `server`.
    pub fn for_server(phase: &Phase, server: &Server) -> Self {
        Self {
            phase: phase.id.clone(),
            server: Some(server.hostname.clone()),
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.server {
            Some(server) => write!(f, "{} ({})", self.phase, server),
            None => write!(f, "{}", self.phase),
        }
    }
}

/// A phase under construction.
///
/// Phases are assembled as an owned tree by the builder and flattened into a
/// [`Plan`](super::graph::Plan) arena once complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Phase {
    /// Full path of the phase.
    pub id: String,
    pub description: String,
    pub executor: Option<PhaseKind>,
    pub data: PhaseData,
    pub requires: Vec<Dependency>,
    pub order: ChildOrder,
    pub phases: Vec<Phase>,
}

impl Phase {
    /// Create a phase with the given id (a single segment or a full path).
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            executor: None,
            data: PhaseData::default(),
            requires: Vec::new(),
            order: ChildOrder::Parallel,
            phases: Vec::new(),
        }
    }

    /// Create a top-level phase, placed directly below the plan root.
    pub fn root(id: &str, description: impl Into<String>) -> Self {
        Self::new(join_path(ROOT_PATH, id), description)
    }

    #[must_use]
    pub const fn with_executor(mut self, kind: PhaseKind) -> Self {
        self.executor = Some(kind);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: PhaseData) -> Self {
        self.data = data;
        self
    }

    /// Full path of a direct child named `segment`.
    pub fn child_literal(&self, segment: &str) -> String {
        join_path(&self.id, segment)
    }

    /// Last path segment.
    pub fn base(&self) -> &str {
        base_name(&self.id)
    }

    pub fn is_group(&self) -> bool {
        !self.phases.is_empty()
    }

    /// Add children with no ordering constraint among them.
    pub fn add_parallel(&mut self, phases: impl IntoIterator<Item = Self>) {
        for phase in phases {
            self.attach(phase, ChildOrder::Parallel);
        }
    }

    /// Add children that each start after the preceding sibling completes.
    pub fn add_sequential(&mut self, phases: impl IntoIterator<Item = Self>) {
        for phase in phases {
            self.attach(phase, ChildOrder::Sequential);
        }
    }

    /// Add a child gated on an explicit dependency instead of sibling order.
    pub fn add_with_dependency(&mut self, dependency: Dependency, mut phase: Self) {
        phase.requires.push(dependency);
        self.attach(phase, ChildOrder::Parallel);
    }

    fn attach(&mut self, mut phase: Self, order: ChildOrder) {
        phase.order = order;
        phase.rebase(&self.id);
        self.phases.push(phase);
    }

    /// Move the phase and its subtree below `parent`, keeping segment names.
    fn rebase(&mut self, parent: &str) {
        self.id = join_path(parent, base_name(&self.id));
        let id = self.id.clone();
        for child in &mut self.phases {
            child.rebase(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_path() {
        assert_eq!(join_path(ROOT_PATH, "init"), "/init");
        assert_eq!(join_path("/masters", "node-1"), "/masters/node-1");
        assert_eq!(base_name("/masters/node-1.example.com/drain"), "drain");
        assert_eq!(base_name("/masters"), "masters");
    }

    #[test]
    fn test_add_sequential_sets_paths_and_order() {
        let mut root = Phase::root("masters", "Update master nodes");
        let mut node = Phase::new("node-1", "Update node-1");
        node.add_sequential([
            Phase::new("drain", "Drain").with_executor(PhaseKind::Drain),
            Phase::new("system-upgrade", "Upgrade").with_executor(PhaseKind::SystemUpgrade),
        ]);
        root.add_sequential([node]);

        let node = &root.phases[0];
        assert_eq!(node.id, "/masters/node-1");
        assert_eq!(node.order, ChildOrder::Sequential);
        assert_eq!(node.phases[0].id, "/masters/node-1/drain");
        assert_eq!(node.phases[1].id, "/masters/node-1/system-upgrade");
        assert_eq!(node.phases[1].order, ChildOrder::Sequential);
    }

    #[test]
    fn test_child_literal_keeps_dotted_hostnames() {
        let root = Phase::root("bootstrap", "Bootstrap");
        assert_eq!(
            root.child_literal("node-1.example.com"),
            "/bootstrap/node-1.example.com"
        );
    }

    #[test]
    fn test_add_with_dependency() {
        let backup = Phase::root("backup", "Backup");
        let server = Server {
            hostname: "master-1".to_string(),
            advertise_ip: "10.0.0.1".to_string(),
            role: crate::cluster::ServerRole::Master,
        };
        let mut shutdown = Phase::root("shutdown", "Shutdown");
        shutdown.add_with_dependency(
            Dependency::for_server(&backup, &server),
            Phase::new("master-1", "Shutdown master-1").with_executor(PhaseKind::EtcdShutdown),
        );
        let child = &shutdown.phases[0];
        assert_eq!(child.order, ChildOrder::Parallel);
        assert_eq!(child.requires.len(), 1);
        assert_eq!(child.requires[0].phase, "/backup");
        assert_eq!(child.requires[0].server.as_deref(), Some("master-1"));
        assert_eq!(child.requires[0].to_string(), "/backup (master-1)");
    }

    #[test]
    fn test_phase_kind_serde_matches_display() {
        for kind in PhaseKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{kind}\""));
        }
    }

    #[test]
    fn test_node_operations() {
        assert!(PhaseKind::Drain.is_node_operation());
        assert!(PhaseKind::Untaint.is_node_operation());
        assert!(!PhaseKind::SystemUpgrade.is_node_operation());
        assert!(!PhaseKind::EtcdBackup.is_node_operation());
    }
}
