//! Arena representation of a plan: phase records addressed by index and by path.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cluster::{Server, UpdateServer};
use crate::error::CuoError;
use crate::package::Locator;

use super::phase::{
    ChildOrder, Dependency, Phase, PhaseData, PhaseKind, PhaseState, ROOT_PATH,
};

/// Position of a phase record in the plan arena.
pub type PhaseIndex = usize;

/// A phase as stored in the plan.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<PhaseKind>,
    #[serde(default)]
    pub data: PhaseData,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<Dependency>,
    #[serde(default)]
    pub order: ChildOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PhaseIndex>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<PhaseIndex>,
    #[serde(default)]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    /// Last execution error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PhaseRecord {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// Versions the plan was built for.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlanVersions {
    pub installed_app: Locator,
    pub target_app: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_etcd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_etcd: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlan {
    operation_id: String,
    cluster_name: String,
    servers: Vec<UpdateServer>,
    versions: PlanVersions,
    created: DateTime<Utc>,
    phases: Vec<PhaseRecord>,
}

/// An update plan: the phase tree of one operation plus its dependency edges.
#[derive(Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub operation_id: String,
    pub cluster_name: String,
    pub servers: Vec<UpdateServer>,
    pub versions: PlanVersions,
    pub created: DateTime<Utc>,
    phases: Vec<PhaseRecord>,
    #[serde(skip)]
    index: HashMap<String, PhaseIndex>,
}

impl<'de> Deserialize<'de> for Plan {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawPlan::deserialize(deserializer)?;
        Self::from_records(raw).map_err(serde::de::Error::custom)
    }
}

impl Plan {
    /// Flatten a phase tree into a validated plan.
    pub fn new(
        operation_id: impl Into<String>,
        cluster_name: impl Into<String>,
        servers: Vec<UpdateServer>,
        versions: PlanVersions,
        root: Phase,
    ) -> Result<Self, CuoError> {
        let mut phases = Vec::new();
        flatten(root, None, &mut phases);
        Self::from_records(RawPlan {
            operation_id: operation_id.into(),
            cluster_name: cluster_name.into(),
            servers,
            versions,
            created: Utc::now(),
            phases,
        })
    }

    fn from_records(raw: RawPlan) -> Result<Self, CuoError> {
        let mut plan = Self {
            operation_id: raw.operation_id,
            cluster_name: raw.cluster_name,
            servers: raw.servers,
            versions: raw.versions,
            created: raw.created,
            phases: raw.phases,
            index: HashMap::new(),
        };
        plan.build_index()?;
        plan.validate()?;
        Ok(plan)
    }

    fn build_index(&mut self) -> Result<(), CuoError> {
        let mut index = HashMap::with_capacity(self.phases.len());
        for (i, phase) in self.phases.iter().enumerate() {
            if index.insert(phase.id.clone(), i).is_some() {
                return Err(CuoError::InvalidPlan(format!("duplicate phase {}", phase.id)));
            }
        }
        self.index = index;
        Ok(())
    }

    fn validate(&self) -> Result<(), CuoError> {
        let root = self
            .phases
            .first()
            .ok_or_else(|| CuoError::InvalidPlan("plan has no phases".to_string()))?;
        if root.id != ROOT_PATH || root.parent.is_some() {
            return Err(CuoError::InvalidPlan(format!(
                "first phase must be the root, found {}",
                root.id
            )));
        }
        if root.children.is_empty() {
            return Err(CuoError::InvalidPlan("plan has no phases".to_string()));
        }

        for (i, phase) in self.phases.iter().enumerate() {
            for &child in &phase.children {
                if self.phases.get(child).and_then(|c| c.parent) != Some(i) {
                    return Err(CuoError::InvalidPlan(format!(
                        "phase {} has an inconsistent child link",
                        phase.id
                    )));
                }
            }
            if i == 0 {
                continue;
            }
            if phase.parent.is_none() {
                return Err(CuoError::InvalidPlan(format!("phase {} has no parent", phase.id)));
            }
            match (phase.is_leaf(), phase.executor) {
                (true, None) => {
                    return Err(CuoError::InvalidPlan(format!(
                        "leaf phase {} has no executor",
                        phase.id
                    )));
                }
                (false, Some(kind)) => {
                    return Err(CuoError::InvalidPlan(format!(
                        "group phase {} has executor {kind}",
                        phase.id
                    )));
                }
                _ => {}
            }
            for dependency in &phase.requires {
                let target = self.resolve(dependency)?;
                if target == i || self.is_ancestor(target, i) || self.is_ancestor(i, target) {
                    return Err(CuoError::InvalidPlan(format!(
                        "phase {} cannot depend on {dependency}",
                        phase.id
                    )));
                }
            }
        }

        self.execution_order().map(|_| ())
    }

    /// Number of phases, including the root.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub const fn root(&self) -> PhaseIndex {
        0
    }

    pub fn get(&self, index: PhaseIndex) -> &PhaseRecord {
        &self.phases[index]
    }

    /// All phase records in pre-order.
    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phases
    }

    pub fn path(&self, index: PhaseIndex) -> &str {
        &self.phases[index].id
    }

    /// Look up a phase by path. A missing leading `/` is tolerated.
    pub fn find(&self, path: &str) -> Option<PhaseIndex> {
        if path.is_empty() || path == ROOT_PATH {
            return Some(self.root());
        }
        if path.starts_with('/') {
            self.index.get(path).copied()
        } else {
            self.index.get(&format!("/{path}")).copied()
        }
    }

    /// Like [`Plan::find`], failing with `PhaseNotFound`.
    pub fn phase(&self, path: &str) -> Result<PhaseIndex, CuoError> {
        self.find(path)
            .ok_or_else(|| CuoError::PhaseNotFound(path.to_string()))
    }

    /// Depth below the root (top-level phases have depth 1).
    pub fn depth(&self, index: PhaseIndex) -> usize {
        self.ancestors(index).count()
    }

    /// Strict ancestors of a phase, nearest first, ending at the root.
    pub fn ancestors(&self, index: PhaseIndex) -> impl Iterator<Item = PhaseIndex> + '_ {
        std::iter::successors(self.phases[index].parent, |&i| self.phases[i].parent)
    }

    /// Whether `ancestor` is a strict ancestor of `index`.
    pub fn is_ancestor(&self, ancestor: PhaseIndex, index: PhaseIndex) -> bool {
        self.ancestors(index).any(|i| i == ancestor)
    }

    /// The phase and all its descendants, in pre-order.
    pub fn subtree(&self, index: PhaseIndex) -> Vec<PhaseIndex> {
        let mut result = Vec::new();
        let mut stack = vec![index];
        while let Some(i) = stack.pop() {
            result.push(i);
            stack.extend(self.phases[i].children.iter().rev());
        }
        result
    }

    /// Leaf phases of a subtree, in pre-order.
    pub fn leaves(&self, index: PhaseIndex) -> Vec<PhaseIndex> {
        self.subtree(index)
            .into_iter()
            .filter(|&i| self.phases[i].is_leaf())
            .collect()
    }

    /// Resolve a dependency to the phase it gates on.
    ///
    /// A server-scoped dependency resolves to the child of the referenced phase
    /// that targets the server, or to the referenced phase itself if it has none.
    pub fn resolve(&self, dependency: &Dependency) -> Result<PhaseIndex, CuoError> {
        let target = self.find(&dependency.phase).ok_or_else(|| {
            CuoError::InvalidPlan(format!("dependency on unknown phase {}", dependency.phase))
        })?;
        let Some(hostname) = dependency.server.as_deref() else {
            return Ok(target);
        };
        Ok(self.phases[target]
            .children
            .iter()
            .copied()
            .find(|&child| {
                self.phases[child]
                    .data
                    .server
                    .as_ref()
                    .is_some_and(|s| s.hostname == hostname)
            })
            .unwrap_or(target))
    }

    fn previous_sibling(&self, index: PhaseIndex) -> Option<PhaseIndex> {
        let parent = self.phases[index].parent?;
        let siblings = &self.phases[parent].children;
        let position = siblings.iter().position(|&i| i == index)?;
        position.checked_sub(1).map(|p| siblings[p])
    }

    /// Phases that must be completed before the given phase may start.
    ///
    /// Includes the gates of every ancestor: the preceding sibling of each
    /// sequential phase on the path and every explicit dependency.
    pub fn prerequisites(&self, index: PhaseIndex) -> Vec<PhaseIndex> {
        let mut result = Vec::new();
        for i in std::iter::once(index).chain(self.ancestors(index)) {
            let phase = &self.phases[i];
            if phase.order == ChildOrder::Sequential {
                result.extend(self.previous_sibling(i));
            }
            result.extend(phase.requires.iter().filter_map(|d| self.resolve(d).ok()));
        }
        result
    }

    /// Leaf phases that must be completed before the given phase may start.
    pub fn leaf_prerequisites(&self, index: PhaseIndex) -> BTreeSet<PhaseIndex> {
        self.prerequisites(index)
            .into_iter()
            .flat_map(|p| self.leaves(p))
            .collect()
    }

    /// Leaf phases in an order that satisfies every gate.
    ///
    /// Ties are broken by plan order, so the result is deterministic.
    pub fn execution_order(&self) -> Result<Vec<PhaseIndex>, CuoError> {
        let leaves = self.leaves(self.root());
        let mut indegree: HashMap<PhaseIndex, usize> = HashMap::new();
        let mut dependents: HashMap<PhaseIndex, Vec<PhaseIndex>> = HashMap::new();
        for &leaf in &leaves {
            let gates = self.leaf_prerequisites(leaf);
            indegree.insert(leaf, gates.len());
            for gate in gates {
                dependents.entry(gate).or_default().push(leaf);
            }
        }

        let mut ready: BinaryHeap<Reverse<PhaseIndex>> = leaves
            .iter()
            .filter(|leaf| indegree.get(leaf) == Some(&0))
            .map(|&leaf| Reverse(leaf))
            .collect();
        let mut order = Vec::with_capacity(leaves.len());
        while let Some(Reverse(leaf)) = ready.pop() {
            order.push(leaf);
            for &next in dependents.get(&leaf).map_or(&[][..], Vec::as_slice) {
                if let Some(degree) = indegree.get_mut(&next) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse(next));
                    }
                }
            }
        }

        if order.len() < leaves.len() {
            let stuck = leaves
                .iter()
                .find(|leaf| indegree.get(leaf).is_some_and(|&d| d > 0))
                .map_or_else(String::new, |&leaf| self.path(leaf).to_string());
            return Err(CuoError::DependencyCycle(stuck));
        }
        Ok(order)
    }

    /// Server leading the operation: the execution server of `/init`, or
    /// the first master of the fleet.
    pub fn lead_master(&self) -> Option<&Server> {
        self.find("/init")
            .and_then(|i| self.phases[i].data.exec_server.as_ref())
            .or_else(|| {
                self.servers
                    .iter()
                    .map(|s| &s.server)
                    .find(|s| s.is_master())
            })
    }

    pub fn state(&self, index: PhaseIndex) -> PhaseState {
        self.phases[index].state
    }

    /// Record the new state of a leaf and roll it up into its ancestors.
    pub fn set_state(&mut self, index: PhaseIndex, state: PhaseState, error: Option<String>) {
        let now = Utc::now();
        let phase = &mut self.phases[index];
        phase.state = state;
        phase.error = error;
        phase.updated = Some(now);
        self.roll_up(index, now);
    }

    fn roll_up(&mut self, index: PhaseIndex, now: DateTime<Utc>) {
        let mut current = self.phases[index].parent;
        while let Some(i) = current {
            let state = group_state(self.phases[i].children.iter().map(|&c| self.phases[c].state));
            let phase = &mut self.phases[i];
            if phase.state != state {
                phase.state = state;
                phase.updated = Some(now);
            }
            current = phase.parent;
        }
    }
}

/// State of a group phase derived from the states of its children.
pub fn group_state(children: impl IntoIterator<Item = PhaseState>) -> PhaseState {
    let (mut total, mut completed, mut failed, mut in_progress, mut rolled_back) = (0, 0, 0, 0, 0);
    for state in children {
        total += 1;
        match state {
            PhaseState::Completed => completed += 1,
            PhaseState::Failed => failed += 1,
            PhaseState::InProgress => in_progress += 1,
            PhaseState::RolledBack => rolled_back += 1,
            PhaseState::Unstarted => {}
        }
    }
    let unstarted = total - completed - failed - in_progress - rolled_back;

    if total > 0 && completed == total {
        PhaseState::Completed
    } else if in_progress > 0 {
        PhaseState::InProgress
    } else if failed > 0 {
        PhaseState::Failed
    } else if rolled_back > 0 && rolled_back + unstarted == total {
        PhaseState::RolledBack
    } else if unstarted == total {
        PhaseState::Unstarted
    } else {
        PhaseState::InProgress
    }
}

fn flatten(phase: Phase, parent: Option<PhaseIndex>, records: &mut Vec<PhaseRecord>) -> PhaseIndex {
    let index = records.len();
    let Phase {
        id,
        description,
        executor,
        data,
        requires,
        order,
        phases,
    } = phase;
    records.push(PhaseRecord {
        id,
        description,
        executor,
        data,
        requires,
        order,
        parent,
        children: Vec::new(),
        state: PhaseState::Unstarted,
        updated: None,
        error: None,
    });
    let children = phases
        .into_iter()
        .map(|child| flatten(child, Some(index), records))
        .collect();
    records[index].children = children;
    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ServerRole;

    fn versions() -> PlanVersions {
        PlanVersions {
            installed_app: Locator::new("gravitational.io", "telekube", "5.5.0"),
            target_app: Locator::new("gravitational.io", "telekube", "6.0.0"),
            installed_etcd: None,
            target_etcd: None,
        }
    }

    fn leaf(id: &str) -> Phase {
        Phase::new(id, id).with_executor(PhaseKind::Checks)
    }

    fn server(hostname: &str) -> Server {
        Server {
            hostname: hostname.to_string(),
            advertise_ip: "10.0.0.1".to_string(),
            role: ServerRole::Master,
        }
    }

    fn on_server(id: &str, hostname: &str) -> Phase {
        leaf(id).with_data(PhaseData {
            server: Some(server(hostname)),
            ..Default::default()
        })
    }

    fn plan(children: Vec<Phase>) -> Result<Plan, CuoError> {
        let mut root = Phase::new(ROOT_PATH, "root");
        root.add_sequential(children);
        Plan::new("op-1", "prod", vec![], versions(), root)
    }

    /// /a (group: x, y parallel), /b (leaf), both sequential under root.
    fn simple() -> Plan {
        let mut a = Phase::root("a", "a");
        a.add_parallel([leaf("x"), leaf("y")]);
        plan(vec![a, leaf("b")]).unwrap()
    }

    fn paths(plan: &Plan, indices: impl IntoIterator<Item = PhaseIndex>) -> Vec<String> {
        indices.into_iter().map(|i| plan.path(i).to_string()).collect()
    }

    #[test]
    fn test_flatten_preorder_and_lookup() {
        let plan = simple();
        let all: Vec<_> = plan.phases().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(all, vec!["/", "/a", "/a/x", "/a/y", "/b"]);
        assert_eq!(plan.find("/a/y"), Some(3));
        assert_eq!(plan.find("a/y"), Some(3));
        assert_eq!(plan.find("/"), Some(0));
        assert!(matches!(plan.phase("/c"), Err(CuoError::PhaseNotFound(_))));
        assert_eq!(plan.depth(3), 2);
        assert!(plan.is_ancestor(1, 3));
        assert!(!plan.is_ancestor(3, 1));
    }

    #[test]
    fn test_sequential_prerequisites_expand_to_leaves() {
        let plan = simple();
        let b = plan.phase("/b").unwrap();
        assert_eq!(paths(&plan, plan.leaf_prerequisites(b)), vec!["/a/x", "/a/y"]);
        let x = plan.phase("/a/x").unwrap();
        assert!(plan.leaf_prerequisites(x).is_empty());
    }

    #[test]
    fn test_execution_order_is_deterministic() {
        let plan = simple();
        let order = plan.execution_order().unwrap();
        assert_eq!(paths(&plan, order), vec!["/a/x", "/a/y", "/b"]);
    }

    #[test]
    fn test_server_dependency_resolves_to_matching_child() {
        let mut backup = Phase::root("backup", "backup");
        backup.add_parallel([on_server("m1", "m1"), on_server("m2", "m2")]);
        let mut shutdown = Phase::root("shutdown", "shutdown");
        shutdown.add_with_dependency(Dependency::for_server(&backup, &server("m2")), leaf("m2"));
        shutdown.add_with_dependency(Dependency::for_server(&backup, &server("m9")), leaf("m9"));

        let mut root = Phase::new(ROOT_PATH, "root");
        root.add_parallel([backup, shutdown]);
        let plan = Plan::new("op-1", "prod", vec![], versions(), root).unwrap();

        let m2 = plan.phase("/shutdown/m2").unwrap();
        assert_eq!(paths(&plan, plan.leaf_prerequisites(m2)), vec!["/backup/m2"]);

        // No child targets m9, so the whole phase gates it.
        let m9 = plan.phase("/shutdown/m9").unwrap();
        assert_eq!(
            paths(&plan, plan.leaf_prerequisites(m9)),
            vec!["/backup/m1", "/backup/m2"]
        );
    }

    #[test]
    fn test_rejects_duplicate_paths() {
        let mut a = Phase::root("a", "a");
        a.add_parallel([leaf("x"), leaf("x")]);
        let err = plan(vec![a]).unwrap_err();
        assert_eq!(err.to_string(), "Invalid plan: duplicate phase /a/x");
    }

    #[test]
    fn test_rejects_unknown_dependency() {
        let mut a = Phase::root("a", "a");
        a.add_with_dependency(
            Dependency {
                phase: "/missing".to_string(),
                server: None,
            },
            leaf("x"),
        );
        let err = plan(vec![a]).unwrap_err();
        assert!(err.to_string().contains("unknown phase /missing"));
    }

    #[test]
    fn test_rejects_dependency_on_ancestor() {
        let mut a = Phase::root("a", "a");
        a.add_with_dependency(
            Dependency {
                phase: "/a".to_string(),
                server: None,
            },
            leaf("x"),
        );
        assert!(matches!(plan(vec![a]), Err(CuoError::InvalidPlan(_))));
    }

    #[test]
    fn test_rejects_leaf_without_executor() {
        let err = plan(vec![Phase::root("a", "a")]).unwrap_err();
        assert!(err.to_string().contains("leaf phase /a has no executor"));
    }

    #[test]
    fn test_rejects_group_with_executor() {
        let mut a = Phase::root("a", "a").with_executor(PhaseKind::Init);
        a.add_parallel([leaf("x")]);
        assert!(plan(vec![a]).is_err());
    }

    #[test]
    fn test_rejects_cycle() {
        // /b runs after /a, but /a/x waits for /b.
        let mut a = Phase::root("a", "a");
        a.add_with_dependency(
            Dependency {
                phase: "/b".to_string(),
                server: None,
            },
            leaf("x"),
        );
        let err = plan(vec![a, leaf("b")]).unwrap_err();
        assert!(matches!(err, CuoError::DependencyCycle(_)));
    }

    #[test]
    fn test_rejects_empty_plan() {
        assert!(plan(vec![]).is_err());
    }

    #[test]
    fn test_group_state_rollup() {
        let mut plan = simple();
        let (a, x, y) = (1, 2, 3);
        plan.set_state(x, PhaseState::InProgress, None);
        assert_eq!(plan.state(a), PhaseState::InProgress);
        assert_eq!(plan.state(plan.root()), PhaseState::InProgress);

        plan.set_state(x, PhaseState::Completed, None);
        assert_eq!(plan.state(a), PhaseState::InProgress);

        plan.set_state(y, PhaseState::Failed, Some("boom".to_string()));
        assert_eq!(plan.state(a), PhaseState::Failed);
        assert_eq!(plan.get(y).error.as_deref(), Some("boom"));

        plan.set_state(y, PhaseState::Completed, None);
        assert_eq!(plan.state(a), PhaseState::Completed);
        assert_eq!(plan.state(plan.root()), PhaseState::InProgress);
    }

    #[test]
    fn test_group_state_rules() {
        use PhaseState::{Completed, Failed, InProgress, RolledBack, Unstarted};
        assert_eq!(group_state([Unstarted, Unstarted]), Unstarted);
        assert_eq!(group_state([Completed, Completed]), Completed);
        assert_eq!(group_state([Completed, Unstarted]), InProgress);
        assert_eq!(group_state([Failed, InProgress]), InProgress);
        assert_eq!(group_state([Failed, Completed]), Failed);
        assert_eq!(group_state([RolledBack, Unstarted]), RolledBack);
        assert_eq!(group_state([RolledBack, Completed]), InProgress);
    }

    #[test]
    fn test_serde_rebuilds_index() {
        let mut plan = simple();
        plan.set_state(2, PhaseState::Completed, None);
        let json = serde_json::to_string(&plan).unwrap();
        let loaded: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.phases(), plan.phases());
        assert_eq!(loaded.find("/b"), Some(4));
        assert_eq!(loaded.state(2), PhaseState::Completed);
    }

    #[test]
    fn test_deserialize_rejects_broken_links() {
        let plan = simple();
        let mut value = serde_json::to_value(&plan).unwrap();
        value["phases"][2]["parent"] = serde_json::json!(4);
        assert!(serde_json::from_value::<Plan>(value).is_err());
    }
}
