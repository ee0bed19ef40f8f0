//! Update plan model, construction and graph queries.

pub mod builder;
pub mod graph;
pub mod phase;
pub mod policy;

pub use builder::build_plan;
pub use graph::{PhaseIndex, PhaseRecord, Plan, PlanVersions};
pub use phase::{
    ChildOrder, Dependency, ElectionChange, Phase, PhaseData, PhaseKind, PhaseState, ROOT_PATH,
};
