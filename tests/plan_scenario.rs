use std::collections::HashMap;
use std::path::PathBuf;

use cuo::cluster::Server;
use cuo::plan::{PhaseIndex, PhaseKind, Plan, build_plan};
use cuo::snapshot::ClusterSnapshot;

fn fixture() -> ClusterSnapshot {
    let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("snapshot.yaml");
    ClusterSnapshot::load(&path).expect("Failed to load snapshot fixture")
}

fn build() -> Plan {
    let snapshot = fixture();
    build_plan("prod-op", &snapshot, &snapshot.catalog()).expect("Failed to build plan")
}

fn children(plan: &Plan, path: &str) -> Vec<String> {
    let index = plan.phase(path).expect("phase exists");
    plan.get(index)
        .children
        .iter()
        .map(|&i| plan.path(i).to_string())
        .collect()
}

fn gates(plan: &Plan, path: &str) -> Vec<String> {
    let index = plan.phase(path).expect("phase exists");
    plan.leaf_prerequisites(index)
        .into_iter()
        .map(|i| plan.path(i).to_string())
        .collect()
}

/// Gates of a phase that lie below `prefix`.
fn gates_within(plan: &Plan, path: &str, prefix: &str) -> Vec<String> {
    gates(plan, path)
        .into_iter()
        .filter(|p| p.starts_with(prefix))
        .collect()
}

fn hostnames(servers: &[Server]) -> Vec<&str> {
    servers.iter().map(|s| s.hostname.as_str()).collect()
}

#[test]
fn test_top_level_phases() {
    let plan = build();
    assert_eq!(
        children(&plan, "/"),
        vec![
            "/init",
            "/checks",
            "/bootstrap",
            "/masters",
            "/nodes",
            "/etcd",
            "/config",
            "/migration",
            "/gc",
        ]
    );
    assert_eq!(plan.versions.installed_etcd.as_deref(), Some("3.3.4"));
    assert_eq!(plan.versions.target_etcd.as_deref(), Some("3.3.11"));
    assert_eq!(plan.lead_master().map(|s| s.hostname.as_str()), Some("m1"));
}

#[test]
fn test_masters_move_leadership_to_lead_master() {
    let plan = build();
    assert_eq!(
        children(&plan, "/masters"),
        vec!["/masters/m1", "/masters/elect-m1", "/masters/m2", "/masters/m3"]
    );

    // The lead master is not the only master, so it does not wait for endpoints.
    assert_eq!(
        children(&plan, "/masters/m1"),
        vec![
            "/masters/m1/stepdown-m1",
            "/masters/m1/drain",
            "/masters/m1/system-upgrade",
            "/masters/m1/taint",
            "/masters/m1/uncordon",
            "/masters/m1/untaint",
        ]
    );
    assert_eq!(
        children(&plan, "/masters/m2"),
        vec![
            "/masters/m2/drain",
            "/masters/m2/system-upgrade",
            "/masters/m2/taint",
            "/masters/m2/uncordon",
            "/masters/m2/endpoints",
            "/masters/m2/untaint",
            "/masters/m2/enable-m2",
        ]
    );

    let elect = plan.get(plan.phase("/masters/elect-m1").expect("elect phase"));
    assert_eq!(elect.executor, Some(PhaseKind::Election));
    let change = elect.data.election_change.as_ref().expect("election change");
    assert_eq!(hostnames(&change.enable_servers), vec!["m1"]);
    assert_eq!(hostnames(&change.disable_servers), vec!["m2", "m3"]);

    // Masters go one at a time.
    assert_eq!(
        gates_within(&plan, "/masters/m3/drain", "/masters/"),
        vec![
            "/masters/m2/drain",
            "/masters/m2/system-upgrade",
            "/masters/m2/taint",
            "/masters/m2/uncordon",
            "/masters/m2/endpoints",
            "/masters/m2/untaint",
            "/masters/m2/enable-m2",
        ]
    );
}

#[test]
fn test_nodes_run_in_parallel_from_lead_master() {
    let plan = build();
    assert_eq!(
        children(&plan, "/nodes"),
        vec!["/nodes/n1", "/nodes/n2", "/nodes/n3"]
    );
    assert_eq!(
        children(&plan, "/nodes/n2"),
        vec![
            "/nodes/n2/drain",
            "/nodes/n2/system-upgrade",
            "/nodes/n2/taint",
            "/nodes/n2/uncordon",
            "/nodes/n2/endpoints",
            "/nodes/n2/untaint",
        ]
    );

    let drain = plan.get(plan.phase("/nodes/n2/drain").expect("drain"));
    assert_eq!(drain.data.server.as_ref().map(|s| s.hostname.as_str()), Some("n2"));
    assert_eq!(
        drain.data.exec_server.as_ref().map(|s| s.hostname.as_str()),
        Some("m1")
    );

    // Workers do not wait for each other, only for the masters.
    let first = gates(&plan, "/nodes/n2/drain");
    assert!(first.iter().all(|p| p.starts_with("/masters/")));
    assert!(first.contains(&"/masters/m3/enable-m3".to_string()));
}

#[test]
fn test_etcd_stages() {
    let plan = build();
    assert_eq!(
        children(&plan, "/etcd"),
        vec![
            "/etcd/backup",
            "/etcd/shutdown",
            "/etcd/upgrade",
            "/etcd/restore",
            "/etcd/restart",
        ]
    );
    assert_eq!(children(&plan, "/etcd/backup").len(), 3);
    assert_eq!(children(&plan, "/etcd/shutdown").len(), 6);
    assert_eq!(children(&plan, "/etcd/upgrade").len(), 6);
    assert_eq!(
        children(&plan, "/etcd/restart").last().map(String::as_str),
        Some("/etcd/restart/gravity-site")
    );

    let shutdown = |host: &str| {
        plan.get(plan.phase(&format!("/etcd/shutdown/{host}")).expect("shutdown"))
            .data
            .data
            .clone()
    };
    assert_eq!(shutdown("m1").as_deref(), Some("true"));
    assert_eq!(shutdown("m2").as_deref(), Some("false"));
    assert_eq!(shutdown("n1").as_deref(), Some("false"));
}

#[test]
fn test_etcd_dependencies() {
    let plan = build();

    let backups = ["/etcd/backup/m1", "/etcd/backup/m2", "/etcd/backup/m3"];

    // No server shuts down before every backup exists.
    for host in ["m1", "m2", "m3", "n1", "n2", "n3"] {
        assert_eq!(
            gates_within(&plan, &format!("/etcd/shutdown/{host}"), "/etcd/"),
            backups
        );
    }

    let upgrade = gates_within(&plan, "/etcd/upgrade/n3", "/etcd/");
    assert!(upgrade.contains(&"/etcd/shutdown/n3".to_string()));
    assert!(upgrade.contains(&"/etcd/shutdown/m1".to_string()));
    let restore = gates_within(&plan, "/etcd/restore", "/etcd/");
    assert_eq!(restore.len(), 6);
    assert!(restore.iter().all(|p| p.starts_with("/etcd/upgrade/")));

    // No server comes back online before the store is restored.
    for restart in children(&plan, "/etcd/restart") {
        assert!(
            gates(&plan, &restart).contains(&"/etcd/restore".to_string()),
            "{restart} does not wait for restore"
        );
    }
    let m2 = gates_within(&plan, "/etcd/restart/m2", "/etcd/");
    assert!(m2.contains(&"/etcd/upgrade/m2".to_string()));
    assert!(!m2.iter().any(|p| p.starts_with("/etcd/restart/")));
    assert_eq!(
        gates_within(&plan, "/etcd/restart/gravity-site", "/etcd/restart/"),
        vec!["/etcd/restart/m1"]
    );
    // The whole etcd phase waits for every worker.
    assert!(gates(&plan, "/etcd/backup/m1").contains(&"/nodes/n3/untaint".to_string()));
}

#[test]
fn test_config_and_cleanup() {
    let plan = build();
    assert_eq!(
        children(&plan, "/config"),
        vec!["/config/m1", "/config/m2", "/config/m3"]
    );
    assert_eq!(children(&plan, "/migration"), vec!["/migration/labels"]);
    assert_eq!(
        children(&plan, "/gc"),
        vec!["/gc/m1", "/gc/n1", "/gc/m2", "/gc/n2", "/gc/m3", "/gc/n3"]
    );
}

#[test]
fn test_execution_order_respects_every_gate() {
    let plan = build();
    let order = plan.execution_order().expect("plan is acyclic");
    assert_eq!(order.len(), plan.leaves(plan.root()).len());
    assert_eq!(plan.path(order[0]), "/init");
    assert_eq!(plan.path(order[1]), "/checks");

    let position: HashMap<PhaseIndex, usize> =
        order.iter().enumerate().map(|(pos, &i)| (i, pos)).collect();
    for &leaf in &order {
        for gate in plan.leaf_prerequisites(leaf) {
            assert!(
                position[&gate] < position[&leaf],
                "{} runs before its gate {}",
                plan.path(leaf),
                plan.path(gate)
            );
        }
    }
}

#[test]
fn test_build_is_deterministic() {
    let first = build();
    let second = build();
    let ids = |plan: &Plan| -> Vec<String> { plan.phases().iter().map(|p| p.id.clone()).collect() };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(
        first.execution_order().expect("order"),
        second.execution_order().expect("order")
    );
    for (a, b) in first.phases().iter().zip(second.phases()) {
        assert_eq!(a.requires, b.requires);
        assert_eq!(a.data, b.data);
    }
}

#[test]
fn test_explicit_lead_master() {
    let mut snapshot = fixture();
    snapshot.lead_master = Some("m2".to_string());
    let plan = build_plan("prod-op", &snapshot, &snapshot.catalog()).expect("plan");
    assert_eq!(
        children(&plan, "/masters"),
        vec!["/masters/m2", "/masters/elect-m2", "/masters/m1", "/masters/m3"]
    );
    assert_eq!(plan.lead_master().map(|s| s.hostname.as_str()), Some("m2"));
}

#[test]
fn test_plan_survives_json_round_trip() {
    let plan = build();
    let json = serde_json::to_string(&plan).expect("encode");
    let decoded: Plan = serde_json::from_str(&json).expect("decode");
    assert_eq!(decoded.len(), plan.len());
    assert_eq!(
        decoded.execution_order().expect("order"),
        plan.execution_order().expect("order")
    );
}
