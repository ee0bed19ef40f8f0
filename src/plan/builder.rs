//! Plan tree builder: translates a cluster snapshot into an update plan.

use tracing::{debug, info};

use crate::cluster::{Server, Topology, UpdateServer};
use crate::error::CuoError;
use crate::package::{BOOTSTRAP_CONFIG_PACKAGE, Locator, PackageService};
use crate::snapshot::ClusterSnapshot;

use super::graph::{Plan, PlanVersions};
use super::phase::{
    Dependency, Phase, PhaseData, PhaseKind, ROOT_PATH, UpdateOperationData,
};
use super::policy::{self, election_change, servers_of};

/// Name of the cluster management service restarted after the etcd upgrade.
pub const GRAVITY_SERVICE_NAME: &str = "gravity-site";

/// Build the update plan for a cluster snapshot.
///
/// Any topology, manifest or version error aborts construction; no partial
/// plan is ever returned.
pub fn build_plan(
    operation_id: &str,
    snapshot: &ClusterSnapshot,
    packages: &dyn PackageService,
) -> Result<Plan, CuoError> {
    let topology = Topology::new(&snapshot.servers, snapshot.lead_master.as_deref())?;
    let supports_taints = policy::supports_taints(&snapshot.target.gravity_package)?;
    let etcd = policy::should_update_etcd(
        &snapshot.installed.runtime.manifest,
        &snapshot.target.runtime.manifest,
        packages,
    )?;

    let builder = PhaseBuilder {
        servers: &snapshot.servers,
        installed_app: &snapshot.installed.app.package,
        update_app: &snapshot.target.app.package,
    };
    let lead = &topology.lead_master;

    let mut phases = vec![builder.init(&lead.server), builder.checks()];
    if snapshot.target.app.manifest.has_pre_update_hook() {
        phases.push(builder.pre_update());
    }
    if snapshot.selinux {
        phases.push(builder.bootstrap_selinux());
    }
    phases.push(builder.bootstrap());
    if snapshot.dns_resources_missing {
        phases.push(builder.coredns(&lead.server));
    }
    if let Some(dns_app) = &snapshot.early_dns_app {
        phases.push(builder.early_dns_app(dns_app));
    }
    phases.push(builder.masters(lead, &topology.other_masters, supports_taints));
    if !topology.workers.is_empty() {
        phases.push(builder.nodes(lead, &topology.workers, supports_taints));
    }
    if etcd.update {
        phases.push(builder.etcd(
            &lead.server,
            &servers_of(&topology.other_masters),
            &servers_of(&topology.workers),
            etcd.installed_version.as_deref(),
            &etcd.target_version,
        ));
    }
    phases.push(builder.config(&servers_of(topology.masters())));
    if let Some(runtime) = builder.runtime(&snapshot.runtime_updates) {
        phases.push(runtime);
    }
    if policy::should_enable_openebs(
        &snapshot.installed.app.manifest,
        &snapshot.target.app.manifest,
    ) {
        phases.push(builder.openebs(&lead.server));
    }
    if let Some(migration) = builder.migration(&lead.server, snapshot) {
        phases.push(migration);
    }
    if let Some(app) = builder.app(&snapshot.app_updates) {
        phases.push(app);
    }
    phases.push(builder.cleanup());

    debug!(
        lead_master = lead.hostname(),
        supports_taints,
        etcd_update = etcd.update,
        "Assembled top-level phases"
    );

    let mut root = Phase::new(
        ROOT_PATH,
        format!(
            "Update cluster {} from {} to {}",
            snapshot.cluster_name, snapshot.installed.app.package, snapshot.target.app.package
        ),
    );
    root.add_sequential(phases);

    let plan = Plan::new(
        operation_id,
        &snapshot.cluster_name,
        snapshot.servers.clone(),
        PlanVersions {
            installed_app: snapshot.installed.app.package.clone(),
            target_app: snapshot.target.app.package.clone(),
            installed_etcd: etcd.installed_version,
            target_etcd: etcd.update.then_some(etcd.target_version),
        },
        root,
    )?;

    info!(
        operation = operation_id,
        cluster = %snapshot.cluster_name,
        phases = plan.len(),
        "Built update plan"
    );
    Ok(plan)
}

struct PhaseBuilder<'a> {
    servers: &'a [UpdateServer],
    installed_app: &'a Locator,
    update_app: &'a Locator,
}

impl PhaseBuilder<'_> {
    fn init(&self, lead_master: &Server) -> Phase {
        Phase::root("init", "Initialize update operation")
            .with_executor(PhaseKind::Init)
            .with_data(PhaseData {
                package: Some(self.update_app.clone()),
                installed_package: Some(self.installed_app.clone()),
                exec_server: Some(lead_master.clone()),
                update: Some(UpdateOperationData {
                    servers: self.servers.to_vec(),
                }),
                ..Default::default()
            })
    }

    fn checks(&self) -> Phase {
        Phase::root("checks", "Run preflight checks")
            .with_executor(PhaseKind::Checks)
            .with_data(PhaseData {
                package: Some(self.update_app.clone()),
                installed_package: Some(self.installed_app.clone()),
                ..Default::default()
            })
    }

    fn pre_update(&self) -> Phase {
        Phase::root("pre-update", "Run pre-update application hook")
            .with_executor(PhaseKind::PreUpdate)
            .with_data(PhaseData {
                package: Some(self.update_app.clone()),
                ..Default::default()
            })
    }

    fn bootstrap_selinux(&self) -> Phase {
        let mut root = Phase::root("selinux-bootstrap", "Configure SELinux on nodes");
        let children: Vec<_> = self
            .servers
            .iter()
            .map(|server| {
                let host = server.hostname();
                self.per_server(
                    &root,
                    server,
                    PhaseKind::BootstrapSelinux,
                    format!("Configure SELinux on node {host:?}"),
                )
            })
            .collect();
        root.add_parallel(children);
        root
    }

    fn bootstrap(&self) -> Phase {
        let mut root = Phase::root("bootstrap", "Bootstrap update operation on nodes");
        let children: Vec<_> = self
            .servers
            .iter()
            .map(|server| {
                let host = server.hostname();
                self.per_server(
                    &root,
                    server,
                    PhaseKind::Bootstrap,
                    format!("Bootstrap node {host:?}"),
                )
            })
            .collect();
        root.add_parallel(children);
        root
    }

    /// Leaf executed on `server` itself, carrying the application package pair.
    fn per_server(
        &self,
        parent: &Phase,
        server: &UpdateServer,
        kind: PhaseKind,
        description: String,
    ) -> Phase {
        Phase::new(parent.child_literal(server.hostname()), description)
            .with_executor(kind)
            .with_data(PhaseData {
                exec_server: Some(server.server.clone()),
                package: Some(self.update_app.clone()),
                installed_package: Some(self.installed_app.clone()),
                update: Some(UpdateOperationData {
                    servers: vec![server.clone()],
                }),
                ..Default::default()
            })
    }

    fn coredns(&self, lead_master: &Server) -> Phase {
        Phase::root("coredns", "Provision CoreDNS resources")
            .with_executor(PhaseKind::Coredns)
            .with_data(PhaseData {
                server: Some(lead_master.clone()),
                ..Default::default()
            })
    }

    /// DNS application update run before the masters restart on a runtime
    /// without embedded DNS.
    fn early_dns_app(&self, locator: &Locator) -> Phase {
        let (name, version) = (&locator.name, &locator.version);
        package_update(
            locator,
            format!("Update system application {name:?} to {version}"),
        )
    }

    fn app(&self, updates: &[Locator]) -> Option<Phase> {
        if updates.is_empty() {
            return None;
        }
        let mut root = Phase::root("app", "Update installed application");
        root.add_parallel(updates.iter().map(|locator| {
            let (name, version) = (&locator.name, &locator.version);
            package_update(locator, format!("Update application {name:?} to {version}"))
        }));
        Some(root)
    }

    /// Migration phase, or `None` when there is nothing to migrate.
    fn migration(&self, lead_master: &Server, snapshot: &ClusterSnapshot) -> Option<Phase> {
        let mut root = Phase::root("migration", "Perform system database migration");

        let mut phases = Vec::new();
        if policy::need_migrate_links(&snapshot.links, &snapshot.trusted_clusters) {
            phases.push(
                Phase::new(
                    root.child_literal("links"),
                    "Migrate remote Gravity Hub links to trusted clusters",
                )
                .with_executor(PhaseKind::MigrateLinks),
            );
        }
        if !snapshot.labels_current {
            phases.push(
                Phase::new(root.child_literal("labels"), "Update node labels")
                    .with_executor(PhaseKind::UpdateLabels),
            );
        }
        if policy::need_migrate_roles(&snapshot.roles) {
            phases.push(
                Phase::new(root.child_literal("roles"), "Migrate cluster roles to a new format")
                    .with_executor(PhaseKind::MigrateRoles)
                    .with_data(PhaseData {
                        exec_server: Some(lead_master.clone()),
                        ..Default::default()
                    }),
            );
        }

        if phases.is_empty() {
            return None;
        }
        root.add_parallel(phases);
        Some(root)
    }

    /// Pull updated system configuration on the given nodes.
    fn config(&self, nodes: &[Server]) -> Phase {
        let mut root = Phase::root("config", "Update system configuration on nodes");
        let children: Vec<_> = nodes
            .iter()
            .map(|node| {
                let host = &node.hostname;
                Phase::new(
                    root.child_literal(host),
                    format!("Update system configuration on node {host:?}"),
                )
                .with_executor(PhaseKind::Config)
                .with_data(PhaseData {
                    server: Some(node.clone()),
                    ..Default::default()
                })
            })
            .collect();
        root.add_parallel(children);
        root
    }

    fn openebs(&self, lead_master: &Server) -> Phase {
        Phase::root("openebs", "Create OpenEBS configuration")
            .with_executor(PhaseKind::Openebs)
            .with_data(PhaseData {
                exec_server: Some(lead_master.clone()),
                ..Default::default()
            })
    }

    /// Runtime package updates, bootstrap configuration package first.
    fn runtime(&self, updates: &[Locator]) -> Option<Phase> {
        if updates.is_empty() {
            return None;
        }
        let mut updates = updates.to_vec();
        updates.sort_by_key(|locator| locator.name != BOOTSTRAP_CONFIG_PACKAGE);

        let mut root = Phase::root("runtime", "Update application runtime");
        root.add_sequential(updates.iter().map(|locator| {
            let (name, version) = (&locator.name, &locator.version);
            package_update(
                locator,
                format!("Update system application {name:?} to {version}"),
            )
        }));
        Some(root)
    }

    /// Upgrade masters one at a time, moving leadership to the lead master.
    fn masters(
        &self,
        lead_master: &UpdateServer,
        other_masters: &[UpdateServer],
        supports_taints: bool,
    ) -> Phase {
        let mut root = Phase::root("masters", "Update master nodes");
        let lead = lead_master.hostname();

        let mut branch = node(
            &root,
            &lead_master.server,
            format!("Update system software on master node {lead:?}"),
        );
        if !other_masters.is_empty() {
            branch.add_sequential([set_leader_election(
                Vec::new(),
                servers_of([lead_master]),
                lead_master,
                "stepdown",
                format!("Step down {lead:?} as Kubernetes leader"),
            )]);
        }
        branch.add_sequential(self.common_node(
            lead_master,
            lead_master,
            supports_taints,
            other_masters.is_empty(),
        ));
        root.add_sequential([branch]);

        if !other_masters.is_empty() {
            root.add_sequential([set_leader_election(
                servers_of([lead_master]),
                servers_of(other_masters),
                lead_master,
                "elect",
                format!("Make node {lead:?} Kubernetes leader"),
            )]);
        }

        for server in other_masters {
            let host = server.hostname();
            let mut branch = node(
                &root,
                &server.server,
                format!("Update system software on master node {host:?}"),
            );
            branch.add_sequential(self.common_node(server, lead_master, supports_taints, true));
            branch.add_sequential([set_leader_election(
                servers_of([server]),
                Vec::new(),
                server,
                "enable",
                format!("Enable leader election on node {host:?}"),
            )]);
            root.add_sequential([branch]);
        }
        root
    }

    fn nodes(
        &self,
        lead_master: &UpdateServer,
        nodes: &[UpdateServer],
        supports_taints: bool,
    ) -> Phase {
        let mut root = Phase::root("nodes", "Update regular nodes");
        let children: Vec<_> = nodes
            .iter()
            .map(|server| {
                let host = server.hostname();
                let mut branch = node(
                    &root,
                    &server.server,
                    format!("Update system software on node {host:?}"),
                );
                branch.add_sequential(self.common_node(server, lead_master, supports_taints, true));
                branch
            })
            .collect();
        root.add_parallel(children);
        root
    }

    /// Operations that upgrade the system software of any node.
    ///
    /// Kubernetes-side steps run from the lead master; the upgrade itself runs
    /// on the node.
    fn common_node(
        &self,
        server: &UpdateServer,
        lead_master: &UpdateServer,
        supports_taints: bool,
        waits_for_endpoints: bool,
    ) -> Vec<Phase> {
        let host = server.hostname();
        let remote = |id: &str, kind: PhaseKind, description: String| {
            Phase::new(id, description)
                .with_executor(kind)
                .with_data(PhaseData {
                    server: Some(server.server.clone()),
                    exec_server: Some(lead_master.server.clone()),
                    ..Default::default()
                })
        };

        let mut phases = vec![
            remote("drain", PhaseKind::Drain, format!("Drain node {host:?}")),
            Phase::new(
                "system-upgrade",
                format!("Update system software on node {host:?}"),
            )
            .with_executor(PhaseKind::SystemUpgrade)
            .with_data(PhaseData {
                exec_server: Some(server.server.clone()),
                update: Some(UpdateOperationData {
                    servers: vec![server.clone()],
                }),
                ..Default::default()
            }),
        ];
        if supports_taints {
            phases.push(remote("taint", PhaseKind::Taint, format!("Taint node {host:?}")));
        }
        phases.push(remote(
            "uncordon",
            PhaseKind::Uncordon,
            format!("Uncordon node {host:?}"),
        ));
        if waits_for_endpoints {
            phases.push(remote(
                "endpoints",
                PhaseKind::Endpoints,
                format!("Wait for DNS/cluster endpoints on {host:?}"),
            ));
        }
        if supports_taints {
            phases.push(remote(
                "untaint",
                PhaseKind::Untaint,
                format!("Remove taint from node {host:?}"),
            ));
        }
        phases
    }

    /// Five-stage etcd upgrade chained per server.
    fn etcd(
        &self,
        lead_master: &Server,
        other_masters: &[Server],
        workers: &[Server],
        current_version: Option<&str>,
        desired_version: &str,
    ) -> Phase {
        let description = match current_version {
            Some(current) => format!("Upgrade etcd {current} to {desired_version}"),
            None => format!("Upgrade etcd to {desired_version}"),
        };
        let mut root = Phase::root("etcd", description);

        let mut backup = Phase::new(root.child_literal("backup"), "Backup etcd data");
        let backups: Vec<_> = std::iter::once(lead_master)
            .chain(other_masters)
            .map(|server| {
                let host = &server.hostname;
                etcd_node(
                    &backup,
                    server,
                    PhaseKind::EtcdBackup,
                    format!("Backup etcd on node {host:?}"),
                )
            })
            .collect();
        backup.add_parallel(backups);

        // Workers hold no backup, so their dependency falls back to the whole stage.
        let mut shutdown = Phase::new(root.child_literal("shutdown"), "Shutdown etcd cluster");
        for server in std::iter::once(lead_master).chain(other_masters).chain(workers) {
            let host = &server.hostname;
            let mut phase = etcd_node(
                &shutdown,
                server,
                PhaseKind::EtcdShutdown,
                format!("Shutdown etcd on node {host:?}"),
            );
            phase.data.data = Some((server == lead_master).to_string());
            shutdown.add_with_dependency(Dependency::for_server(&backup, server), phase);
        }

        let mut upgrade = Phase::new(root.child_literal("upgrade"), "Upgrade etcd servers");
        for server in std::iter::once(lead_master).chain(other_masters).chain(workers) {
            let host = &server.hostname;
            let phase = etcd_node(
                &upgrade,
                server,
                PhaseKind::EtcdUpgrade,
                format!("Upgrade etcd on node {host:?}"),
            );
            upgrade.add_with_dependency(Dependency::for_server(&shutdown, server), phase);
        }

        let restore = Phase::new(root.child_literal("restore"), "Restore etcd data from backup")
            .with_executor(PhaseKind::EtcdRestore)
            .with_data(PhaseData {
                server: Some(lead_master.clone()),
                ..Default::default()
            });

        let mut restart = Phase::new(root.child_literal("restart"), "Restart etcd servers");
        let lead_restart = etcd_node(
            &restart,
            lead_master,
            PhaseKind::EtcdRestart,
            format!("Restart etcd on node {:?}", lead_master.hostname),
        );
        let lead_restart_path = lead_restart.id.clone();
        restart.add_with_dependency(Dependency::for_server(&restore, lead_master), lead_restart);
        for server in other_masters.iter().chain(workers) {
            let host = &server.hostname;
            let phase = etcd_node(
                &restart,
                server,
                PhaseKind::EtcdRestart,
                format!("Restart etcd on node {host:?}"),
            );
            restart.add_with_dependency(Dependency::for_server(&upgrade, server), phase);
        }
        // Leader election resumes once the management service restarts on the lead master.
        restart.add_with_dependency(
            Dependency {
                phase: lead_restart_path,
                server: None,
            },
            Phase::new(
                restart.child_literal(GRAVITY_SERVICE_NAME),
                format!("Restart {GRAVITY_SERVICE_NAME} service"),
            )
            .with_executor(PhaseKind::EtcdRestartGravity)
            .with_data(PhaseData {
                server: Some(lead_master.clone()),
                ..Default::default()
            }),
        );

        // Each stage starts once the previous one has completed on every server.
        root.add_sequential([backup, shutdown, upgrade, restore, restart]);
        root
    }

    fn cleanup(&self) -> Phase {
        let mut root = Phase::root("gc", "Run cleanup tasks");
        let children: Vec<_> = self
            .servers
            .iter()
            .map(|server| {
                let host = server.hostname();
                node(&root, &server.server, format!("Clean up node {host:?}"))
                    .with_executor(PhaseKind::Cleanup)
                    .with_data(PhaseData {
                        server: Some(server.server.clone()),
                        ..Default::default()
                    })
            })
            .collect();
        root.add_parallel(children);
        root
    }
}

/// Group phase for one node below `parent`.
fn node(parent: &Phase, server: &Server, description: String) -> Phase {
    Phase::new(parent.child_literal(&server.hostname), description)
}

fn etcd_node(parent: &Phase, server: &Server, kind: PhaseKind, description: String) -> Phase {
    node(parent, server, description)
        .with_executor(kind)
        .with_data(PhaseData {
            server: Some(server.clone()),
            ..Default::default()
        })
}

fn package_update(locator: &Locator, description: String) -> Phase {
    Phase::new(locator.name.clone(), description)
        .with_executor(PhaseKind::UpdateApp)
        .with_data(PhaseData {
            package: Some(locator.clone()),
            ..Default::default()
        })
}

/// Phase changing the leader election state, executed on `server`.
fn set_leader_election(
    enable: Vec<Server>,
    disable: Vec<Server>,
    server: &UpdateServer,
    key: &str,
    description: String,
) -> Phase {
    Phase::new(format!("{key}-{}", server.hostname()), description)
        .with_executor(PhaseKind::Election)
        .with_data(PhaseData {
            server: Some(server.server.clone()),
            election_change: Some(election_change(enable, disable)),
            ..Default::default()
        })
}
