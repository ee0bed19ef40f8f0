//! Build-time policy decisions: election change sets, version gates and migration checks.

use semver::Version;
use tracing::{debug, warn};

use crate::cluster::{Server, UpdateServer};
use crate::error::CuoError;
use crate::package::{
    ETCD_VERSION_LABEL, LEGACY_PLANET_MASTER, Locator, Manifest, PackageService, parse_semver,
};
use crate::snapshot::ClusterRole;

use super::phase::ElectionChange;

/// First cluster management version able to taint nodes during their upgrade.
pub const BASE_TAINTS_VERSION: Version = Version::new(5, 4, 0);

/// Current resource format version of cluster roles.
pub const CURRENT_ROLE_VERSION: &str = "v3";

/// Plain servers of the given update servers, in order.
pub fn servers_of<'a>(updates: impl IntoIterator<Item = &'a UpdateServer>) -> Vec<Server> {
    updates.into_iter().map(|u| u.server.clone()).collect()
}

/// Election change set from explicit enable and disable lists.
pub const fn election_change(enable: Vec<Server>, disable: Vec<Server>) -> ElectionChange {
    ElectionChange {
        enable_servers: enable,
        disable_servers: disable,
    }
}

/// Whether the given cluster management package supports node taints.
pub fn supports_taints(gravity_package: &Locator) -> Result<bool, CuoError> {
    let version = gravity_package.semver()?;
    Ok(BASE_TAINTS_VERSION <= version)
}

/// Outcome of the etcd version comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdUpgrade {
    pub update: bool,
    /// Installed version, absent when the installed runtime predates version labels.
    pub installed_version: Option<String>,
    pub target_version: String,
}

/// Decide whether the etcd bundled with the runtime must be upgraded.
///
/// A missing version on the installed side means an upgrade is needed.
/// The target side must carry a version label.
pub fn should_update_etcd(
    installed_runtime: &Manifest,
    update_runtime: &Manifest,
    packages: &dyn PackageService,
) -> Result<EtcdUpgrade, CuoError> {
    let installed_package = match installed_runtime.default_runtime_package() {
        Ok(locator) => locator,
        Err(err) if err.is_not_found() => installed_runtime
            .dependency(LEGACY_PLANET_MASTER)
            .map_err(|err| {
                warn!(error = %err, "Failed to fetch the installed runtime package");
                CuoError::NotFound("runtime package not found".to_string())
            })?,
        Err(err) => return Err(err),
    };

    let mut update = false;
    let installed = match etcd_version(installed_package, packages) {
        Ok(version) => Some(version),
        Err(err) if err.is_not_found() => {
            debug!(package = %installed_package, "Installed runtime has no etcd version");
            update = true;
            None
        }
        Err(err) => return Err(err),
    };

    let update_package = update_runtime.default_runtime_package()?;
    let target = etcd_version(update_package, packages)?;

    if installed.as_ref().is_none_or(|installed| *installed < target) {
        update = true;
    }

    Ok(EtcdUpgrade {
        update,
        installed_version: installed.map(|v| v.to_string()),
        target_version: target.to_string(),
    })
}

fn etcd_version(locator: &Locator, packages: &dyn PackageService) -> Result<Version, CuoError> {
    let manifest = packages.manifest(locator)?;
    let value = manifest.label(ETCD_VERSION_LABEL).ok_or_else(|| {
        CuoError::NotFound(format!(
            "package manifest for {locator} does not have label {ETCD_VERSION_LABEL}"
        ))
    })?;
    parse_semver(value)
}

/// Whether any cluster role is stored in an older resource format.
pub fn need_migrate_roles(roles: &[ClusterRole]) -> bool {
    roles.iter().any(|role| role.version != CURRENT_ROLE_VERSION)
}

/// Whether legacy hub links must be converted into trusted clusters.
pub const fn need_migrate_links(links: &[String], trusted_clusters: &[String]) -> bool {
    !links.is_empty() && trusted_clusters.is_empty()
}

/// Whether the update turns on the OpenEBS storage provider.
pub const fn should_enable_openebs(installed: &Manifest, target: &Manifest) -> bool {
    target.openebs_enabled && !installed.openebs_enabled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ServerRole;
    use crate::package::{Label, PackageCatalog, PackageManifest};

    fn planet(version: &str) -> Locator {
        Locator::new("gravitational.io", "planet", version)
    }

    fn with_etcd(locator: &Locator, etcd: &str) -> PackageManifest {
        PackageManifest {
            locator: locator.clone(),
            labels: vec![Label {
                name: ETCD_VERSION_LABEL.to_string(),
                value: etcd.to_string(),
            }],
        }
    }

    fn runtime(locator: &Locator) -> Manifest {
        Manifest {
            runtime_package: Some(locator.clone()),
            ..Default::default()
        }
    }

    #[test]
    fn test_servers_of() {
        let update = UpdateServer {
            server: Server {
                hostname: "master-1".to_string(),
                advertise_ip: "10.0.0.1".to_string(),
                role: ServerRole::Master,
            },
            runtime: None,
        };
        let servers = servers_of([&update]);
        assert_eq!(servers, vec![update.server.clone()]);
        assert!(servers_of(std::iter::empty()).is_empty());
    }

    #[test]
    fn test_supports_taints() {
        let gravity = |v: &str| Locator::new("gravitational.io", "gravity", v);
        assert!(!supports_taints(&gravity("5.3.9")).unwrap());
        assert!(supports_taints(&gravity("5.4.0")).unwrap());
        assert!(supports_taints(&gravity("6.1.2")).unwrap());
        assert!(!supports_taints(&gravity("5.4.0-alpha.1")).unwrap());
        assert!(supports_taints(&gravity("nope")).is_err());
    }

    #[test]
    fn test_should_update_etcd_older_installed() {
        let (old, new) = (planet("5.5.0"), planet("6.0.0"));
        let catalog =
            PackageCatalog::new([with_etcd(&old, "v3.3.4"), with_etcd(&new, "v3.3.11")]);
        let result = should_update_etcd(&runtime(&old), &runtime(&new), &catalog).unwrap();
        assert_eq!(
            result,
            EtcdUpgrade {
                update: true,
                installed_version: Some("3.3.4".to_string()),
                target_version: "3.3.11".to_string(),
            }
        );
    }

    #[test]
    fn test_should_update_etcd_same_version() {
        let (old, new) = (planet("5.5.0"), planet("5.5.1"));
        let catalog =
            PackageCatalog::new([with_etcd(&old, "v3.3.11"), with_etcd(&new, "3.3.11")]);
        let result = should_update_etcd(&runtime(&old), &runtime(&new), &catalog).unwrap();
        assert!(!result.update);
        assert_eq!(result.installed_version.as_deref(), Some("3.3.11"));
    }

    #[test]
    fn test_should_update_etcd_missing_installed_label() {
        let (old, new) = (planet("5.0.0"), planet("6.0.0"));
        let catalog = PackageCatalog::new([
            PackageManifest {
                locator: old.clone(),
                labels: vec![],
            },
            with_etcd(&new, "v3.3.11"),
        ]);
        let result = should_update_etcd(&runtime(&old), &runtime(&new), &catalog).unwrap();
        assert!(result.update);
        assert_eq!(result.installed_version, None);
        assert_eq!(result.target_version, "3.3.11");
    }

    #[test]
    fn test_should_update_etcd_missing_target_label() {
        let (old, new) = (planet("5.5.0"), planet("6.0.0"));
        let catalog = PackageCatalog::new([
            with_etcd(&old, "v3.3.4"),
            PackageManifest {
                locator: new.clone(),
                labels: vec![],
            },
        ]);
        let err = should_update_etcd(&runtime(&old), &runtime(&new), &catalog).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_should_update_etcd_legacy_planet_master() {
        let legacy = Locator::new("gravitational.io", LEGACY_PLANET_MASTER, "0.1.0");
        let new = planet("6.0.0");
        let installed = Manifest {
            dependencies: vec![legacy.clone()],
            ..Default::default()
        };
        let catalog =
            PackageCatalog::new([with_etcd(&legacy, "v2.3.8"), with_etcd(&new, "v3.3.11")]);
        let result = should_update_etcd(&installed, &runtime(&new), &catalog).unwrap();
        assert!(result.update);
        assert_eq!(result.installed_version.as_deref(), Some("2.3.8"));
    }

    #[test]
    fn test_should_update_etcd_no_runtime_package() {
        let new = planet("6.0.0");
        let catalog = PackageCatalog::new([with_etcd(&new, "v3.3.11")]);
        let err = should_update_etcd(&Manifest::default(), &runtime(&new), &catalog).unwrap_err();
        assert_eq!(err.to_string(), "Not found: runtime package not found");
    }

    #[test]
    fn test_should_update_etcd_bad_label() {
        let (old, new) = (planet("5.5.0"), planet("6.0.0"));
        let catalog =
            PackageCatalog::new([with_etcd(&old, "three"), with_etcd(&new, "v3.3.11")]);
        let err = should_update_etcd(&runtime(&old), &runtime(&new), &catalog).unwrap_err();
        assert!(matches!(err, CuoError::InvalidVersion(_)));
    }

    #[test]
    fn test_need_migrate_roles() {
        let role = |version: &str| ClusterRole {
            name: "admin".to_string(),
            version: version.to_string(),
        };
        assert!(!need_migrate_roles(&[]));
        assert!(!need_migrate_roles(&[role("v3")]));
        assert!(need_migrate_roles(&[role("v3"), role("v2")]));
    }

    #[test]
    fn test_need_migrate_links() {
        let links = vec!["hub.example.com".to_string()];
        assert!(need_migrate_links(&links, &[]));
        assert!(!need_migrate_links(&links, &["hub".to_string()]));
        assert!(!need_migrate_links(&[], &[]));
    }

    #[test]
    fn test_should_enable_openebs() {
        let enabled = Manifest {
            openebs_enabled: true,
            ..Default::default()
        };
        assert!(should_enable_openebs(&Manifest::default(), &enabled));
        assert!(!should_enable_openebs(&enabled, &enabled));
        assert!(!should_enable_openebs(&Manifest::default(), &Manifest::default()));
    }
}
