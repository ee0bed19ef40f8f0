//! Immutable cluster snapshot: the only input of plan construction.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cluster::UpdateServer;
use crate::package::{Application, Locator, PackageCatalog, PackageManifest};

/// Installed application and runtime.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InstalledRelease {
    pub app: Application,
    pub runtime: Application,
}

/// Target application and runtime.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TargetRelease {
    pub app: Application,
    pub runtime: Application,
    /// Cluster management (gravity) package the nodes are upgraded to.
    pub gravity_package: Locator,
}

/// Cluster role resource, as stored by the cluster.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRole {
    pub name: String,
    /// Resource format version (e.g. `v3`).
    pub version: String,
}

/// Snapshot of cluster topology, manifests and migration facts.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSnapshot {
    pub cluster_name: String,

    /// Fleet participating in the update.
    pub servers: Vec<UpdateServer>,

    /// Hostname of the master to upgrade first (defaults to the first master).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead_master: Option<String>,

    pub installed: InstalledRelease,
    pub target: TargetRelease,

    /// Package metadata used for version label lookups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<PackageManifest>,

    /// Application packages to update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub app_updates: Vec<Locator>,

    /// Runtime (system application) packages to update.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub runtime_updates: Vec<Locator>,

    /// Legacy remote hub links.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_clusters: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<ClusterRole>,

    /// Node labels already match the target release.
    #[serde(default)]
    pub labels_current: bool,

    /// Configure SELinux on nodes before bootstrapping them.
    #[serde(default)]
    pub selinux: bool,

    /// Cluster DNS resources are missing and must be provisioned before masters restart.
    #[serde(default)]
    pub dns_resources_missing: bool,

    /// DNS application deployed ahead of the rolling restarts, for runtimes
    /// that no longer embed cluster DNS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_dns_app: Option<Locator>,
}

impl ClusterSnapshot {
    /// Load a snapshot from a YAML (or JSON) file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse snapshot {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Package metadata catalog built from the snapshot.
    pub fn catalog(&self) -> PackageCatalog {
        PackageCatalog::new(self.packages.iter().cloned())
    }
}
