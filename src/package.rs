//! Package locators, application manifests and manifest lookup.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CuoError;

/// Name of the package that carries the baseline RBAC configuration.
/// It must be updated before any other runtime package.
pub const BOOTSTRAP_CONFIG_PACKAGE: &str = "rbac-app";

/// Name of the runtime package used by installs that predate default runtime packages.
pub const LEGACY_PLANET_MASTER: &str = "planet-master";

/// Package manifest label carrying the bundled etcd version.
pub const ETCD_VERSION_LABEL: &str = "version-etcd";

/// Package locator in `repository/name:version` form.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Locator {
    pub repository: String,
    pub name: String,
    pub version: String,
}

impl Locator {
    pub fn new(
        repository: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse the locator version as a semantic version (a leading `v` is accepted).
    pub fn semver(&self) -> Result<semver::Version, CuoError> {
        parse_semver(&self.version)
    }
}

/// Parse a version string, tolerating the `v` prefix used by package labels.
pub fn parse_semver(version: &str) -> Result<semver::Version, CuoError> {
    semver::Version::parse(version.trim_start_matches('v'))
        .map_err(|e| CuoError::InvalidVersion(format!("{version}: {e}")))
}

impl FromStr for Locator {
    type Err = CuoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CuoError::InvalidLocator(s.to_string());

        let (path, version) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (repository, name) = path.rsplit_once('/').ok_or_else(invalid)?;
        if repository.is_empty() || name.is_empty() || version.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(repository, name, version))
    }
}

impl TryFrom<String> for Locator {
    type Error = CuoError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Locator> for String {
    fn from(locator: Locator) -> Self {
        locator.to_string()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.repository, self.name, self.version)
    }
}

/// Application lifecycle hooks declared by a manifest.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hooks {
    /// Job run before the update starts touching nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_update: Option<String>,
}

/// Application or runtime manifest.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Runtime (system container) package shipped with this application.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_package: Option<Locator>,

    /// Package dependencies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Locator>,

    #[serde(default)]
    pub hooks: Hooks,

    /// Whether the OpenEBS storage provider is enabled.
    #[serde(default)]
    pub openebs_enabled: bool,
}

impl Manifest {
    /// Default runtime package, or `NotFound` when the manifest predates it.
    pub fn default_runtime_package(&self) -> Result<&Locator, CuoError> {
        self.runtime_package
            .as_ref()
            .ok_or_else(|| CuoError::NotFound("default runtime package".to_string()))
    }

    /// Look up a dependency by package name.
    pub fn dependency(&self, name: &str) -> Result<&Locator, CuoError> {
        self.dependencies
            .iter()
            .find(|dep| dep.name == name)
            .ok_or_else(|| CuoError::NotFound(format!("dependency {name}")))
    }

    pub const fn has_pre_update_hook(&self) -> bool {
        self.hooks.pre_update.is_some()
    }
}

/// An application package together with its manifest.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub package: Locator,
    #[serde(default)]
    pub manifest: Manifest,
}

/// Manifest label.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Stored package metadata.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    pub locator: Locator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<Label>,
}

impl PackageManifest {
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|label| label.name == name)
            .map(|label| label.value.as_str())
    }
}

/// Read access to package metadata.
pub trait PackageService {
    /// Returns the manifest of the given package, or `NotFound`.
    fn manifest(&self, locator: &Locator) -> Result<PackageManifest, CuoError>;
}

/// In-memory package metadata, loaded from the cluster snapshot.
#[derive(Clone, Debug, Default)]
pub struct PackageCatalog {
    manifests: HashMap<Locator, PackageManifest>,
}

impl PackageCatalog {
    pub fn new(manifests: impl IntoIterator<Item = PackageManifest>) -> Self {
        Self {
            manifests: manifests
                .into_iter()
                .map(|m| (m.locator.clone(), m))
                .collect(),
        }
    }
}

impl PackageService for PackageCatalog {
    fn manifest(&self, locator: &Locator) -> Result<PackageManifest, CuoError> {
        self.manifests
            .get(locator)
            .cloned()
            .ok_or_else(|| CuoError::NotFound(format!("package {locator}")))
    }
}
