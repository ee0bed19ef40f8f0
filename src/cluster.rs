//! Cluster servers and update topology.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CuoError;
use crate::package::Locator;

/// Role a server plays in the cluster.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    Master,
    Node,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// A cluster server.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub hostname: String,
    pub advertise_ip: String,
    pub role: ServerRole,
}

impl Server {
    pub fn is_master(&self) -> bool {
        self.role == ServerRole::Master
    }

    /// Name of the Kubernetes node backing this server.
    pub fn node_name(&self) -> &str {
        &self.hostname
    }
}

/// Installed and target version of a package.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PackageUpdate {
    pub installed: Locator,
    pub update: Locator,
}

/// A server participating in the update, with its runtime package transition.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServer {
    #[serde(flatten)]
    pub server: Server,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<PackageUpdate>,
}

impl UpdateServer {
    pub fn hostname(&self) -> &str {
        &self.server.hostname
    }
}

/// Servers of an update, split by the order in which they are upgraded.
#[derive(Clone, Debug)]
pub struct Topology {
    /// Master upgraded first; it holds leadership for the rest of the operation.
    pub lead_master: UpdateServer,
    pub other_masters: Vec<UpdateServer>,
    pub workers: Vec<UpdateServer>,
}

impl Topology {
    /// Split the fleet into lead master, other masters and workers.
    ///
    /// The lead master is the named one if given, otherwise the first master
    /// in fleet order.
    pub fn new(servers: &[UpdateServer], lead_master: Option<&str>) -> Result<Self, CuoError> {
        if servers.is_empty() {
            return Err(CuoError::InvalidTopology("no servers".to_string()));
        }

        let mut seen = HashSet::new();
        for server in servers {
            if server.hostname().is_empty() {
                return Err(CuoError::InvalidTopology(
                    "server with empty hostname".to_string(),
                ));
            }
            if server.hostname().contains('/') {
                return Err(CuoError::InvalidTopology(format!(
                    "hostname {} contains '/'",
                    server.hostname()
                )));
            }
            if !seen.insert(server.hostname()) {
                return Err(CuoError::InvalidTopology(format!(
                    "duplicate server {}",
                    server.hostname()
                )));
            }
        }

        let (masters, workers): (Vec<_>, Vec<_>) =
            servers.iter().cloned().partition(|s| s.server.is_master());

        let lead_index = match lead_master {
            Some(name) => masters
                .iter()
                .position(|m| m.hostname() == name)
                .ok_or_else(|| {
                    CuoError::InvalidTopology(format!("lead master {name} is not a master"))
                })?,
            None if masters.is_empty() => {
                return Err(CuoError::InvalidTopology("no master servers".to_string()));
            }
            None => 0,
        };

        let mut other_masters = masters;
        let lead_master = other_masters.remove(lead_index);

        Ok(Self {
            lead_master,
            other_masters,
            workers,
        })
    }

    /// All masters, lead master first.
    pub fn masters(&self) -> impl Iterator<Item = &UpdateServer> {
        std::iter::once(&self.lead_master).chain(self.other_masters.iter())
    }
}
