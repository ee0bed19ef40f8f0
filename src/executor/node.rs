//! Kubernetes node operations: drain, cordon, taints and DNS endpoint checks.

use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{Endpoints, Node, Pod, Taint};
use kube::Api;
use kube::api::{EvictParams, ListParams, Patch, PatchParams};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{Executor, PhaseContext};
use crate::error::CuoError;
use crate::plan::PhaseKind;

/// Taint keeping regular workloads off a node while it is upgraded.
pub const RUNLEVEL_TAINT_KEY: &str = "gravitational.io/runlevel";
pub const RUNLEVEL_TAINT_VALUE: &str = "system";
pub const RUNLEVEL_TAINT_EFFECT: &str = "NoExecute";

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";
const DNS_NAMESPACE: &str = "kube-system";
const DNS_SERVICE: &str = "kube-dns";
const FIELD_MANAGER: &str = "cuo";

/// Interval between polls while waiting on pods or endpoints.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Performs node phases against the Kubernetes API.
pub struct KubeNodeExecutor {
    client: kube::Client,
    poll_interval: Duration,
}

impl KubeNodeExecutor {
    pub const fn new(client: kube::Client) -> Self {
        Self {
            client,
            poll_interval: POLL_INTERVAL,
        }
    }

    async fn run(&self, ctx: &PhaseContext, kind: PhaseKind) -> Result<(), CuoError> {
        let node = ctx.target_server()?.node_name();
        match kind {
            PhaseKind::Drain => self.drain(node).await,
            PhaseKind::Uncordon => self.set_unschedulable(node, false).await,
            PhaseKind::Taint => self.update_taints(node, true).await,
            PhaseKind::Untaint => self.update_taints(node, false).await,
            PhaseKind::Endpoints => self.wait_for_endpoints(node).await,
            other => Err(CuoError::Executor(
                ctx.path.clone(),
                format!("{other} is not a node operation"),
            )),
        }
    }

    async fn set_unschedulable(&self, node: &str, unschedulable: bool) -> Result<(), CuoError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let patch = json!({ "spec": { "unschedulable": unschedulable } });
        nodes
            .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| CuoError::kube(&format!("patch node {node}"), e))?;
        info!(node, unschedulable, "Updated node schedulability");
        Ok(())
    }

    /// Cordon the node, evict its workloads and wait until they are gone.
    async fn drain(&self, node: &str) -> Result<(), CuoError> {
        self.set_unschedulable(node, true).await?;

        let pending = self.evictable_pods(node).await?;
        info!(node, pods = pending.len(), "Evicting pods");
        for pod in &pending {
            let (namespace, name) = pod_key(pod);
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
            if let Err(e) = pods.evict(name, &EvictParams::default()).await {
                // Pods may terminate between listing and eviction.
                let gone = pods.get_opt(name).await.is_ok_and(|p| p.is_none());
                if !gone {
                    return Err(CuoError::kube(&format!("evict {namespace}/{name}"), e));
                }
            } else {
                debug!(node, pod = name, namespace, "Evicted pod");
            }
        }

        loop {
            let remaining = self.evictable_pods(node).await?;
            if remaining.is_empty() {
                info!(node, "Node drained");
                return Ok(());
            }
            debug!(node, remaining = remaining.len(), "Waiting for pods to terminate");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn evictable_pods(&self, node: &str) -> Result<Vec<Pod>, CuoError> {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = pods
            .list(&params)
            .await
            .map_err(|e| CuoError::kube(&format!("list pods on {node}"), e))?;
        Ok(list.items.into_iter().filter(should_evict).collect())
    }

    async fn update_taints(&self, node: &str, present: bool) -> Result<(), CuoError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let current = nodes
            .get(node)
            .await
            .map_err(|e| CuoError::kube(&format!("get node {node}"), e))?;
        let taints = current
            .spec
            .and_then(|spec| spec.taints)
            .unwrap_or_default();
        let taints = if present {
            with_runlevel_taint(taints)
        } else {
            without_runlevel_taint(taints)
        };

        let patch = json!({ "spec": { "taints": taints } });
        nodes
            .patch(node, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await
            .map_err(|e| CuoError::kube(&format!("patch taints on {node}"), e))?;
        info!(node, tainted = present, "Updated node taints");
        Ok(())
    }

    async fn wait_for_endpoints(&self, node: &str) -> Result<(), CuoError> {
        let endpoints: Api<Endpoints> = Api::namespaced(self.client.clone(), DNS_NAMESPACE);
        loop {
            match endpoints.get_opt(DNS_SERVICE).await {
                Ok(Some(ep)) if has_ready_addresses(&ep) => {
                    info!(node, "Cluster DNS endpoints are ready");
                    return Ok(());
                }
                Ok(_) => debug!(node, "Waiting for cluster DNS endpoints"),
                Err(e) => warn!(node, error = %e, "Failed to query cluster DNS endpoints"),
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Executor for KubeNodeExecutor {
    fn name(&self) -> &'static str {
        "node"
    }

    fn execute<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        self.run(ctx, ctx.kind).boxed()
    }

    fn rollback<'a>(&'a self, ctx: &'a PhaseContext) -> BoxFuture<'a, Result<(), CuoError>> {
        async move {
            match reverse_of(ctx.kind) {
                Some(PhaseKind::Drain) => {
                    let node = ctx.target_server()?.node_name();
                    self.set_unschedulable(node, true).await
                }
                Some(kind) => self.run(ctx, kind).await,
                None => Ok(()),
            }
        }
        .boxed()
    }
}

/// Kind whose forward action undoes `kind`. `Drain` stands for a plain cordon.
pub const fn reverse_of(kind: PhaseKind) -> Option<PhaseKind> {
    match kind {
        PhaseKind::Drain => Some(PhaseKind::Uncordon),
        PhaseKind::Uncordon => Some(PhaseKind::Drain),
        PhaseKind::Taint => Some(PhaseKind::Untaint),
        PhaseKind::Untaint => Some(PhaseKind::Taint),
        _ => None,
    }
}

fn pod_key(pod: &Pod) -> (&str, &str) {
    (
        pod.metadata.namespace.as_deref().unwrap_or("default"),
        pod.metadata.name.as_deref().unwrap_or_default(),
    )
}

/// Pods a drain must evict: everything except DaemonSet, mirror and finished pods.
pub fn should_evict(pod: &Pod) -> bool {
    let owned_by_daemonset = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.kind == "DaemonSet"));
    let mirror = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION));
    let finished = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded" || phase == "Failed");
    !(owned_by_daemonset || mirror || finished)
}

fn is_runlevel_taint(taint: &Taint) -> bool {
    taint.key == RUNLEVEL_TAINT_KEY && taint.effect == RUNLEVEL_TAINT_EFFECT
}

/// Add the runlevel taint unless already present.
pub fn with_runlevel_taint(mut taints: Vec<Taint>) -> Vec<Taint> {
    if !taints.iter().any(is_runlevel_taint) {
        taints.push(Taint {
            key: RUNLEVEL_TAINT_KEY.to_string(),
            value: Some(RUNLEVEL_TAINT_VALUE.to_string()),
            effect: RUNLEVEL_TAINT_EFFECT.to_string(),
            ..Default::default()
        });
    }
    taints
}

pub fn without_runlevel_taint(taints: Vec<Taint>) -> Vec<Taint> {
    taints.into_iter().filter(|t| !is_runlevel_taint(t)).collect()
}

pub fn has_ready_addresses(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .as_ref()
        .is_some_and(|subsets| {
            subsets
                .iter()
                .any(|s| s.addresses.as_ref().is_some_and(|a| !a.is_empty()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;

    fn pod(owner_kind: Option<&str>, annotations: &[(&str, &str)], phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("p".to_string()),
                namespace: Some("default".to_string()),
                owner_references: owner_kind.map(|kind| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: "owner".to_string(),
                        ..Default::default()
                    }]
                }),
                annotations: (!annotations.is_empty()).then(|| {
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>()
                }),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_should_evict() {
        assert!(should_evict(&pod(Some("ReplicaSet"), &[], "Running")));
        assert!(should_evict(&pod(None, &[], "Pending")));
        assert!(!should_evict(&pod(Some("DaemonSet"), &[], "Running")));
        assert!(!should_evict(&pod(None, &[(MIRROR_POD_ANNOTATION, "x")], "Running")));
        assert!(!should_evict(&pod(Some("Job"), &[], "Succeeded")));
    }

    #[test]
    fn test_runlevel_taint_added_once() {
        let existing = Taint {
            key: "dedicated".to_string(),
            effect: "NoSchedule".to_string(),
            ..Default::default()
        };
        let taints = with_runlevel_taint(vec![existing.clone()]);
        assert_eq!(taints.len(), 2);
        assert_eq!(taints[1].key, RUNLEVEL_TAINT_KEY);
        assert_eq!(taints[1].value.as_deref(), Some("system"));

        let taints = with_runlevel_taint(taints);
        assert_eq!(taints.len(), 2);

        let taints = without_runlevel_taint(taints);
        assert_eq!(taints, vec![existing]);
    }

    #[test]
    fn test_has_ready_addresses() {
        let empty = Endpoints::default();
        assert!(!has_ready_addresses(&empty));

        let not_ready = Endpoints {
            subsets: Some(vec![EndpointSubset::default()]),
            ..Default::default()
        };
        assert!(!has_ready_addresses(&not_ready));

        let ready = Endpoints {
            subsets: Some(vec![EndpointSubset {
                addresses: Some(vec![EndpointAddress {
                    ip: "10.244.0.5".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }]),
            ..Default::default()
        };
        assert!(has_ready_addresses(&ready));
    }

    #[test]
    fn test_reverse_of() {
        assert_eq!(reverse_of(PhaseKind::Drain), Some(PhaseKind::Uncordon));
        assert_eq!(reverse_of(PhaseKind::Uncordon), Some(PhaseKind::Drain));
        assert_eq!(reverse_of(PhaseKind::Taint), Some(PhaseKind::Untaint));
        assert_eq!(reverse_of(PhaseKind::Untaint), Some(PhaseKind::Taint));
        assert_eq!(reverse_of(PhaseKind::Endpoints), None);
    }
}
