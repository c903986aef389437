//! Node-level fault operations
//!
//! Cordon and uncordon are strategic-merge patches of the node's
//! `spec.unschedulable` flag. A drain cordons the node and then evicts every
//! eligible pod on it in parallel; a simulated crash cordons and
//! force-deletes every pod, eligible or not, with no grace period.

use futures::future::join_all;
use k8s_openapi::api::core::v1::{Node, Pod};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::gateway::{ClusterGateway, DeleteOptions};
use crate::pods;
use crate::{Error, Result};

/// Annotation that marks a static mirror pod
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// Mark the node unschedulable
pub async fn cordon<G: ClusterGateway + ?Sized>(gateway: &G, name: &str) -> Result<()> {
    info!(node = %name, "cordoning node");
    gateway.set_node_unschedulable(name, true).await
}

/// Mark the node schedulable again
pub async fn uncordon<G: ClusterGateway + ?Sized>(gateway: &G, name: &str) -> Result<()> {
    info!(node = %name, "uncordoning node");
    gateway.set_node_unschedulable(name, false).await
}

/// Whether the node is currently cordoned
pub async fn is_cordoned<G: ClusterGateway + ?Sized>(gateway: &G, name: &str) -> Result<bool> {
    let node = gateway.get_node(name).await?;
    Ok(node
        .spec
        .as_ref()
        .and_then(|spec| spec.unschedulable)
        .unwrap_or(false))
}

/// Drain the node: cordon it, then evict every eligible pod in parallel.
///
/// DaemonSet-owned pods and mirror pods are skipped. Per-pod failures are
/// collected into [`Error::Drain`]; partial progress is not rolled back and
/// the node stays cordoned either way.
pub async fn drain<G: ClusterGateway + ?Sized>(
    gateway: &G,
    shutdown: &CancellationToken,
    name: &str,
    options: &DeleteOptions,
) -> Result<()> {
    cordon(gateway, name).await?;

    let targets: Vec<(String, String)> = gateway
        .pods_on_node(name)
        .await?
        .iter()
        .filter(|pod| is_evictable(pod))
        .filter_map(pod_key)
        .collect();

    let evictions = targets.iter().map(|(namespace, pod)| {
        pods::evict_pod(gateway, shutdown, namespace, pod, options)
    });
    collect_failures(join_all(evictions).await)
}

/// Simulate an abrupt node loss: cordon, then force-delete every pod on the
/// node with no grace period, bypassing disruption budgets.
///
/// Unlike [`drain`] this targets ALL pods, including DaemonSet-owned and
/// mirror pods.
pub async fn simulate_crash<G: ClusterGateway + ?Sized>(
    gateway: &G,
    shutdown: &CancellationToken,
    name: &str,
    options: &DeleteOptions,
) -> Result<()> {
    cordon(gateway, name).await?;

    let targets: Vec<(String, String)> = gateway
        .pods_on_node(name)
        .await?
        .iter()
        .filter_map(pod_key)
        .collect();

    let deletions = targets.iter().map(|(namespace, pod)| {
        pods::delete_pod(gateway, shutdown, namespace, pod, options)
    });
    collect_failures(join_all(deletions).await)
}

/// Whether a drain may evict this pod.
///
/// DaemonSet controllers ignore cordons, so evicting their pods only fights
/// the controller; mirror pods are static and cannot be controlled at all.
pub fn is_evictable(pod: &Pod) -> bool {
    let daemon_owned = pod
        .metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
        });
    if daemon_owned {
        return false;
    }

    !pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|annotations| annotations.contains_key(MIRROR_POD_ANNOTATION))
}

/// Snapshot the names of nodes the planner may target.
///
/// A node is usable iff it is schedulable, untainted and Ready. The snapshot
/// is taken once at startup and never re-evaluated.
pub fn usable_nodes(nodes: &[Node]) -> Vec<String> {
    nodes
        .iter()
        .filter_map(|node| {
            let name = node.metadata.name.clone()?;

            if let Some(spec) = node.spec.as_ref() {
                if spec.unschedulable.unwrap_or(false) {
                    info!(node = %name, "cannot use node, unschedulable");
                    return None;
                }
                if !spec.taints.as_deref().unwrap_or_default().is_empty() {
                    info!(node = %name, "cannot use node, tainted");
                    return None;
                }
            }

            let ready = node
                .status
                .as_ref()
                .and_then(|status| status.conditions.as_ref())
                .is_some_and(|conditions| {
                    conditions
                        .iter()
                        .any(|c| c.type_ == "Ready" && c.status == "True")
                });
            if !ready {
                info!(node = %name, "cannot use node, not ready");
                return None;
            }

            info!(node = %name, "using node");
            Some(name)
        })
        .collect()
}

fn pod_key(pod: &Pod) -> Option<(String, String)> {
    Some((pod.metadata.namespace.clone()?, pod.metadata.name.clone()?))
}

fn collect_failures(results: Vec<Result<()>>) -> Result<()> {
    let failures: Vec<Error> = results.into_iter().filter_map(|r| r.err()).collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Drain(failures))
    }
}
