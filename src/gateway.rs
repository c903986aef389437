//! Capability interface over the Kubernetes API
//!
//! Every cluster interaction the agent performs goes through the
//! [`ClusterGateway`] trait so tests can substitute an in-memory fake while
//! production uses [`KubeGateway`] over a real client.

use async_trait::async_trait;
use futures::{pin_mut, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, EvictParams, ListParams, Patch, PatchParams, WatchParams};
use kube::core::WatchEvent;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::crd::ArangoDeployment;
use crate::{Error, Result};

/// Grace-period options for pod deletion and eviction
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Grace period in seconds; `None` keeps the pod's own terminationGracePeriodSeconds
    pub grace_period_seconds: Option<u32>,
}

impl DeleteOptions {
    /// Options with an explicit grace period
    pub fn with_grace_period(seconds: u32) -> Self {
        Self {
            grace_period_seconds: Some(seconds),
        }
    }

    /// Options for a forced removal with no grace period
    pub fn immediate() -> Self {
        Self::with_grace_period(0)
    }

    fn delete_params(&self) -> DeleteParams {
        let mut params = DeleteParams::default();
        params.grace_period_seconds = self.grace_period_seconds;
        params
    }

    fn evict_params(&self) -> EvictParams {
        let mut params = EvictParams::default();
        params.delete_options = Some(self.delete_params());
        params
    }
}

/// Event forwarded from a single-pod watch
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PodEvent {
    /// The pod was deleted
    Deleted,
    /// Anything else (added, modified, bookmark)
    Other,
}

/// Receiving end of a single-pod watch.
///
/// The watch is established before any mutating request is issued so the
/// deletion event cannot be lost between submission and watch attachment.
/// When the channel yields `None` the underlying watch has terminated.
pub struct PodWatch {
    rx: mpsc::Receiver<PodEvent>,
}

impl PodWatch {
    pub(crate) fn new(rx: mpsc::Receiver<PodEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the watch has closed
    pub async fn next(&mut self) -> Option<PodEvent> {
        self.rx.recv().await
    }

    /// A watch that yields the given events and then closes
    #[cfg(test)]
    pub fn preloaded(events: impl IntoIterator<Item = PodEvent>) -> Self {
        let events: Vec<PodEvent> = events.into_iter().collect();
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            tx.try_send(event).expect("preloaded channel has capacity");
        }
        Self { rx }
    }

    /// A watch that never yields and never closes
    #[cfg(test)]
    pub fn pending() -> Self {
        let (tx, rx) = mpsc::channel(1);
        std::mem::forget(tx);
        Self { rx }
    }
}

/// Narrow capability set over the cluster API.
///
/// Real traffic goes through [`KubeGateway`]; tests use the generated
/// `MockClusterGateway`.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Read a single node
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Patch the node's `spec.unschedulable` flag (strategic merge)
    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()>;

    /// List the pods of one namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>>;

    /// List the pods scheduled onto the given node, across all namespaces
    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>>;

    /// Read a single pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    /// Open a field-selected watch for a single pod
    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatch>;

    /// Delete a pod
    async fn delete_pod(&self, namespace: &str, name: &str, options: &DeleteOptions) -> Result<()>;

    /// Create an eviction for a pod through the eviction subresource
    async fn evict_pod(&self, namespace: &str, name: &str, options: &DeleteOptions) -> Result<()>;

    /// List the ArangoDeployments of one namespace
    async fn list_deployments(&self, namespace: &str) -> Result<Vec<ArangoDeployment>>;

    /// Read a single ArangoDeployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<ArangoDeployment>;

    /// List the services of one namespace
    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>>;

    /// Read the JWT signing token from the named secret
    async fn token_secret(&self, namespace: &str, name: &str) -> Result<Vec<u8>>;
}

/// Real gateway over a kube client
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    /// Create a gateway wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .nodes()
            .list(&ListParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes().get(name).await.map_err(Error::from_kube)
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        let patch = serde_json::json!({"spec": {"unschedulable": unschedulable}});
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await
            .map_err(Error::from_kube)?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>> {
        let list = self
            .pods(namespace)
            .list(&ListParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(list.items)
    }

    async fn pods_on_node(&self, node: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={node}"));
        let list = api.list(&params).await.map_err(Error::from_kube)?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace).get(name).await.map_err(Error::from_kube)
    }

    async fn watch_pod(&self, namespace: &str, name: &str) -> Result<PodWatch> {
        let params = WatchParams::default().fields(&format!("metadata.name={name}"));
        let stream = self
            .pods(namespace)
            .watch(&params, "0")
            .await
            .map_err(Error::from_kube)?;

        let (tx, rx) = mpsc::channel(16);
        let pod = format!("{namespace}/{name}");
        tokio::spawn(async move {
            pin_mut!(stream);
            while let Some(event) = stream.next().await {
                let forwarded = match event {
                    Ok(WatchEvent::Deleted(_)) => PodEvent::Deleted,
                    Ok(_) => PodEvent::Other,
                    Err(error) => {
                        debug!(pod = %pod, error = %error, "pod watch stream error");
                        break;
                    }
                };
                if tx.send(forwarded).await.is_err() {
                    break;
                }
            }
        });

        Ok(PodWatch::new(rx))
    }

    async fn delete_pod(&self, namespace: &str, name: &str, options: &DeleteOptions) -> Result<()> {
        self.pods(namespace)
            .delete(name, &options.delete_params())
            .await
            .map_err(Error::from_kube)?;
        Ok(())
    }

    async fn evict_pod(&self, namespace: &str, name: &str, options: &DeleteOptions) -> Result<()> {
        self.pods(namespace)
            .evict(name, &options.evict_params())
            .await
            .map_err(Error::from_kube)?;
        Ok(())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<ArangoDeployment>> {
        let api: Api<ArangoDeployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(list.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<ArangoDeployment> {
        let api: Api<ArangoDeployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(Error::from_kube)
    }

    async fn list_services(&self, namespace: &str) -> Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(list.items)
    }

    async fn token_secret(&self, namespace: &str, name: &str) -> Result<Vec<u8>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api.get(name).await.map_err(Error::from_kube)?;
        let data = secret.data.unwrap_or_default();
        let token = data.get("token").ok_or_else(|| {
            Error::token(format!("secret {namespace}/{name} has no `token` field"))
        })?;
        Ok(token.0.clone())
    }
}
