//! Deployment readiness and replication-sync verification
//!
//! The probe is read-only with respect to cluster state. For every
//! deployment it re-reads the custom resource, requires full membership and
//! the Running phase, checks every member and its backing pod for readiness,
//! and finally verifies replication sync through a direct database
//! connection. Each per-deployment pass retries on a fixed 3 second cadence
//! until it succeeds or is cancelled; the controller puts a 60 second budget
//! around the whole pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::crd::DeploymentPhase;
use crate::db::{database_endpoint, DatabaseClient, ServerStatus};
use crate::gateway::ClusterGateway;
use crate::retry::retry_every;
use crate::token::TokenIssuer;
use crate::{Error, Result, READINESS_RETRY_INTERVAL};

/// Readiness verdict over all observed deployments
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Block until every deployment is ready and in sync, retrying
    /// internally, or until the shutdown token fires
    async fn deployments_ready(&self, shutdown: &CancellationToken) -> Result<()>;
}

/// Replication-sync verdict for one deployment
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SyncProbe: Send + Sync {
    /// Verify the deployment's members and collections are in sync
    async fn verify(&self, deployment: &str) -> Result<()>;
}

/// Readiness probe over the deployments enumerated at startup
pub struct HealthProbe {
    gateway: Arc<dyn ClusterGateway>,
    sync: Arc<dyn SyncProbe>,
    namespace: String,
    deployments: Vec<String>,
    interval: Duration,
}

impl HealthProbe {
    /// Create a probe for the given deployment names
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        sync: Arc<dyn SyncProbe>,
        namespace: String,
        deployments: Vec<String>,
    ) -> Self {
        Self {
            gateway,
            sync,
            namespace,
            deployments,
            interval: READINESS_RETRY_INTERVAL,
        }
    }

    async fn check_deployment(&self, name: &str) -> Result<()> {
        let deployment = self.gateway.get_deployment(&self.namespace, name).await?;
        let status = deployment.status.clone().unwrap_or_default();
        let spec = &deployment.spec;

        if status.members.agents.len() != spec.agents.count() as usize {
            return Err(Error::not_ready(format!("missing agents: {name}")));
        }
        if status.members.dbservers.len() != spec.dbservers.count() as usize {
            return Err(Error::not_ready(format!("missing dbservers: {name}")));
        }
        if status.members.coordinators.len() != spec.coordinators.count() as usize {
            return Err(Error::not_ready(format!("missing coordinators: {name}")));
        }

        if status.phase != DeploymentPhase::Running {
            return Err(Error::not_ready(format!("deployment not running: {name}")));
        }

        for (group, members) in status.members.groups() {
            for member in members {
                if !member.is_ready() {
                    return Err(Error::not_ready(format!(
                        "member not ready: {name}/{}",
                        member.id
                    )));
                }

                let pod_name = member.pod_name.as_deref().ok_or_else(|| {
                    Error::not_ready(format!("member has no pod: {name}/{group}/{}", member.id))
                })?;
                let pod = self.gateway.get_pod(&self.namespace, pod_name).await?;
                if !pod_is_ready(&pod) {
                    return Err(Error::not_ready(format!("pod not ready: {pod_name}")));
                }
            }
        }

        self.sync.verify(name).await
    }
}

#[async_trait]
impl HealthCheck for HealthProbe {
    async fn deployments_ready(&self, shutdown: &CancellationToken) -> Result<()> {
        for name in &self.deployments {
            retry_every(self.interval, shutdown, "deployment-ready", || {
                self.check_deployment(name)
            })
            .await?;
            info!(deployment = %name, "deployment ready");
        }
        Ok(())
    }
}

/// Whether the pod reports the Ready condition true
pub fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// First load-balancer ingress IP of a service, if one has been assigned
pub fn load_balancer_ip(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?
        .ip
        .clone()
}

/// Sync probe connecting to the deployment's external-access endpoint
pub struct ClusterSyncProbe {
    gateway: Arc<dyn ClusterGateway>,
    issuer: Arc<dyn TokenIssuer>,
    namespace: String,
    external_services: HashMap<String, Service>,
}

impl ClusterSyncProbe {
    /// Create a sync probe over the startup external-service snapshot
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        issuer: Arc<dyn TokenIssuer>,
        namespace: String,
        external_services: HashMap<String, Service>,
    ) -> Self {
        Self {
            gateway,
            issuer,
            namespace,
            external_services,
        }
    }
}

#[async_trait]
impl SyncProbe for ClusterSyncProbe {
    async fn verify(&self, name: &str) -> Result<()> {
        let deployment = self.gateway.get_deployment(&self.namespace, name).await?;

        let Some(service) = self.external_services.get(name) else {
            return Err(Error::not_in_sync(format!(
                "no external access to deployment {name}"
            )));
        };

        // The load balancer may still be provisioning; defer to the next
        // readiness retry instead of failing.
        let Some(ip) = load_balancer_ip(service) else {
            info!(deployment = %name, "no load balancer ip known yet");
            return Ok(());
        };

        let uses_tls = deployment.spec.tls.uses_tls();
        let endpoint = database_endpoint(uses_tls, &ip);
        let token = self.issuer.bearer_token(&self.namespace, &deployment).await?;
        let client = DatabaseClient::connect(&endpoint, &token, uses_tls)?;

        check_in_sync(&client, name).await
    }
}

/// Walk cluster health and every database inventory, requiring GOOD members
/// and fully synced collections
pub(crate) async fn check_in_sync(client: &DatabaseClient, name: &str) -> Result<()> {
    let health = client.cluster_health().await?;
    for (id, member) in &health.health {
        if member.can_be_deleted {
            debug!(deployment = %name, member = %id, "ignoring member scheduled for removal");
            continue;
        }
        if member.status != ServerStatus::Good {
            return Err(Error::not_in_sync(format!(
                "member status not GOOD: {name}/{id}"
            )));
        }
    }

    for database in client.databases().await? {
        let inventory = client.database_inventory(&database).await?;
        for collection in &inventory.collections {
            if !collection.all_in_sync {
                return Err(Error::not_in_sync(format!(
                    "collection not in sync: {}",
                    collection.parameters.name
                )));
            }
        }
    }

    Ok(())
}
