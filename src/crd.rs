//! Observed subset of the ArangoDeployment custom resource
//!
//! The agent never creates or mutates deployments; it only reads the fields
//! the health probe and the token issuer need. Field names follow the
//! `database.arangodb.com/v1alpha` schema written by the ArangoDB operator.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of an ArangoDeployment, reduced to the fields we observe
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "database.arangodb.com",
    version = "v1alpha",
    kind = "ArangoDeployment",
    plural = "arangodeployments",
    namespaced,
    status = "DeploymentStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Deployment mode (Cluster, Single, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    /// Agency server group
    #[serde(default)]
    pub agents: ServerGroupSpec,

    /// Database server group
    #[serde(default)]
    pub dbservers: ServerGroupSpec,

    /// Coordinator server group
    #[serde(default)]
    pub coordinators: ServerGroupSpec,

    /// Authentication settings, carrying the JWT secret reference
    #[serde(default, rename = "auth")]
    pub authentication: AuthenticationSpec,

    /// TLS settings, carrying the CA secret reference
    #[serde(default)]
    pub tls: TlsSpec,
}

/// Per-group server settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServerGroupSpec {
    /// Desired number of servers in this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
}

impl ServerGroupSpec {
    /// Desired member count; 0 when the operator has not defaulted the field
    pub fn count(&self) -> i32 {
        self.count.unwrap_or(0)
    }
}

/// Authentication settings of a deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticationSpec {
    /// Name of the secret holding the JWT signing token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret_name: Option<String>,
}

impl AuthenticationSpec {
    /// The JWT secret name, if the operator has filled it in
    pub fn secret_name(&self) -> Option<&str> {
        self.jwt_secret_name.as_deref()
    }
}

/// TLS settings of a deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Name of the CA secret. The literal `"None"` disables TLS; any other
    /// value (including an absent one) means the servers speak HTTPS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_secret_name: Option<String>,
}

impl TlsSpec {
    /// Whether the deployment's endpoints require HTTPS.
    ///
    /// The operator uses the sentinel string `"None"` for plaintext
    /// deployments; everything else implies TLS.
    pub fn uses_tls(&self) -> bool {
        self.ca_secret_name.as_deref() != Some("None")
    }
}

/// Status written by the ArangoDB operator
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Lifecycle phase of the deployment
    #[serde(default)]
    pub phase: DeploymentPhase,

    /// Observed members per server group
    #[serde(default)]
    pub members: DeploymentMembers,
}

/// Lifecycle phase of a deployment
#[derive(Clone, Copy, Debug, Default, Serialize, JsonSchema, PartialEq, Eq)]
pub enum DeploymentPhase {
    /// The operator is still creating resources
    Creating,
    /// All members are up and serving
    Running,
    /// The deployment failed permanently
    Failed,
    /// Any phase this agent does not know about
    #[default]
    Unknown,
}

// Hand-written so phases introduced by newer operators deserialize to
// Unknown instead of failing the whole resource.
impl<'de> Deserialize<'de> for DeploymentPhase {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let phase = String::deserialize(deserializer)?;
        Ok(match phase.as_str() {
            "Creating" => DeploymentPhase::Creating,
            "Running" => DeploymentPhase::Running,
            "Failed" => DeploymentPhase::Failed,
            _ => DeploymentPhase::Unknown,
        })
    }
}

/// Observed members, grouped the way the operator reports them
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentMembers {
    /// Agency members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<MemberStatus>,

    /// Database server members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dbservers: Vec<MemberStatus>,

    /// Coordinator members
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coordinators: Vec<MemberStatus>,
}

impl DeploymentMembers {
    /// Iterate over every group with its members
    pub fn groups(&self) -> impl Iterator<Item = (ServerGroup, &[MemberStatus])> {
        [
            (ServerGroup::Agents, self.agents.as_slice()),
            (ServerGroup::DbServers, self.dbservers.as_slice()),
            (ServerGroup::Coordinators, self.coordinators.as_slice()),
        ]
        .into_iter()
    }
}

/// The three server groups of a cluster deployment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerGroup {
    /// Agency servers
    Agents,
    /// Database servers
    DbServers,
    /// Coordinators
    Coordinators,
}

impl std::fmt::Display for ServerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerGroup::Agents => write!(f, "agents"),
            ServerGroup::DbServers => write!(f, "dbservers"),
            ServerGroup::Coordinators => write!(f, "coordinators"),
        }
    }
}

/// One observed member of a server group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MemberStatus {
    /// Member identifier assigned by the operator
    #[serde(default)]
    pub id: String,

    /// Name of the pod backing this member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,

    /// Member conditions as reported by the operator
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<MemberCondition>,
}

impl MemberStatus {
    /// Whether the operator reports this member Ready
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.condition_type == "Ready" && c.status == "True")
    }
}

/// A single condition on a member
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MemberCondition {
    /// Condition type, e.g. `Ready`
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Condition status: `True`, `False` or `Unknown`
    #[serde(default)]
    pub status: String,
}
