//! Thin ArangoDB HTTP driver
//!
//! The sync probe only needs three read endpoints: cluster health, the
//! database list, and the per-database cluster inventory. The client speaks
//! plain HTTP or, for TLS deployments, HTTPS without verifying the server
//! certificate (the operator issues certificates for in-cluster names the
//! agent does not resolve). Redirect following is disabled so coordinator
//! redirects surface as errors instead of silently probing the wrong member.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{Error, Result, DATABASE_PORT};

/// Endpoint for a deployment reachable at `ip`.
///
/// The scheme is HTTPS whenever the deployment's TLS CA secret name is
/// anything but the sentinel `"None"`.
pub fn database_endpoint(uses_tls: bool, ip: &str) -> String {
    let scheme = if uses_tls { "https" } else { "http" };
    format!("{scheme}://{ip}:{DATABASE_PORT}")
}

/// Client for one deployment's coordinator endpoint
pub struct DatabaseClient {
    http: reqwest::Client,
    endpoint: String,
    token: String,
}

impl DatabaseClient {
    /// Build a client for the given endpoint with a bearer token.
    ///
    /// `insecure` skips server-certificate verification; pass it for TLS
    /// deployments.
    pub fn connect(endpoint: &str, token: &str, insecure: bool) -> Result<Self> {
        let mut builder = reqwest::Client::builder().redirect(reqwest::redirect::Policy::none());
        if insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| Error::database(format!("building http client: {e}")))?;

        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    /// Cluster health as reported by the agency supervision
    pub async fn cluster_health(&self) -> Result<ClusterHealth> {
        self.get_json("/_admin/cluster/health").await
    }

    /// Names of all databases
    pub async fn databases(&self) -> Result<Vec<String>> {
        let list: DatabaseList = self.get_json("/_api/database").await?;
        Ok(list.result)
    }

    /// Cluster inventory of one database, listing every collection with its
    /// replication state
    pub async fn database_inventory(&self, database: &str) -> Result<DatabaseInventory> {
        self.get_json(&format!("/_db/{database}/_api/replication/clusterInventory"))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.endpoint, path);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::database(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::database(format!("{url} returned {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| Error::database(format!("decoding response from {url}: {e}")))
    }
}

#[derive(Debug, Deserialize)]
struct DatabaseList {
    result: Vec<String>,
}

/// Health of every cluster member, keyed by server id
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ClusterHealth {
    /// Per-member health records
    #[serde(rename = "Health", default)]
    pub health: HashMap<String, MemberHealth>,
}

/// Health record of a single cluster member
#[derive(Clone, Debug, Deserialize)]
pub struct MemberHealth {
    /// Supervision status of the member
    #[serde(rename = "Status", default)]
    pub status: ServerStatus,

    /// Whether the member is scheduled for removal and may be ignored
    #[serde(rename = "CanBeDeleted", default)]
    pub can_be_deleted: bool,
}

/// Supervision status values
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerStatus {
    /// The member is healthy
    Good,
    /// The member missed recent heartbeats
    Bad,
    /// The supervision declared the member failed
    Failed,
    /// Any status this agent does not know about
    #[default]
    Unknown,
}

// Hand-written so statuses introduced by newer servers deserialize to
// Unknown instead of failing the health response.
impl<'de> Deserialize<'de> for ServerStatus {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let status = String::deserialize(deserializer)?;
        Ok(match status.as_str() {
            "GOOD" => ServerStatus::Good,
            "BAD" => ServerStatus::Bad,
            "FAILED" => ServerStatus::Failed,
            _ => ServerStatus::Unknown,
        })
    }
}

/// Replication inventory of one database
#[derive(Clone, Debug, Default, Deserialize)]
pub struct DatabaseInventory {
    /// Every collection of the database
    #[serde(default)]
    pub collections: Vec<CollectionInventory>,
}

/// Replication state of one collection
#[derive(Clone, Debug, Deserialize)]
pub struct CollectionInventory {
    /// Whether every shard of the collection is in sync
    #[serde(rename = "allInSync", default)]
    pub all_in_sync: bool,

    /// Collection parameters; only the name is of interest
    #[serde(default)]
    pub parameters: CollectionParameters,
}

/// Parameters of a collection
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CollectionParameters {
    /// Collection name
    #[serde(default)]
    pub name: String,
}
