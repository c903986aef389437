//! arango-chaos - chaos agent for ArangoDB deployments on Kubernetes
//!
//! The agent continuously perturbs the cluster substrate underneath one or
//! more ArangoDeployments (deleting pods, draining nodes, simulating node
//! crashes) while verifying that the deployments managed by the ArangoDB
//! operator stay healthy, in sync, and recover after every fault.
//!
//! # Architecture
//!
//! The controller runs waves: a configurable number of concurrent fault
//! injections, a join, and then a reconcile barrier that probes deployment
//! health and replays compensating actions (uncordons) until the cluster is
//! healthy again.
//!
//! # Modules
//!
//! - [`crd`] - observed subset of the ArangoDeployment custom resource
//! - [`gateway`] - capability interface over the Kubernetes API
//! - [`nodes`] - cordon/uncordon/drain/crash operations on nodes
//! - [`pods`] - watch-before-mutate pod deletion and eviction
//! - [`planner`] - random fault selection and compensator pairing
//! - [`controller`] - the outer chaos/reconcile loop
//! - [`probe`] - deployment readiness and replication-sync verification
//! - [`db`] - thin ArangoDB HTTP driver used by the sync probe
//! - [`token`] - bearer-token minting for database access
//! - [`podlog`] - best-effort pod log archiver
//! - [`retry`] - fixed-interval retry for the readiness probe
//! - [`error`] - error kinds for the agent

#![deny(missing_docs)]

use std::time::Duration;

pub mod controller;
pub mod crd;
pub mod db;
pub mod error;
pub mod gateway;
pub mod nodes;
pub mod planner;
pub mod podlog;
pub mod pods;
pub mod probe;
pub mod retry;
pub mod token;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Port the ArangoDB coordinators listen on behind the external-access service
pub const DATABASE_PORT: u16 = 8529;

/// Issuer claim carried by every minted bearer token
pub const TOKEN_ISSUER: &str = "arangodb";

/// Server id claim carried by every minted bearer token
pub const TOKEN_SERVER_ID: &str = "CHAOS!!!!!";

/// Pause between eviction attempts while the control plane reports
/// pod-disruption-budget back-pressure
pub const EVICTION_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Cadence of the per-deployment readiness retry
pub const READINESS_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Budget for one full readiness pass during reconcile
pub const PROBE_BUDGET: Duration = Duration::from_secs(60);
