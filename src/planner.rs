//! Random fault selection
//!
//! The planner draws a uniform roll in [0, 10] and maps it onto a fault
//! class, pairing each node fault with the uncordon that reverses its
//! substrate side effect. The target node is captured by value at plan
//! construction; node names are immutable, so the capture stays valid for
//! the lifetime of the plan.

use std::fmt;

#[cfg(test)]
use mockall::automock;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::gateway::{ClusterGateway, DeleteOptions};
use crate::{nodes, pods};
use crate::{Error, Result};

/// Lower bound (inclusive) of the randomized drain grace period
const GRACE_PERIOD_MIN: u32 = 10;
/// Upper bound (exclusive) of the randomized drain grace period
const GRACE_PERIOD_MAX: u32 = 210;

/// One chaos act against the cluster substrate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Delete a uniformly-random pod in the target namespace, grace 0
    DeletePod,
    /// Drain the captured node with the given grace-period options
    DrainNode {
        /// Target node, captured by value
        node: String,
        /// Grace-period options forwarded to each eviction
        options: DeleteOptions,
    },
    /// Cordon the captured node and force-delete every pod on it
    SimulateCrash {
        /// Target node, captured by value
        node: String,
    },
}

impl Fault {
    /// Execute the fault against the cluster.
    ///
    /// Deleting a random pod from an empty namespace is a no-op, not an
    /// error.
    pub async fn inject(
        &self,
        gateway: &dyn ClusterGateway,
        shutdown: &CancellationToken,
        namespace: &str,
    ) -> Result<()> {
        match self {
            Fault::DeletePod => delete_random_pod(gateway, shutdown, namespace).await,
            Fault::DrainNode { node, options } => {
                info!(node = %node, ?options, "draining node");
                nodes::drain(gateway, shutdown, node, options).await?;
                info!(node = %node, "drain completed");
                Ok(())
            }
            Fault::SimulateCrash { node } => {
                info!(node = %node, "simulating crash of node");
                nodes::simulate_crash(gateway, shutdown, node, &DeleteOptions::immediate()).await?;
                info!(node = %node, "crash completed");
                Ok(())
            }
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::DeletePod => write!(f, "delete random pod"),
            Fault::DrainNode { node, options } => match options.grace_period_seconds {
                Some(grace) => write!(f, "drain node {node} (grace {grace}s)"),
                None => write!(f, "drain node {node}"),
            },
            Fault::SimulateCrash { node } => write!(f, "simulate crash of node {node}"),
        }
    }
}

/// An idempotent action reversing a fault's substrate side effect
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Compensator {
    /// Make the named node schedulable again
    Uncordon(String),
}

impl Compensator {
    /// Apply the compensator. Safe to invoke more than once.
    pub async fn apply(&self, gateway: &dyn ClusterGateway) -> Result<()> {
        match self {
            Compensator::Uncordon(node) => nodes::uncordon(gateway, node).await,
        }
    }
}

impl fmt::Display for Compensator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compensator::Uncordon(node) => write!(f, "uncordon node {node}"),
        }
    }
}

/// A fault paired with the compensator that undoes it, when one is needed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FaultPlan {
    /// The chaos act
    pub fault: Fault,
    /// Reverses the side effect; `None` when the effect heals automatically
    pub compensator: Option<Compensator>,
}

/// Source of fault plans for the controller
#[cfg_attr(test, automock)]
pub trait FaultPlanner: Send + Sync {
    /// Produce the next fault plan
    fn plan(&self) -> FaultPlan;
}

/// Planner drawing from the fixed fault distribution
pub struct ChaosPlanner {
    usable_nodes: Vec<String>,
}

impl ChaosPlanner {
    /// Create a planner over the startup usable-node snapshot.
    ///
    /// Fails when the snapshot is empty: most fault classes target a node
    /// and would be unplannable.
    pub fn new(usable_nodes: Vec<String>) -> Result<Self> {
        if usable_nodes.is_empty() {
            return Err(Error::not_ready("no usable nodes to plan faults against"));
        }
        Ok(Self { usable_nodes })
    }

    /// Map a roll onto a fault class.
    ///
    /// `roll` is drawn from [0, 10], `node_index` from the usable-node
    /// snapshot, `grace_period` from [10, 210).
    fn plan_roll(&self, roll: u8, node_index: usize, grace_period: u32) -> FaultPlan {
        debug_assert!(roll <= 10);
        let node = self.usable_nodes[node_index % self.usable_nodes.len()].clone();
        match roll {
            0..=2 => FaultPlan {
                fault: Fault::DeletePod,
                compensator: None,
            },
            3 | 4 => FaultPlan {
                fault: Fault::DrainNode {
                    node: node.clone(),
                    options: DeleteOptions::default(),
                },
                compensator: Some(Compensator::Uncordon(node)),
            },
            5 => FaultPlan {
                fault: Fault::DrainNode {
                    node: node.clone(),
                    options: DeleteOptions::immediate(),
                },
                compensator: Some(Compensator::Uncordon(node)),
            },
            6..=8 => FaultPlan {
                fault: Fault::DrainNode {
                    node: node.clone(),
                    options: DeleteOptions::with_grace_period(grace_period),
                },
                compensator: Some(Compensator::Uncordon(node)),
            },
            _ => FaultPlan {
                fault: Fault::SimulateCrash { node: node.clone() },
                compensator: Some(Compensator::Uncordon(node)),
            },
        }
    }
}

impl FaultPlanner for ChaosPlanner {
    fn plan(&self) -> FaultPlan {
        let mut rng = rand::thread_rng();
        let roll = rng.gen_range(0..=10);
        let node_index = rng.gen_range(0..self.usable_nodes.len());
        let grace_period = rng.gen_range(GRACE_PERIOD_MIN..GRACE_PERIOD_MAX);
        self.plan_roll(roll, node_index, grace_period)
    }
}

async fn delete_random_pod(
    gateway: &dyn ClusterGateway,
    shutdown: &CancellationToken,
    namespace: &str,
) -> Result<()> {
    let pods_list = gateway.list_pods(namespace).await?;
    if pods_list.is_empty() {
        debug!(namespace = %namespace, "no pods to delete");
        return Ok(());
    }

    let index = rand::thread_rng().gen_range(0..pods_list.len());
    let Some(name) = pods_list[index].metadata.name.clone() else {
        return Ok(());
    };
    pods::delete_pod(gateway, shutdown, namespace, &name, &DeleteOptions::immediate()).await
}
