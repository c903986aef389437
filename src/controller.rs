//! The outer chaos loop
//!
//! Each iteration runs one wave: build up `concurrent` fault injections with
//! random jitter between dispatches, join them, then reconcile. Reconcile
//! probes all deployments under a 60 second budget; while the probe fails it
//! replays the wave's compensators in FIFO order, and once they are spent it
//! keeps probing until the cluster heals on its own. Whatever the reconcile
//! outcome, residual compensators are drained before the next wave so the
//! usable-node set stays live across waves.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gateway::ClusterGateway;
use crate::planner::{Compensator, FaultPlanner};
use crate::probe::HealthCheck;
use crate::{Error, Result, PROBE_BUDGET};

/// Settings threaded into the controller from the command line
#[derive(Clone, Debug)]
pub struct ChaosConfig {
    /// Namespace holding the deployments and the pods to perturb
    pub namespace: String,
    /// Wave width: number of concurrent fault injections
    pub concurrent: usize,
    /// Budget for one readiness pass during reconcile
    pub probe_budget: Duration,
    /// Upper bound (exclusive) of the jitter between fault dispatches
    pub max_dispatch_jitter: Duration,
}

impl ChaosConfig {
    /// Config with the default probe budget and dispatch jitter
    pub fn new(namespace: impl Into<String>, concurrent: usize) -> Self {
        Self {
            namespace: namespace.into(),
            concurrent: concurrent.max(1),
            probe_budget: PROBE_BUDGET,
            max_dispatch_jitter: Duration::from_secs(100),
        }
    }
}

/// Outstanding compensators and join handles of the current wave
#[derive(Default)]
struct Wave {
    compensators: VecDeque<Compensator>,
    handles: Vec<JoinHandle<()>>,
}

/// Supervisor for waves of concurrent chaos
pub struct ChaosController {
    gateway: Arc<dyn ClusterGateway>,
    planner: Arc<dyn FaultPlanner>,
    health: Arc<dyn HealthCheck>,
    config: ChaosConfig,
    shutdown: CancellationToken,
}

impl ChaosController {
    /// Wire a controller from its collaborators
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        planner: Arc<dyn FaultPlanner>,
        health: Arc<dyn HealthCheck>,
        config: ChaosConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            gateway,
            planner,
            health,
            config,
            shutdown,
        }
    }

    /// Run waves until the shutdown token fires.
    ///
    /// Always returns [`Error::Cancelled`]; chaos has no other exit.
    pub async fn run(&self) -> Result<()> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.run_wave().await?;
        }
    }

    /// One full wave: build-up, join, reconcile, residual drain.
    async fn run_wave(&self) -> Result<()> {
        let mut wave = self.build_wave().await?;

        for handle in wave.handles.drain(..) {
            if handle.await.is_err() {
                error!("chaos task panicked");
            }
        }

        // Cancellation leaves pending compensators alone: the agent is
        // expected to restart and recompute its startup snapshot.
        self.reconcile(&mut wave).await?;
        self.drain_compensators(&mut wave).await;
        Ok(())
    }

    async fn build_wave(&self) -> Result<Wave> {
        let mut wave = Wave::default();

        for dispatched in 0..self.config.concurrent {
            let plan = self.planner.plan();
            if let Some(compensator) = plan.compensator {
                wave.compensators.push_back(compensator);
            }

            info!(fault = %plan.fault, "starting chaos");
            let gateway = Arc::clone(&self.gateway);
            let shutdown = self.shutdown.clone();
            let namespace = self.config.namespace.clone();
            let fault = plan.fault;
            wave.handles.push(tokio::spawn(async move {
                match fault.inject(gateway.as_ref(), &shutdown, &namespace).await {
                    Ok(()) => debug!(fault = %fault, "chaos completed"),
                    Err(error) if error.is_cancelled() => {
                        debug!(fault = %fault, "chaos cancelled")
                    }
                    Err(error) => error!(fault = %fault, error = %error, "chaos failed"),
                }
            }));

            if dispatched + 1 < self.config.concurrent {
                let jitter = self.dispatch_jitter();
                info!(seconds = jitter.as_secs(), "waiting until next chaos");
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(jitter) => {}
                }
            }
        }

        Ok(wave)
    }

    fn dispatch_jitter(&self) -> Duration {
        let bound = self.config.max_dispatch_jitter.as_secs();
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs(rand::thread_rng().gen_range(0..bound))
    }

    /// The reconcile barrier between waves.
    ///
    /// Exits only when a probe pass succeeds or shutdown fires. With no
    /// compensators left it keeps probing indefinitely, trusting the cluster
    /// to heal on its own.
    async fn reconcile(&self, wave: &mut Wave) -> Result<()> {
        loop {
            let probe = tokio::time::timeout(
                self.config.probe_budget,
                self.health.deployments_ready(&self.shutdown),
            );
            let failure = match probe.await {
                Ok(Ok(())) => {
                    info!("deployments ready");
                    return Ok(());
                }
                Ok(Err(Error::Cancelled)) => return Err(Error::Cancelled),
                Ok(Err(error)) => error,
                Err(_elapsed) => Error::not_ready("readiness probe budget exceeded"),
            };

            if self.shutdown.is_cancelled() {
                return Err(Error::Cancelled);
            }

            match wave.compensators.pop_front() {
                Some(compensator) => {
                    warn!(
                        error = %failure,
                        compensator = %compensator,
                        "deployment not ready, applying compensator"
                    );
                    if let Err(error) = compensator.apply(self.gateway.as_ref()).await {
                        error!(compensator = %compensator, error = %error, "compensator failed");
                    }
                }
                None => warn!(error = %failure, "deployment not ready"),
            }
        }
    }

    async fn drain_compensators(&self, wave: &mut Wave) {
        while let Some(compensator) = wave.compensators.pop_front() {
            info!(compensator = %compensator, "applying residual compensator");
            if let Err(error) = compensator.apply(self.gateway.as_ref()).await {
                error!(compensator = %compensator, error = %error, "compensator failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{DeleteOptions, MockClusterGateway, PodEvent, PodWatch};
    use crate::planner::{Fault, FaultPlan, MockFaultPlanner};
    use crate::probe::MockHealthCheck;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use mockall::predicate::eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn drain_plan(node: &str) -> FaultPlan {
        FaultPlan {
            fault: Fault::DrainNode {
                node: node.to_string(),
                options: DeleteOptions::default(),
            },
            compensator: Some(Compensator::Uncordon(node.to_string())),
        }
    }

    fn controller(
        gateway: MockClusterGateway,
        planner: MockFaultPlanner,
        health: MockHealthCheck,
        concurrent: usize,
        shutdown: CancellationToken,
    ) -> ChaosController {
        ChaosController::new(
            Arc::new(gateway),
            Arc::new(planner),
            Arc::new(health),
            ChaosConfig::new("db", concurrent),
            shutdown,
        )
    }

    fn pod(namespace: &str, name: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.name = Some(name.to_string());
        pod
    }

    // ==========================================================================
    // Story: a full drain wave heals the node it hurt
    //
    // One deployment, one usable node, wave width 1, the planner hands out
    // a default-grace drain. The node is cordoned, the pods on it evicted,
    // the probe retried until ready, and the uncordon compensator fires so
    // the node ends the wave schedulable.
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn drain_wave_evicts_probes_and_uncordons() {
        let calls: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut planner = MockFaultPlanner::new();
        planner
            .expect_plan()
            .times(1)
            .returning(|| drain_plan("worker-1"));

        let mut gateway = MockClusterGateway::new();
        {
            let calls = calls.clone();
            gateway
                .expect_set_node_unschedulable()
                .returning(move |node, state| {
                    calls.lock().unwrap().push(format!("patch:{node}:{state}"));
                    Ok(())
                });
        }
        gateway
            .expect_pods_on_node()
            .with(eq("worker-1"))
            .returning(|_| Ok(vec![pod("db", "db-prmr-1")]));
        gateway
            .expect_watch_pod()
            .returning(|_, _| Ok(PodWatch::preloaded([PodEvent::Deleted])));
        {
            let calls = calls.clone();
            gateway.expect_evict_pod().returning(move |_, name, _| {
                calls.lock().unwrap().push(format!("evict:{name}"));
                Ok(())
            });
        }

        let probes = Arc::new(AtomicU32::new(0));
        let mut health = MockHealthCheck::new();
        {
            let counter = probes.clone();
            health.expect_deployments_ready().returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::not_ready("collections still syncing"))
                } else {
                    Ok(())
                }
            });
        }

        let shutdown = CancellationToken::new();
        let controller = controller(gateway, planner, health, 1, shutdown);
        controller.run_wave().await.unwrap();

        let calls = calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "patch:worker-1:true".to_string(),
                "evict:db-prmr-1".to_string(),
                "patch:worker-1:false".to_string(),
            ]
        );
        assert_eq!(probes.load(Ordering::SeqCst), 2);
    }

    // ==========================================================================
    // Story: compensators replay in FIFO wave-build order
    // ==========================================================================

    /// With compensators [a, b, c] and a probe that keeps failing, the
    /// uncordons fire as a, b, c interleaved with probe retries, and none
    /// remain pending after the wave.
    #[tokio::test(start_paused = true)]
    async fn reconcile_replays_compensators_in_fifo_order() {
        let uncordons: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let mut planner = MockFaultPlanner::new();
        for node in ["node-a", "node-b", "node-c"] {
            planner
                .expect_plan()
                .times(1)
                .returning(move || drain_plan(node));
        }

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_set_node_unschedulable()
            .withf(|_, state| *state)
            .returning(|_, _| Ok(()));
        {
            let uncordons = uncordons.clone();
            gateway
                .expect_set_node_unschedulable()
                .withf(|_, state| !*state)
                .returning(move |node, _| {
                    uncordons.lock().unwrap().push(node.to_string());
                    Ok(())
                });
        }
        gateway.expect_pods_on_node().returning(|_| Ok(Vec::new()));

        // fail while compensators remain, then succeed
        let probes = Arc::new(AtomicU32::new(0));
        let mut health = MockHealthCheck::new();
        {
            let counter = probes.clone();
            health.expect_deployments_ready().returning(move |_| {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::not_ready("still broken"))
                } else {
                    Ok(())
                }
            });
        }

        let shutdown = CancellationToken::new();
        let controller = controller(gateway, planner, health, 3, shutdown);
        controller.run_wave().await.unwrap();

        assert_eq!(
            uncordons.lock().unwrap().clone(),
            vec!["node-a".to_string(), "node-b".to_string(), "node-c".to_string()]
        );
        assert_eq!(probes.load(Ordering::SeqCst), 4);
    }

    /// When the probe passes on the first attempt, the compensators are
    /// still drained before the next wave: the node must not stay cordoned.
    #[tokio::test(start_paused = true)]
    async fn residual_compensators_are_drained_after_a_clean_reconcile() {
        let mut planner = MockFaultPlanner::new();
        planner
            .expect_plan()
            .times(1)
            .returning(|| drain_plan("worker-1"));

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_set_node_unschedulable()
            .with(eq("worker-1"), eq(true))
            .times(1)
            .returning(|_, _| Ok(()));
        gateway
            .expect_set_node_unschedulable()
            .with(eq("worker-1"), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));
        gateway.expect_pods_on_node().returning(|_| Ok(Vec::new()));

        let mut health = MockHealthCheck::new();
        health.expect_deployments_ready().returning(|_| Ok(()));

        let shutdown = CancellationToken::new();
        let controller = controller(gateway, planner, health, 1, shutdown);
        controller.run_wave().await.unwrap();
    }

    /// Once the compensators are spent, reconcile keeps probing until the
    /// cluster heals on its own.
    #[tokio::test(start_paused = true)]
    async fn exhausted_compensators_keep_probing() {
        let mut planner = MockFaultPlanner::new();
        planner
            .expect_plan()
            .times(1)
            .returning(|| drain_plan("worker-1"));

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_set_node_unschedulable()
            .returning(|_, _| Ok(()));
        gateway.expect_pods_on_node().returning(|_| Ok(Vec::new()));

        let probes = Arc::new(AtomicU32::new(0));
        let mut health = MockHealthCheck::new();
        {
            let counter = probes.clone();
            health.expect_deployments_ready().returning(move |_| {
                // keeps failing well past compensator exhaustion
                if counter.fetch_add(1, Ordering::SeqCst) < 5 {
                    Err(Error::not_ready("still broken"))
                } else {
                    Ok(())
                }
            });
        }

        let shutdown = CancellationToken::new();
        let controller = controller(gateway, planner, health, 1, shutdown);
        controller.run_wave().await.unwrap();

        assert_eq!(probes.load(Ordering::SeqCst), 6);
    }

    // ==========================================================================
    // Story: a simulated crash takes out every pod on the node
    // ==========================================================================

    /// DaemonSet pods are deleted too; that is what distinguishes the crash
    /// fault class from a drain.
    #[tokio::test(start_paused = true)]
    async fn crash_wave_deletes_daemonset_pods_too() {
        let mut planner = MockFaultPlanner::new();
        planner.expect_plan().times(1).returning(|| FaultPlan {
            fault: Fault::SimulateCrash {
                node: "worker-1".to_string(),
            },
            compensator: Some(Compensator::Uncordon("worker-1".to_string())),
        });

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_set_node_unschedulable()
            .returning(|_, _| Ok(()));
        gateway.expect_pods_on_node().returning(|_| {
            let mut daemon = pod("kube-system", "node-exporter-abc");
            daemon.metadata.owner_references = Some(vec![OwnerReference {
                controller: Some(true),
                kind: "DaemonSet".to_string(),
                name: "node-exporter".to_string(),
                ..OwnerReference::default()
            }]);
            Ok(vec![daemon, pod("db", "db-prmr-1")])
        });
        gateway
            .expect_watch_pod()
            .returning(|_, _| Ok(PodWatch::preloaded([PodEvent::Deleted])));
        gateway
            .expect_delete_pod()
            .withf(|_, _, options| options.grace_period_seconds == Some(0))
            .times(2)
            .returning(|_, _, _| Ok(()));
        gateway.expect_evict_pod().never();

        let mut health = MockHealthCheck::new();
        health.expect_deployments_ready().returning(|_| Ok(()));

        let shutdown = CancellationToken::new();
        let controller = controller(gateway, planner, health, 1, shutdown);
        controller.run_wave().await.unwrap();
    }

    // ==========================================================================
    // Story: cancellation leaves compensators alone
    // ==========================================================================

    /// On shutdown the wave aborts and pending compensators are NOT invoked;
    /// the restarted agent recomputes its snapshot instead.
    #[tokio::test(start_paused = true)]
    async fn cancellation_does_not_apply_pending_compensators() {
        let mut planner = MockFaultPlanner::new();
        planner
            .expect_plan()
            .times(1)
            .returning(|| drain_plan("worker-1"));

        let mut gateway = MockClusterGateway::new();
        gateway
            .expect_set_node_unschedulable()
            .with(eq("worker-1"), eq(true))
            .returning(|_, _| Ok(()));
        gateway
            .expect_set_node_unschedulable()
            .with(eq("worker-1"), eq(false))
            .never();
        gateway.expect_pods_on_node().returning(|_| Ok(Vec::new()));

        let mut health = MockHealthCheck::new();
        health
            .expect_deployments_ready()
            .returning(|_| Err(Error::Cancelled));

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let controller = controller(gateway, planner, health, 1, shutdown);

        let result = controller.run_wave().await;
        assert!(result.unwrap_err().is_cancelled());
    }

    /// A cancelled controller loop exits promptly with the cancellation
    /// kind.
    #[tokio::test]
    async fn run_exits_immediately_when_already_cancelled() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let controller = controller(
            MockClusterGateway::new(),
            MockFaultPlanner::new(),
            MockHealthCheck::new(),
            1,
            shutdown,
        );

        let result = controller.run().await;
        assert!(result.unwrap_err().is_cancelled());
    }

    /// A failing mutation is logged but neither kills the wave nor the
    /// controller; reconcile still runs.
    #[tokio::test(start_paused = true)]
    async fn a_failed_mutation_does_not_stop_the_wave() {
        let mut planner = MockFaultPlanner::new();
        planner
            .expect_plan()
            .times(1)
            .returning(|| drain_plan("worker-1"));

        let mut gateway = MockClusterGateway::new();
        // cordon fails; the drain errors out and is only logged
        gateway
            .expect_set_node_unschedulable()
            .with(eq("worker-1"), eq(true))
            .returning(|_, _| {
                Err(Error::Api(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "patch denied".to_string(),
                    reason: String::new(),
                    code: 500,
                })))
            });
        gateway
            .expect_set_node_unschedulable()
            .with(eq("worker-1"), eq(false))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut health = MockHealthCheck::new();
        health.expect_deployments_ready().returning(|_| Ok(()));

        let shutdown = CancellationToken::new();
        let controller = controller(gateway, planner, health, 1, shutdown);
        controller.run_wave().await.unwrap();
    }
}
