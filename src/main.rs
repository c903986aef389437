//! arango-chaos - chaos agent entry point
//!
//! Startup enumerates the deployments, their external-access services and
//! the usable nodes exactly once; the snapshots stay immutable for the run.
//! Startup failures (credentials, API unreachable, nothing to observe) are
//! fatal; a clean shutdown through ctrl-c exits 0.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use k8s_openapi::api::core::v1::Service;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use arango_chaos::controller::{ChaosConfig, ChaosController};
use arango_chaos::gateway::{ClusterGateway, KubeGateway};
use arango_chaos::nodes;
use arango_chaos::planner::ChaosPlanner;
use arango_chaos::podlog::PodLogArchiver;
use arango_chaos::probe::{ClusterSyncProbe, HealthCheck, HealthProbe};
use arango_chaos::token::JwtIssuer;

/// Chaos agent for ArangoDB deployments on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "arango-chaos", version, about, long_about = None)]
struct Cli {
    /// Namespace to use, must exist
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Disable chaos and only archive pod logs
    #[arg(long)]
    disable_chaos: bool,

    /// Amount of concurrent chaos per wave
    #[arg(long, default_value_t = 1)]
    concurrent_chaos: usize,

    /// Directory to archive pod logs under
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                shutdown.cancel();
            }
        });
    }

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;

    let start_time = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    info!(start_time = %start_time, namespace = %cli.namespace, "starting chaos agent");

    let gateway: Arc<dyn ClusterGateway> = Arc::new(KubeGateway::new(client.clone()));

    let deployments = gateway
        .list_deployments(&cli.namespace)
        .await
        .context("failed to list deployments")?;
    anyhow::ensure!(
        !deployments.is_empty(),
        "no deployments found in namespace {}",
        cli.namespace
    );

    let services = gateway
        .list_services(&cli.namespace)
        .await
        .context("failed to list services")?;

    let mut external_services = HashMap::new();
    let mut deployment_names = Vec::new();
    for deployment in &deployments {
        let name = deployment.name_any();
        info!(deployment = %name, "found deployment");
        if let Some(service) = services
            .iter()
            .find(|service| is_external_access_service(service, &name))
        {
            info!(deployment = %name, "found external access load balancer");
            external_services.insert(name.clone(), service.clone());
        }
        deployment_names.push(name);
    }

    let log_dir = cli.log_dir.join(&start_time).join("pods");
    PodLogArchiver::start(client, shutdown.clone(), &cli.namespace, &log_dir)
        .await
        .context("failed to start pod log archiver")?;

    if cli.disable_chaos {
        info!("chaos is disabled");
        shutdown.cancelled().await;
        return Ok(());
    }

    let node_list = gateway.list_nodes().await.context("failed to list nodes")?;
    let usable = nodes::usable_nodes(&node_list);
    let planner = Arc::new(ChaosPlanner::new(usable).context("cannot plan node faults")?);

    let issuer = Arc::new(JwtIssuer::new(Arc::clone(&gateway)));
    let sync = Arc::new(ClusterSyncProbe::new(
        Arc::clone(&gateway),
        issuer,
        cli.namespace.clone(),
        external_services,
    ));
    let probe: Arc<dyn HealthCheck> = Arc::new(HealthProbe::new(
        Arc::clone(&gateway),
        sync,
        cli.namespace.clone(),
        deployment_names,
    ));

    // Give freshly created pods a moment before the first readiness pass.
    tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        _ = tokio::time::sleep(Duration::from_secs(10)) => {}
    }

    if let Err(error) = probe.deployments_ready(&shutdown).await {
        if error.is_cancelled() {
            return Ok(());
        }
        anyhow::bail!("deployments never became ready: {error}");
    }

    let controller = ChaosController::new(
        gateway,
        planner,
        probe,
        ChaosConfig::new(cli.namespace, cli.concurrent_chaos),
        shutdown,
    );

    match controller.run().await {
        Err(error) if error.is_cancelled() => {
            info!("chaos agent stopped");
            Ok(())
        }
        other => other.map_err(Into::into),
    }
}

fn is_external_access_service(service: &Service, deployment: &str) -> bool {
    let expected = format!("{deployment}-ea");
    service.metadata.name.as_deref() == Some(expected.as_str())
        && service
            .spec
            .as_ref()
            .and_then(|spec| spec.type_.as_deref())
            == Some("LoadBalancer")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ServiceSpec;

    fn service(name: &str, type_: &str) -> Service {
        let mut service = Service::default();
        service.metadata.name = Some(name.to_string());
        service.spec = Some(ServiceSpec {
            type_: Some(type_.to_string()),
            ..ServiceSpec::default()
        });
        service
    }

    /// Only a load-balancer service named `<deployment>-ea` counts as the
    /// deployment's external access.
    #[test]
    fn external_access_requires_name_and_load_balancer_type() {
        assert!(is_external_access_service(&service("db-ea", "LoadBalancer"), "db"));
        assert!(!is_external_access_service(&service("db-ea", "ClusterIP"), "db"));
        assert!(!is_external_access_service(&service("db-int", "LoadBalancer"), "db"));
        assert!(!is_external_access_service(&service("other-ea", "LoadBalancer"), "db"));
    }

    #[test]
    fn cli_defaults_match_the_documented_surface() {
        let cli = Cli::parse_from(["arango-chaos"]);
        assert_eq!(cli.namespace, "default");
        assert!(!cli.disable_chaos);
        assert_eq!(cli.concurrent_chaos, 1);
        assert_eq!(cli.log_dir, PathBuf::from("logs"));
    }
}
