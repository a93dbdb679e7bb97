use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kiln_controllers::Controllers;
use kiln_core::{Build, Kit, Platform, Profile, Vocabulary};
use kiln_engine::{spawn_workers, EngineConfig, InconsistentPhasePolicy, OperatorConfig, Runtime};
use kiln_kubehub::{KubeBackend, KubeEvents, LeaseKeeper, Queues, Watchers};
use kiln_store::Store;
use kube::CustomResourceExt;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kilnd", version, about = "kiln operator: reconciles kits, builds and platforms")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the operator against the current cluster
    Run {
        /// Operator id matched against the kiln.dev/operator.id annotation
        #[arg(long = "operator-id", env = "KILN_OPERATOR_ID")]
        operator_id: Option<String>,
        /// Watch a single namespace (local operator)
        #[arg(long = "watch-namespace")]
        watch_namespace: Option<String>,
        /// Workers per kind
        #[arg(long = "workers")]
        workers: Option<usize>,
        /// What to do when a build completes for a kit that moved on: fail|resync
        #[arg(long = "inconsistent-phase")]
        inconsistent_phase: Option<String>,
    },
    /// Print the CRD manifests as YAML
    Crds,
}

fn init_tracing() {
    let env = std::env::var("KILN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KILN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KILN_METRICS_ADDR; expected host:port");
        }
    }
}

fn crds() -> Result<String> {
    let mut out = String::new();
    for crd in [Kit::crd(), Build::crd(), Platform::crd(), Profile::crd()] {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}

async fn run(operator: OperatorConfig, mut config: EngineConfig) -> Result<()> {
    let client = kiln_kubehub::connect().await?;
    let store = Store::new(Arc::new(KubeBackend::new(client.clone())));
    let events = Arc::new(KubeEvents::new(client.clone(), operator.pod_name.clone()));
    config.workers = config.workers.max(1);
    info!(
        operator_id = ?operator.operator_id,
        watch_namespace = ?operator.watch_namespace,
        workers = config.workers,
        "starting kilnd"
    );

    let lease = LeaseKeeper::for_operator(store.clone(), &operator);
    let watch_namespace = operator.watch_namespace.clone();
    let workers = config.workers;
    let rt = Runtime::new(store.clone(), operator, config, Vocabulary::default(), events);
    let controllers = Controllers::with_defaults(rt);
    let queues = Queues::new();
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    tasks.extend(spawn_workers(controllers.kits.clone(), queues.kits.clone(), workers, cancel.clone()));
    tasks.extend(spawn_workers(controllers.builds.clone(), queues.builds.clone(), workers, cancel.clone()));
    tasks.extend(spawn_workers(controllers.platforms.clone(), queues.platforms.clone(), workers, cancel.clone()));
    tasks.extend(Watchers::new(client, store, watch_namespace, queues.clone()).spawn(cancel.clone()));
    if let Some(lease) = lease {
        info!(lease = lease.name(), "holding namespace lock");
        tasks.push(tokio::spawn(lease.run(cancel.clone())));
    }

    signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();
    queues.shutdown();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "task ended abnormally");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crds => print!("{}", crds()?),
        Commands::Run { operator_id, watch_namespace, workers, inconsistent_phase } => {
            init_metrics();
            let mut operator = OperatorConfig::from_env();
            if operator_id.is_some() {
                operator.operator_id = operator_id;
            }
            if watch_namespace.is_some() {
                operator.watch_namespace = watch_namespace;
            }
            let mut config = EngineConfig::from_env();
            if let Some(n) = workers {
                config.workers = n;
            }
            if let Some(policy) = inconsistent_phase {
                config.inconsistent_phase = InconsistentPhasePolicy::from_str(&policy).map_err(anyhow::Error::msg)?;
            }
            run(operator, config).await?;
        }
    }
    Ok(())
}
