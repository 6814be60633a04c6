//! Hotstandby Operator - keeps a constant buffer of idle replicas warm

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hotstandby::controller::{error_policy, reconcile, Context};
use hotstandby::crd::HotStandbyDeployment;
use hotstandby::events::{KubeEventPublisher, RateLimitedPublisher};
use hotstandby::leader::LeaderElector;
use hotstandby::probe;

/// Hotstandby - Kubernetes controller maintaining a buffer of idle replicas
#[derive(Parser, Debug)]
#[command(name = "hotstandby-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Watch a single namespace instead of the whole cluster
    #[arg(long, conflicts_with = "all_namespaces")]
    namespace: Option<String>,

    /// Watch every namespace (the default when --namespace is not given)
    #[arg(long)]
    all_namespaces: bool,

    /// Number of parallel reconcile workers
    #[arg(long, default_value_t = 2)]
    workers: u16,

    /// Enable Lease-based leader election
    #[arg(long)]
    leader_elect: bool,

    /// Maximum in-flight HTTP busy probes per resource
    #[arg(long, default_value_t = 16)]
    probe_concurrency: usize,

    /// Address serving /healthz and /readyz
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Log filter (e.g. "info", "hotstandby=debug")
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    if cli.crd {
        match serde_yaml::to_string(&HotStandbyDeployment::crd()) {
            Ok(crd) => {
                println!("{crd}");
                return ExitCode::SUCCESS;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize CRD");
                return ExitCode::from(1);
            }
        }
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::from(1)
        }
    }
}

/// Exit code for a lost leadership lease
const EXIT_LEASE_LOST: u8 = 2;

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    tracing::info!("hotstandby operator starting");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    // Health endpoints; a bind failure is a startup failure.
    let health = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(cli.metrics_addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {}: {e}", cli.metrics_addr))?;
    tracing::info!(addr = %cli.metrics_addr, "health server listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health).await {
            tracing::error!(error = %e, "health server error");
        }
    });

    let events = Arc::new(RateLimitedPublisher::new(KubeEventPublisher::new(
        client.clone(),
        "hotstandby-controller",
    )));
    let ctx = Arc::new(Context::new(
        client.clone(),
        events,
        cli.probe_concurrency,
    ));

    let (hsds, deployments, pods) = match cli.namespace.as_deref() {
        Some(ns) => {
            tracing::info!(namespace = %ns, "watching single namespace");
            (
                Api::<HotStandbyDeployment>::namespaced(client.clone(), ns),
                Api::<Deployment>::namespaced(client.clone(), ns),
                Api::<Pod>::namespaced(client.clone(), ns),
            )
        }
        None => {
            tracing::info!("watching all namespaces");
            (
                Api::<HotStandbyDeployment>::all(client.clone()),
                Api::<Deployment>::all(client.clone()),
                Api::<Pod>::all(client.clone()),
            )
        }
    };

    let controller = Controller::new(hsds, WatcherConfig::default())
        .with_config(ControllerConfig::default().concurrency(cli.workers))
        .owns(deployments, WatcherConfig::default());

    // Reader over the watched resources, shared with the pod mapper and the
    // probe-state sweeper.
    let store = controller.store();

    // Reap probe tables and poller tasks for resources that disappeared.
    {
        let store = store.clone();
        let probes = ctx.probes.clone();
        let pollers = ctx.pollers.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let live: HashSet<String> = store
                    .state()
                    .iter()
                    .filter_map(|hsd| {
                        let ns = hsd.namespace()?;
                        Some(probe::hsd_key(&ns, &hsd.name_any()))
                    })
                    .collect();
                probes.retain_tables(&live);
                pollers.retain(&live);
            }
        });
    }

    let mapper_store = store;
    let controller = controller
        .watches(pods, WatcherConfig::default(), move |pod: Pod| {
            let labels = pod.metadata.labels.clone().unwrap_or_default();
            let Some(namespace) = pod.metadata.namespace.clone() else {
                return Vec::new();
            };
            let matches: Vec<ObjectRef<HotStandbyDeployment>> = mapper_store
                .state()
                .iter()
                .filter(|hsd| hsd.namespace().as_deref() == Some(namespace.as_str()))
                .filter(|hsd| selector_matches(&hsd.spec.match_labels(), &labels))
                .map(|hsd| ObjectRef::new(&hsd.name_any()).within(&namespace))
                .collect();
            if matches.len() > 1 {
                tracing::warn!(
                    pod = %pod.name_any(),
                    namespace = %namespace,
                    count = matches.len(),
                    "pod matches multiple HotStandbyDeployment selectors; overlap may oscillate"
                );
            }
            matches
        })
        .shutdown_on_signal();

    tracing::info!(workers = cli.workers, "starting HotStandbyDeployment controller");

    let run_controller = controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(object = %obj, ?action, "reconciliation completed")
                }
                Err(e) => tracing::error!(error = %e, "reconciliation error"),
            }
        });

    if cli.leader_elect {
        let lease_namespace = std::env::var("POD_NAMESPACE")
            .ok()
            .or_else(|| cli.namespace.clone())
            .unwrap_or_else(|| "default".to_string());
        let identity = std::env::var("HOSTNAME")
            .unwrap_or_else(|_| format!("hotstandby-{}", std::process::id()));

        let elector = Arc::new(LeaderElector::new(
            client.clone(),
            &lease_namespace,
            &identity,
        ));
        let mut guard = elector.acquire().await;

        tokio::select! {
            _ = run_controller => {
                tracing::info!("controller stopped, shutting down");
                Ok(ExitCode::SUCCESS)
            }
            _ = guard.lost() => {
                tracing::error!("leadership lost, shutting down");
                Ok(ExitCode::from(EXIT_LEASE_LOST))
            }
        }
    } else {
        run_controller.await;
        tracing::info!("controller stopped, shutting down");
        Ok(ExitCode::SUCCESS)
    }
}

/// Whether every selector label is present on the pod
///
/// An empty selector matches nothing; such specs are rejected by validation
/// anyway.
fn selector_matches(
    selector: &std::collections::BTreeMap<String, String>,
    labels: &std::collections::BTreeMap<String, String>,
) -> bool {
    !selector.is_empty()
        && selector
            .iter()
            .all(|(k, v)| labels.get(k).map(|lv| lv == v).unwrap_or(false))
}
