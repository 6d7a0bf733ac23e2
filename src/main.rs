use clap::Parser;
use eyre::format_err;
use kube::{
    Client,
    config::{KubeConfigOptions, Kubeconfig},
    runtime::watcher,
};
use log::{error, info};
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
    sync::mpsc,
};

use knfw::{apply::Activator, fetch::KubeFetcher, kube_watch, reconcile};

pub mod config;

const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_COMMIT"), ")");

/// Kubernetes Node FireWall
#[derive(Parser)]
#[command(version = VERSION, about, long_about = ABOUT)]
struct Cli {
    /// log filters (see https://docs.rs/env_logger/latest/env_logger/index.html#enabling-logging)
    #[arg(long, default_value = "info", env = "KNFW_LOG")]
    log: String,
    /// log style (see https://docs.rs/env_logger/latest/env_logger/index.html#disabling-colors)
    #[arg(long, default_value = "auto", env = "KNFW_LOG_STYLE")]
    log_style: String,

    /// Config file path. Defaults apply without one.
    #[arg(long, short = 'c')]
    config: Option<String>,

    /// Test the config and exit.
    #[arg(long)]
    test_config: bool,

    /// kubeconfig file; in-cluster or default kubeconfig discovery when not set.
    #[arg(long, short = 'k', alias = "kubecfg")]
    kubeconfig: Option<PathBuf>,

    /// Only print the rules that would be enforced.
    #[arg(long, env = "KNFW_DRY_RUN")]
    dry_run: bool,

    /// Recompile period even without changes (500ms, 10s, 2m...). Overrides the config.
    #[arg(long, env = "KNFW_FETCH_INTERVAL", value_parser = parse_duration)]
    fetch_interval: Option<Duration>,
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    config::parse_duration(s).map_err(|e| e.to_string())
}

const ABOUT: &str = r#"
Kubernetes Node FireWall

Watch the Kubernetes API server and enforce network policies and exposed
services as nftables rules on the node's forward chain.
"#;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    env_logger::builder()
        .parse_filters(cli.log.as_str())
        .parse_write_style(cli.log_style.as_str())
        .format_timestamp_millis()
        .init();

    use config::*;
    let mut config = match &cli.config {
        None => Config::default(),
        Some(path) => {
            let config = tokio::fs::read(path)
                .await
                .map_err(|e| format_err!("read config failed: {path}: {e}"))?;
            serde_yaml::from_slice(&config).map_err(|e| format_err!("parse config failed: {e}"))?
        }
    };

    if let Some(fetch_interval) = cli.fetch_interval {
        config.fetch_interval = fetch_interval;
    }

    config
        .validate()
        .map_err(|e| format_err!("invalid config: {e}"))?;

    let cluster_url = config
        .cluster_url()
        .map_err(|e| format_err!("invalid cluster_url: {e}"))?;

    if cli.test_config {
        return Ok(());
    }

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(t), Ok(i)) => (t, i),
                (Err(e), _) | (_, Err(e)) => {
                    error!("failed to listen to signals: {e}");
                    return;
                }
            };
        select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        };
        exit(0);
    });

    info!("knfw {VERSION} starting");

    let kube = match connect(cli.kubeconfig.as_ref(), cluster_url).await {
        Ok(v) => v,
        Err(e) => {
            error!("unable to connect to k8s: {e}");
            exit(1);
        }
    };

    match &config.namespace {
        None => info!("watching all namespaces"),
        Some(ns) => info!("watching namespace {ns}"),
    };

    if cli.dry_run {
        info!("dry run: rules will be printed, not enforced");
    } else {
        info!("enforcing rules through {}", config.apply.path.display());
    }

    let (tx, rx) = mpsc::channel(config.event_buffer);

    let watch_config = kube_watch::Config {
        namespace: config.namespace.clone(),
        client: kube.clone(),
        watcher_config: watcher::Config::default(),
        backoff: config.watch_backoff,
    };
    watch_config.watch_to(tx.clone());

    tokio::spawn(reconcile::tick(config.fetch_interval, tx));

    let reconciler = reconcile::Reconciler::new(
        KubeFetcher::new(kube, config.namespace),
        Activator::new(config.apply),
        config.debounce,
        cli.dry_run,
    );
    reconciler.run(rx).await;

    error!("all signal sources finished");
    exit(1); // this is actually unexpected
}

async fn connect(
    kubeconfig: Option<&PathBuf>,
    cluster_url: Option<http::Uri>,
) -> eyre::Result<Client> {
    let mut kube_cfg = match kubeconfig {
        None => kube::Config::infer().await?,
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| format_err!("read {} failed: {e}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await?
        }
    };
    if let Some(cluster_url) = cluster_url {
        kube_cfg.cluster_url = cluster_url;
    }

    info!("kubernetes cluster at {}", kube_cfg.cluster_url);

    let kube: Client = kube_cfg.try_into()?;

    let version = kube.apiserver_version().await?;
    info!("connected to kubernetes {}.{}", version.major, version.minor);

    Ok(kube)
}
