use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use steward_controller::{CancellationToken, Controller, ControllerConfig, CronTabReconciler};
use steward_store::Store;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "steward", version, about = "Level-triggered CronTab controller")]
struct Cli {
    /// Resource to reconcile, e.g. "stable.example.com/v1beta1/CronTab"
    #[arg(long, env = "STEWARD_GVK", default_value = "stable.example.com/v1beta1/CronTab")]
    gvk: String,

    /// Only watch this namespace (default: all namespaces)
    #[arg(long = "ns", env = "STEWARD_NAMESPACE")]
    namespace: Option<String>,

    /// Concurrent reconcile workers
    #[arg(long, env = "STEWARD_WORKERS", default_value_t = 1)]
    workers: usize,

    /// Replay all cached objects every N seconds (0 disables)
    #[arg(long = "resync-secs", env = "STEWARD_RESYNC_SECS", default_value_t = 30)]
    resync_secs: u64,

    /// First retry delay after a failed reconcile
    #[arg(long = "backoff-base-ms", env = "STEWARD_BACKOFF_BASE_MS", default_value_t = 5)]
    backoff_base_ms: u64,

    /// Upper bound of the per-key retry delay
    #[arg(long = "backoff-max-secs", env = "STEWARD_BACKOFF_MAX_SECS", default_value_t = 1000)]
    backoff_max_secs: u64,

    /// Overall retry rate shared by all keys; 0 disables the overall limit
    #[arg(long, env = "STEWARD_QPS", default_value_t = 10.0)]
    qps: f64,

    #[arg(long, env = "STEWARD_BURST", default_value_t = 100)]
    burst: u32,

    /// Drop a key after this many consecutive failures (default: retry forever)
    #[arg(long = "max-retries", env = "STEWARD_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Fail if the initial list has not completed within N seconds
    #[arg(long = "sync-timeout-secs", env = "STEWARD_SYNC_TIMEOUT_SECS")]
    sync_timeout_secs: Option<u64>,
}

impl Cli {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: self.workers,
            backoff_base: Duration::from_millis(self.backoff_base_ms),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
            qps: self.qps,
            burst: self.burst,
            max_retries: self.max_retries,
            cache_sync_timeout: self.sync_timeout_secs.map(Duration::from_secs),
            ..ControllerConfig::default()
        }
    }
}

fn init_tracing() {
    let env = std::env::var("STEWARD_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("STEWARD_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid STEWARD_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    info!(gvk = %cli.gvk, ns = ?cli.namespace, workers = cli.workers, "steward starting");

    let client = kube::Client::try_default().await.context("building kube client from kubeconfig")?;
    let api = steward_kubehub::dynamic_api(client, &cli.gvk, cli.namespace.as_deref()).await?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("interrupt received; shutting down"),
                Err(e) => error!(error = %e, "failed to listen for ctrl-c; shutting down"),
            }
            cancel.cancel();
        }
    });

    let store = Arc::new(Store::new());
    let controller = Controller::new(store.clone(), Arc::new(CronTabReconciler::new()), cli.controller_config());

    let resync = Some(Duration::from_secs(cli.resync_secs));
    let reflector = tokio::spawn(steward_kubehub::run_reflector(api, store, resync, cancel.clone()));

    let res = controller.run(cancel.clone()).await;
    // A failed run must also stop the reflector.
    cancel.cancel();
    match reflector.await {
        Ok(Err(e)) => error!(error = ?e, "reflector failed"),
        Err(e) => error!(error = %e, "reflector task panicked"),
        Ok(Ok(())) => {}
    }
    res.context("running controller")?;
    info!("steward stopped");
    Ok(())
}
