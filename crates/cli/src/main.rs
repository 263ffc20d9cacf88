use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use recon_controller::{Controller, ControllerConfig, Reconciler};
use recon_core::{ListFilter, ObjectKey, ReconcileError, ResourceObject};
use recon_kubehub::KubeResourceApi;
use recon_queue::WorkQueue;
use recon_store::{LocalCache, Reflector, ReflectorConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "reconctl", version, about = "Recon controller CLI")]
struct Cli {
    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true, env = "RECON_NAMESPACE")]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch a GVK and reconcile every object by logging its state
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// GVK key, e.g. "v1/Pod" or "apps/v1/Deployment"
    #[arg(default_value = "v1/Pod")]
    gvk: String,
    /// Label selector applied to list and watch
    #[arg(short = 'l', long = "selector")]
    label_selector: Option<String>,
    /// Field selector applied to list and watch
    #[arg(long = "field-selector")]
    field_selector: Option<String>,
    /// Number of concurrent workers
    #[arg(long, env = "RECON_WORKERS", default_value_t = 1)]
    workers: usize,
    /// Failed attempts before a key is dropped
    #[arg(long, env = "RECON_MAX_RETRIES", default_value_t = 5)]
    max_retries: u32,
    /// Seconds to wait for the initial list before giving up
    #[arg(long, env = "RECON_SYNC_TIMEOUT_SECS", default_value_t = 30)]
    sync_timeout_secs: u64,
    /// Redeliver every cached object on this period (0 disables)
    #[arg(long, env = "RECON_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,
    /// Upper bound for list/watch reconnect backoff
    #[arg(long, env = "RECON_WATCH_BACKOFF_MAX_SECS", default_value_t = 30)]
    watch_backoff_max_secs: u64,
    /// Stop after this many consecutive list/watch failures
    #[arg(long, env = "RECON_MAX_WATCH_FAILURES")]
    max_watch_failures: Option<u32>,
    /// Drop keys failing with a permanent error without retrying
    #[arg(long)]
    drop_permanent: bool,
}

fn init_tracing() {
    let env = std::env::var("RECON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RECON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RECON_METRICS_ADDR; expected host:port");
        }
    }
}

/// Reconciles by reporting the observed state.
struct LogReconciler {
    gvk: String,
}

#[async_trait::async_trait]
impl Reconciler for LogReconciler {
    async fn reconcile(&self, obj: Arc<ResourceObject>) -> Result<(), ReconcileError> {
        info!(gvk = %self.gvk, key = %obj.key, version = %obj.version, "sync/add/update");
        Ok(())
    }

    async fn cleanup(&self, key: &ObjectKey) {
        info!(gvk = %self.gvk, key = %key, "object does not exist anymore");
    }
}

async fn run_controller(namespace: Option<String>, args: RunArgs) -> Result<()> {
    let api = KubeResourceApi::for_gvk(&args.gvk).await.with_context(|| format!("resolving {}", args.gvk))?;
    let filter = ListFilter {
        namespace,
        label_selector: args.label_selector.clone(),
        field_selector: args.field_selector.clone(),
    };
    let reflector_config = ReflectorConfig {
        backoff_max: Duration::from_secs(args.watch_backoff_max_secs.max(1)),
        max_consecutive_failures: args.max_watch_failures,
        resync_period: (args.resync_secs > 0).then(|| Duration::from_secs(args.resync_secs)),
        ..ReflectorConfig::default()
    };
    let cache = Arc::new(LocalCache::new());
    let reflector = Arc::new(Reflector::with_config(Arc::new(api), filter, cache, reflector_config));
    let queue = WorkQueue::new(&args.gvk);
    let config = ControllerConfig {
        max_retries: args.max_retries,
        sync_timeout: Duration::from_secs(args.sync_timeout_secs),
        drop_permanent: args.drop_permanent,
    };
    let controller = Controller::new(queue, reflector, Arc::new(LogReconciler { gvk: args.gvk.clone() })).with_config(config);

    let stop = CancellationToken::new();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            match signal::ctrl_c().await {
                Ok(()) => info!("Ctrl-C received; shutting down controller"),
                Err(e) => error!(error = %e, "failed to listen for Ctrl-C; shutting down"),
            }
            stop.cancel();
        }
    });

    controller.run(args.workers, stop).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => {
            info!(gvk = %args.gvk, ns = ?cli.namespace, workers = args.workers, "run invoked");
            run_controller(cli.namespace, args).await?;
        }
    }
    Ok(())
}
