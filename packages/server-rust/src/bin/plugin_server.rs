//! `plugin-server`: serves the plugin verbs over HTTP with the sample data plane.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::TimeDelta;
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use plugin_server::dataplane::SampleDataplane;
use plugin_server::network::{NetworkConfig, NetworkModule, ShutdownController, TlsConfig};
use plugin_server::service::{BackgroundWorker, Dispatcher, PurgeRunnable, ServerConfig};
use plugin_server::storage::{PitStoreFactory, StorageBackend};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "plugin-server", version, about = "Backup plugin verb server")]
struct Args {
    #[arg(long, env = "PLUGIN_HOST", default_value = "0.0.0.0")]
    host: String,

    #[arg(long, env = "PLUGIN_PORT", default_value_t = 8080)]
    port: u16,

    /// PEM certificate chain; enables TLS together with `--tls-key`.
    #[arg(long, env = "PLUGIN_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "PLUGIN_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Directory holding one subdirectory per datastore. Recovery points are
    /// kept in memory when unset.
    #[arg(long, env = "PLUGIN_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    #[arg(long, env = "PLUGIN_NODE_ID", default_value = "plugin-0")]
    node_id: String,

    /// Hours a finished operation stays queryable.
    #[arg(long, env = "PLUGIN_RETENTION_HOURS", default_value_t = 8)]
    retention_hours: i64,

    #[arg(long, env = "PLUGIN_PURGE_INTERVAL_SECS", default_value_t = 300)]
    purge_interval_secs: u64,

    /// Artificial delay before backup and restore workers move data.
    #[arg(long, env = "PLUGIN_WORK_DELAY_MS", default_value_t = 0)]
    work_delay_ms: u64,

    #[arg(long, env = "PLUGIN_COPY_BUFFER_BYTES", default_value_t = 64 * 1024)]
    copy_buffer_bytes: usize,

    #[arg(long, env = "PLUGIN_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    #[arg(long, env = "PLUGIN_DRAIN_TIMEOUT_SECS", default_value_t = 30)]
    drain_timeout_secs: u64,

    #[arg(long, env = "PLUGIN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "PLUGIN_METRICS_ADDR")]
    metrics_addr: Option<SocketAddr>,
}

impl Args {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        anyhow::ensure!(
            self.retention_hours > 0,
            "retention hours must be positive, got {}",
            self.retention_hours
        );
        let operation_retention = TimeDelta::try_hours(self.retention_hours)
            .with_context(|| format!("retention of {} hours is out of range", self.retention_hours))?;
        Ok(ServerConfig {
            node_id: self.node_id.clone(),
            operation_retention,
            purge_interval: Duration::from_secs(self.purge_interval_secs),
            simulated_work_delay: Duration::from_millis(self.work_delay_ms),
            copy_buffer_size: self.copy_buffer_bytes,
            ..ServerConfig::default()
        })
    }

    fn network_config(&self) -> NetworkConfig {
        let tls = match (&self.tls_cert, &self.tls_key) {
            (Some(cert_path), Some(key_path)) => Some(TlsConfig {
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            }),
            _ => None,
        };
        NetworkConfig {
            host: self.host.clone(),
            port: self.port,
            tls,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            drain_timeout: Duration::from_secs(self.drain_timeout_secs),
        }
    }

    fn storage_backend(&self) -> StorageBackend {
        match &self.storage_root {
            Some(root) => StorageBackend::Filesystem { root: root.clone() },
            None => StorageBackend::Memory,
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C; stop the process another way");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("installing Prometheus exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let stores = Arc::new(PitStoreFactory::new(args.storage_backend())?);
    let default_store = {
        let stores = Arc::clone(&stores);
        tokio::task::spawn_blocking(move || stores.resolve(None))
            .await?
            .context("opening default datastore")?
    };
    info!(
        backend = ?stores.backend(),
        datastore = %default_store.datastore_id(),
        recovery_points = default_store.committed_ids().len(),
        "storage opened"
    );

    let server_config = args.server_config()?;
    let purge_interval = server_config.purge_interval;
    let dispatcher = Arc::new(Dispatcher::new(
        server_config,
        stores,
        Arc::new(SampleDataplane::new()),
        Arc::new(ShutdownController::new()),
    ));
    let mut purge = BackgroundWorker::start(
        PurgeRunnable::new(Arc::clone(dispatcher.registry())),
        purge_interval,
    );

    let mut network = NetworkModule::new(args.network_config(), Arc::clone(&dispatcher));
    let port = network.start().await?;
    info!(node_id = %args.node_id, port, "plugin server started");

    let served = network.serve(shutdown_signal()).await;
    purge.stop().await;
    info!("plugin server stopped");
    served
}
