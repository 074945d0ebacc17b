//! caching-proxy entry point.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use clap::Parser;
use tokio::sync::mpsc;

use caching_proxy::admin::{self, AdminState};
use caching_proxy::config::watcher::{apply_updates, ConfigWatcher, ReloadTargets};
use caching_proxy::config::{load_config, ProxyConfig};
use caching_proxy::net::Listener;
use caching_proxy::observability::{logging, metrics};
use caching_proxy::{store, CacheFlags, ProxyServer, Shutdown};

#[derive(Parser, Debug, Clone)]
#[command(name = "caching-proxy", version)]
#[command(about = "Forward proxy that records and replays upstream responses", long_about = None)]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address.
    #[arg(long)]
    bind: Option<String>,

    /// Never contact upstream; serve only cached responses.
    #[arg(long)]
    local_only: bool,

    /// Start with caching turned off.
    #[arg(long)]
    disable_cache: bool,

    /// Override cache.cache_dir.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

impl Args {
    /// Command-line flags win over the file, on startup and on every reload.
    fn apply(&self, config: &mut ProxyConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(dir) = &self.cache_dir {
            config.cache.cache_dir = dir.clone();
        }
        if self.local_only {
            config.cache.local_only = true;
        }
        if self.disable_cache {
            config.cache.enabled = false;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ProxyConfig::default(),
    };
    args.apply(&mut config);

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "caching-proxy starting");
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        enabled = config.cache.enabled,
        local_only = config.cache.local_only,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let flags = CacheFlags::from_config(&config.cache);
    let timeouts = Arc::new(ArcSwap::from_pointee(config.timeouts.clone()));
    let provider = store::provider_from_config(&config.cache)?;
    let shutdown = Shutdown::new();
    let _signals = shutdown.trigger_on_signal();

    let server = ProxyServer::new(flags.clone(), Arc::clone(&provider), Arc::clone(&timeouts));

    if config.admin.enabled {
        let addr: SocketAddr = config.admin.bind_address.parse()?;
        let state = AdminState {
            flags: flags.clone(),
            api_key: Arc::from(config.admin.api_key.as_str()),
            store_name: provider.name(),
            connections: server.tracker().clone(),
        };
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(addr, state, shutdown_rx).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    // Keep the watcher alive for the life of the process.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut raw_updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;

            let (tx, updates) = mpsc::unbounded_channel();
            let overrides = args.clone();
            tokio::spawn(async move {
                while let Some(mut next) = raw_updates.recv().await {
                    overrides.apply(&mut next);
                    if tx.send(next).is_err() {
                        break;
                    }
                }
            });

            let targets = ReloadTargets {
                flags: flags.clone(),
                timeouts: Arc::clone(&timeouts),
            };
            tokio::spawn(apply_updates(config.clone(), updates, targets, shutdown.subscribe()));
            Some(watcher)
        }
        None => None,
    };

    let listener = Listener::bind(&config.listener).await?;
    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
