//! Configuration file watcher for hot reload.
//!
//! Only the cache toggles and timeouts are applied live; other sections need a
//! restart and are reported as such.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{broadcast, mpsc};

use crate::cache::CacheFlags;
use crate::config::loader::load_config;
use crate::config::schema::{ProxyConfig, TimeoutConfig};

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// Returns the watcher and a receiver for validated configuration updates.
    pub fn new(path: &Path) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        (
            Self {
                path: path.to_path_buf(),
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching the file. The returned watcher must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.update_tx;
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    tracing::info!("Config file change detected, reloading...");
                    match load_config(&path) {
                        Ok(new_config) => {
                            let _ = tx.send(new_config);
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to reload config. Keeping current configuration.");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?self.path, "Config watcher started");
        Ok(watcher)
    }
}

/// Live settings a reload can change.
#[derive(Clone)]
pub struct ReloadTargets {
    pub flags: CacheFlags,
    pub timeouts: Arc<ArcSwap<TimeoutConfig>>,
}

impl ReloadTargets {
    /// Apply the live parts of a new configuration.
    ///
    /// Cache toggles are only touched when the file changed them.
    pub fn apply(&self, current: &ProxyConfig, next: &ProxyConfig) {
        if current == next {
            tracing::debug!("Configuration unchanged");
            return;
        }
        self.flags.apply_changes(&current.cache, &next.cache);
        self.timeouts.store(Arc::new(next.timeouts.clone()));

        tracing::info!(
            enabled = next.cache.enabled,
            local_only = next.cache.local_only,
            connect_secs = next.timeouts.connect_secs,
            idle_secs = next.timeouts.idle_secs,
            "Configuration reloaded"
        );

        if current.listener != next.listener
            || current.admin != next.admin
            || current.observability != next.observability
            || current.cache.store != next.cache.store
            || current.cache.cache_dir != next.cache.cache_dir
            || current.cache.index_file != next.cache.index_file
            || current.cache.key_on_body != next.cache.key_on_body
        {
            tracing::warn!("Some configuration changes take effect only after a restart");
        }
    }
}

/// Apply configuration updates until shutdown or until the watcher goes away.
pub async fn apply_updates(
    initial: ProxyConfig,
    mut updates: mpsc::UnboundedReceiver<ProxyConfig>,
    targets: ReloadTargets,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut current = initial;
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Some(next) => {
                    targets.apply(&current, &next);
                    current = next;
                }
                None => break,
            },
            _ = shutdown.recv() => break,
        }
    }
    tracing::debug!("Config reload loop stopped");
}
