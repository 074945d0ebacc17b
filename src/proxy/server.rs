//! Accept loop for the forward proxy.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::broadcast;
use tracing::Instrument;

use super::handler::serve_connection;
use crate::cache::CacheFlags;
use crate::config::TimeoutConfig;
use crate::net::{ConnectionTracker, Listener, ListenerError};
use crate::store::StoreProvider;

/// How long shutdown waits for open connections to finish.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Serves proxy connections with caching shared across all of them.
pub struct ProxyServer {
    flags: CacheFlags,
    provider: Arc<dyn StoreProvider>,
    timeouts: Arc<ArcSwap<TimeoutConfig>>,
    tracker: ConnectionTracker,
}

impl ProxyServer {
    pub fn new(flags: CacheFlags, provider: Arc<dyn StoreProvider>, timeouts: Arc<ArcSwap<TimeoutConfig>>) -> Self {
        Self {
            flags,
            provider,
            timeouts,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until shutdown is signalled, then drain.
    pub async fn run(&self, listener: Listener, mut shutdown: broadcast::Receiver<()>) -> Result<(), ListenerError> {
        tracing::info!(store = self.provider.name(), "Proxy accepting connections");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr, permit)) => {
                        let _ = stream.set_nodelay(true);
                        let guard = self.tracker.track();
                        let span = tracing::debug_span!("connection", id = %guard.id(), peer = %peer_addr);
                        let flags = self.flags.clone();
                        let provider = Arc::clone(&self.provider);
                        let timeouts = self.timeouts.load_full();

                        tokio::spawn(
                            async move {
                                let _permit = permit;
                                let _guard = guard;
                                if let Err(e) = serve_connection(stream, &flags, provider.as_ref(), &timeouts).await {
                                    tracing::debug!(error = %e, "Connection ended with error");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(ListenerError::Closed) => return Err(ListenerError::Closed),
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active, "Waiting for connections to finish");
        }
        if !self.tracker.drain(DRAIN_TIMEOUT).await {
            tracing::warn!(active = self.tracker.active_count(), "Drain timed out, dropping connections");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCache;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[tokio::test]
    async fn serves_until_shutdown() {
        let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listener = Listener::from_tcp(tcp, 8).unwrap();
        let addr = listener.local_addr().unwrap();

        let server = Arc::new(ProxyServer::new(
            CacheFlags::new(true, true),
            Arc::new(MemoryCache::new(false)),
            Arc::new(ArcSwap::from_pointee(TimeoutConfig::default())),
        ));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let run = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.run(listener, shutdown_rx).await })
        };

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /get HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 502 Bad gateway\r\n"));

        shutdown_tx.send(()).unwrap();
        run.await.unwrap().unwrap();
        assert_eq!(server.tracker().active_count(), 0);
    }
}
