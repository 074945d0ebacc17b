//! Per-connection cache interceptor.

use bytes::Bytes;

use super::flags::{CacheFlags, ConnectionPolicy};
use super::NOT_CACHED_BODY;
use crate::http::{build_http_response, ProxyRequest, PROXY_AGENT_HEADER_VALUE};
use crate::observability::metrics;
use crate::store::{CacheStore, StoreMessage};

/// Where a connection is in the caching protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Flags captured, no decision yet.
    Snapshotted,
    /// Traffic flows without caching (disabled, tunnel, or store fault).
    PassThrough,
    /// The store is being consulted.
    CacheLookup,
    /// The client was answered from the store.
    ServedFromCache,
    /// Nothing cached and upstream not allowed; the client got a 502.
    Rejected,
    /// The upstream response is being recorded.
    Recording,
    /// The upstream leg ended and the store was finalized.
    Closed,
}

/// Entry point for one connection, before any hook has run.
pub struct CacheInterceptor<S> {
    flags: CacheFlags,
    store: S,
}

impl<S: CacheStore> CacheInterceptor<S> {
    pub fn new(flags: CacheFlags, store: S) -> Self {
        Self { flags, store }
    }

    /// First hook of a connection, called before any upstream connection is made.
    ///
    /// Captures the flags for the whole connection and returns the session that
    /// receives the remaining hooks, plus the request to connect upstream for, or
    /// `None` when no upstream connection should be made.
    pub fn before_upstream_connection(self, request: ProxyRequest) -> (CacheSession<S>, Option<ProxyRequest>) {
        let mut session = CacheSession {
            policy: self.flags.snapshot(),
            store: self.store,
            client_queue: Vec::new(),
            state: SessionState::Snapshotted,
            close_client: false,
        };
        let upstream = session.decide_upstream(request);
        (session, upstream)
    }
}

/// Hooks of a connection after its flags were captured.
pub struct CacheSession<S> {
    policy: ConnectionPolicy,
    store: S,
    client_queue: Vec<Bytes>,
    state: SessionState,
    close_client: bool,
}

impl<S: CacheStore> CacheSession<S> {
    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Set once the client queue ends with a response that is only delimited
    /// by closing the connection, or that asked for the connection to close.
    pub fn closes_client(&self) -> bool {
        self.close_client
    }

    /// Bytes to write to the client, in order, before anything else.
    pub fn take_client_queue(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.client_queue)
    }

    fn decide_upstream(&mut self, request: ProxyRequest) -> Option<ProxyRequest> {
        if !self.policy.enabled {
            metrics::record_cache_bypass("disabled");
            self.state = SessionState::PassThrough;
            return Some(request);
        }

        tracing::info!(
            method = %request.method,
            host = request.host.as_deref().unwrap_or("-"),
            port = request.port.unwrap_or(0),
            path = %request.path,
            "Upstream connection"
        );

        if request.is_connect() {
            if self.policy.local_only {
                tracing::debug!(request_target = %request.target, "Tunnel suppressed while local only");
                metrics::record_cache_request("rejected");
                self.client_queue.push(not_cached_response());
                self.state = SessionState::Rejected;
                self.close_client = true;
                return None;
            }
            metrics::record_cache_bypass("connect");
            self.state = SessionState::PassThrough;
            return Some(request);
        }

        self.state = SessionState::CacheLookup;
        match self.store.is_cached(&request) {
            Ok(true) => {
                metrics::record_cache_lookup("hit");
                None
            }
            Ok(false) => {
                metrics::record_cache_lookup("miss");
                Some(request)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Caching disabled due to store error");
                metrics::record_cache_lookup("error");
                Some(request)
            }
        }
    }

    /// Called for every request the client sends on this connection.
    ///
    /// Returns the request to forward upstream, or `None` when the client has
    /// been answered through the client queue.
    pub fn handle_client_request(&mut self, request: ProxyRequest) -> Option<ProxyRequest> {
        if !self.policy.enabled || request.is_connect() {
            return Some(request);
        }

        tracing::info!(
            method = %request.method,
            host = request.host.as_deref().unwrap_or("-"),
            port = request.port.unwrap_or(0),
            path = %request.path,
            "Client request"
        );

        self.state = SessionState::CacheLookup;
        match self.store.cache_request(&request) {
            Ok(StoreMessage::Request(forward)) => {
                if self.policy.local_only {
                    metrics::record_cache_request("rejected");
                    self.client_queue.push(not_cached_response());
                    self.state = SessionState::Rejected;
                    self.close_client = true;
                    return None;
                }
                metrics::record_cache_request("recorded");
                self.state = SessionState::Recording;
                return Some(forward);
            }
            Ok(StoreMessage::Response(cached)) => {
                metrics::record_cache_request("replayed");
                self.close_client = !cached.is_self_delimited() || cached.closes_connection();
                self.client_queue.push(cached.to_bytes());
                self.state = SessionState::ServedFromCache;
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Caching disabled due to store error");
                metrics::record_cache_request("fault");
            }
        }

        // Fail open. A hit here means the store is inconsistent; the client gets a
        // 500 and the request is still forwarded.
        match self.store.is_cached(&request) {
            Ok(true) => self.client_queue.push(internal_error_response()),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "Caching disabled due to store error"),
        }
        self.state = SessionState::PassThrough;
        Some(request)
    }

    /// Called for every chunk received from upstream, in order.
    pub fn handle_upstream_chunk(&mut self, chunk: Bytes) -> Bytes {
        if !self.policy.enabled {
            return chunk;
        }
        self.store.cache_response_chunk(chunk)
    }

    /// Called once when the upstream leg ends, however it ends.
    pub fn on_upstream_connection_close(&mut self) {
        if !self.policy.enabled {
            return;
        }
        self.store.close();
        self.state = SessionState::Closed;
    }
}

/// 502 sent when nothing is cached and upstream is not allowed.
pub fn not_cached_response() -> Bytes {
    let length = NOT_CACHED_BODY.len().to_string();
    build_http_response(
        502,
        Some("Bad gateway"),
        [
            ("Server", PROXY_AGENT_HEADER_VALUE),
            ("Content-Length", length.as_str()),
            ("Connection", "close"),
        ],
        NOT_CACHED_BODY.as_bytes(),
    )
}

fn internal_error_response() -> Bytes {
    build_http_response(
        500,
        Some("Internal server error"),
        [("Server", PROXY_AGENT_HEADER_VALUE), ("Connection", "close")],
        b"",
    )
}
