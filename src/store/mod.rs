//! Cache store capability.
//!
//! # Data Flow
//! ```text
//! StoreProvider (shared, one per process)
//!     → open() per connection
//!     → Box<dyn CacheStore> owned by that connection's interceptor
//!
//! Per connection:
//!     is_cached / cache_request   (request phase, fallible)
//!     cache_response_chunk × N    (relay phase, infallible)
//!     close                       (finalize, infallible, idempotent)
//! ```
//!
//! # Design Decisions
//! - Request-phase operations return `StoreResult` so the interceptor can fail open
//! - Relay-phase operations cannot fail by signature; stores log and degrade
//!   internally so a storage fault never corrupts a live response stream
//! - A recording is owned by the handle that started it; handles are never shared
//!   between connections, while the underlying index/map is

pub mod disk;
pub mod memory;

use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::config::{CacheConfig, StoreKind};
use crate::http::{CachedResponse, ParseError, ProxyRequest};

pub use disk::{DiskCache, OnDiskCacheStore};
pub use memory::{MemoryCache, MemoryCacheStore};

/// Errors raised by request-phase store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored entry could not be decoded as a response.
    #[error("malformed cache entry: {0}")]
    Malformed(#[from] ParseError),

    #[error("request has no host to build a cache key from")]
    MissingHost,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`CacheStore::cache_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreMessage {
    /// Nothing cached yet: forward this request; the store is recording.
    Request(ProxyRequest),
    /// A previously recorded response to replay.
    Response(CachedResponse),
}

/// Storage backend driven by the cache interceptor.
pub trait CacheStore: Send {
    /// Whether a response is stored for this request.
    fn is_cached(&self, request: &ProxyRequest) -> StoreResult<bool>;

    /// Resolve a stored response, or start recording the upstream one.
    fn cache_request(&mut self, request: &ProxyRequest) -> StoreResult<StoreMessage>;

    /// Append one upstream chunk to the current recording and return the bytes to
    /// relay to the client.
    fn cache_response_chunk(&mut self, chunk: Bytes) -> Bytes;

    /// Finalize the current recording, if any.
    fn close(&mut self);
}

impl<S: CacheStore + ?Sized> CacheStore for Box<S> {
    fn is_cached(&self, request: &ProxyRequest) -> StoreResult<bool> {
        (**self).is_cached(request)
    }

    fn cache_request(&mut self, request: &ProxyRequest) -> StoreResult<StoreMessage> {
        (**self).cache_request(request)
    }

    fn cache_response_chunk(&mut self, chunk: Bytes) -> Bytes {
        (**self).cache_response_chunk(chunk)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Hands out one store handle per connection.
pub trait StoreProvider: Send + Sync {
    fn open(&self) -> StoreResult<Box<dyn CacheStore>>;

    /// Short backend name for logs and the admin API.
    fn name(&self) -> &'static str;
}

/// Store that never holds anything.
///
/// Stands in when a real handle cannot be opened, with caching disabled for the
/// connection so it is never consulted.
#[derive(Debug, Default)]
pub struct NullStore;

impl CacheStore for NullStore {
    fn is_cached(&self, _request: &ProxyRequest) -> StoreResult<bool> {
        Ok(false)
    }

    fn cache_request(&mut self, request: &ProxyRequest) -> StoreResult<StoreMessage> {
        Ok(StoreMessage::Request(request.clone()))
    }

    fn cache_response_chunk(&mut self, chunk: Bytes) -> Bytes {
        chunk
    }

    fn close(&mut self) {}
}

/// Open the store selected by the cache configuration.
pub fn provider_from_config(config: &CacheConfig) -> StoreResult<Arc<dyn StoreProvider>> {
    let provider: Arc<dyn StoreProvider> = match config.store {
        StoreKind::Disk => Arc::new(DiskCache::open(
            config.cache_dir.clone(),
            &config.index_file,
            config.key_on_body,
        )?),
        StoreKind::Memory => Arc::new(MemoryCache::new(config.key_on_body)),
    };
    tracing::info!(store = provider.name(), "Cache store ready");
    Ok(provider)
}

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub method: String,
    pub host: String,
    pub path: String,
    /// SHA-512 hex digest of the request body, when bodies are part of the key.
    pub body: Option<String>,
}

impl CacheKey {
    /// Build the key for a request.
    ///
    /// With `key_on_body` unset only method, host and path take part.
    pub fn from_request(request: &ProxyRequest, key_on_body: bool) -> StoreResult<Self> {
        let host = request.host.clone().ok_or(StoreError::MissingHost)?;
        let body = (key_on_body && !request.body.is_empty())
            .then(|| hex::encode(Sha512::digest(&request.body)));
        Ok(Self {
            method: request.method.to_string(),
            host,
            path: request.path.clone(),
            body,
        })
    }

    /// Body column as written to the disk index.
    pub fn body_column(&self) -> &str {
        self.body.as_deref().unwrap_or("None")
    }
}
