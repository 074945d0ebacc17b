//! In-memory cache store.
//!
//! Entries live in a `DashMap` shared by every handle; nothing survives a restart.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;

use super::{CacheKey, CacheStore, StoreMessage, StoreProvider, StoreResult};
use crate::http::{CachedResponse, ProxyRequest};

/// Shared map of raw recorded responses. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<CacheKey, Bytes>>,
    key_on_body: bool,
}

impl MemoryCache {
    pub fn new(key_on_body: bool) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            key_on_body,
        }
    }

    /// A new store handle for one connection.
    pub fn handle(&self) -> MemoryCacheStore {
        MemoryCacheStore {
            cache: self.clone(),
            recording: None,
        }
    }

    /// Store raw response bytes for a request, replacing any previous entry.
    pub fn insert(&self, request: &ProxyRequest, raw: Bytes) -> StoreResult<()> {
        let key = CacheKey::from_request(request, self.key_on_body)?;
        self.entries.insert(key, raw);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl StoreProvider for MemoryCache {
    fn open(&self) -> StoreResult<Box<dyn CacheStore>> {
        Ok(Box::new(self.handle()))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Per-connection handle onto a [`MemoryCache`].
pub struct MemoryCacheStore {
    cache: MemoryCache,
    recording: Option<(CacheKey, BytesMut)>,
}

impl MemoryCacheStore {
    fn finish_recording(&mut self) {
        if let Some((key, buf)) = self.recording.take() {
            if buf.is_empty() {
                return;
            }
            tracing::debug!(host = %key.host, path = %key.path, bytes = buf.len(), "Cached response committed");
            self.cache.entries.insert(key, buf.freeze());
        }
    }
}

impl CacheStore for MemoryCacheStore {
    fn is_cached(&self, request: &ProxyRequest) -> StoreResult<bool> {
        let key = CacheKey::from_request(request, self.cache.key_on_body)?;
        Ok(self.cache.entries.contains_key(&key))
    }

    fn cache_request(&mut self, request: &ProxyRequest) -> StoreResult<StoreMessage> {
        let key = CacheKey::from_request(request, self.cache.key_on_body)?;

        // Clone out of the map so no shard lock is held while parsing.
        let hit = self.cache.entries.get(&key).map(|entry| entry.value().clone());
        if let Some(raw) = hit {
            tracing::info!(host = %key.host, path = %key.path, "Found in cache");
            return Ok(StoreMessage::Response(CachedResponse::parse(&raw)?));
        }

        self.finish_recording();
        tracing::info!(host = %key.host, path = %key.path, "Caching response");
        self.recording = Some((key, BytesMut::new()));
        Ok(StoreMessage::Request(request.clone()))
    }

    fn cache_response_chunk(&mut self, chunk: Bytes) -> Bytes {
        if let Some((_, buf)) = self.recording.as_mut() {
            buf.extend_from_slice(&chunk);
        }
        chunk
    }

    fn close(&mut self) {
        self.finish_recording();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> ProxyRequest {
        let raw = format!("GET http://example.org{path} HTTP/1.1\r\n\r\n");
        ProxyRequest::parse(raw.as_bytes()).unwrap().unwrap().0
    }

    #[test]
    fn recording_is_visible_to_other_handles_after_close() {
        let cache = MemoryCache::new(false);
        let mut store = cache.handle();
        assert!(matches!(store.cache_request(&get("/a")).unwrap(), StoreMessage::Request(_)));
        store.cache_response_chunk(Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\n"));

        // Not committed until close.
        assert!(!cache.handle().is_cached(&get("/a")).unwrap());
        store.cache_response_chunk(Bytes::from_static(b"hello"));
        store.close();

        let mut reader = cache.handle();
        assert!(reader.is_cached(&get("/a")).unwrap());
        let StoreMessage::Response(response) = reader.cache_request(&get("/a")).unwrap() else {
            panic!("expected cached response");
        };
        assert_eq!(&response.body[..], b"hello");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn seeded_entry_replays() {
        let cache = MemoryCache::new(false);
        cache
            .insert(&get("/get"), Bytes::from_static(b"HTTP/1.1 200 OK\r\n\r\nResponse From Cache"))
            .unwrap();
        let StoreMessage::Response(response) = cache.handle().cache_request(&get("/get")).unwrap() else {
            panic!("expected cached response");
        };
        assert_eq!(response.reason.as_deref(), Some("OK"));
    }

    #[test]
    fn empty_recording_not_committed() {
        let cache = MemoryCache::new(false);
        let mut store = cache.handle();
        store.cache_request(&get("/a")).unwrap();
        store.close();
        store.close();
        assert!(cache.is_empty());
    }
}
