//! Disk-backed cache store.
//!
//! Layout inside the cache directory:
//! ```text
//! list.txt                   index, one entry per line:
//!                            METHOD HOST PATH BODY FILE
//! proxy-cache-<FILE>         raw upstream response bytes
//! proxy-cache-<FILE>.part    recording in progress
//! ```
//!
//! The index is append-only; the last line for a key wins, so re-caching a key
//! replaces the entry without rewriting the file.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use uuid::Uuid;

use super::{CacheKey, CacheStore, StoreError, StoreMessage, StoreProvider, StoreResult};
use crate::http::{CachedResponse, ProxyRequest};
use crate::observability::metrics;

/// Default index file name.
pub const DEFAULT_INDEX_FILE: &str = "list.txt";

const PAYLOAD_PREFIX: &str = "proxy-cache-";

/// Shared state of one cache directory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct DiskCache {
    inner: Arc<DiskCacheInner>,
}

#[derive(Debug)]
struct DiskCacheInner {
    dir: PathBuf,
    index_path: PathBuf,
    /// Serializes index reads and appends across all handles.
    index_lock: Mutex<()>,
    key_on_body: bool,
}

impl DiskCache {
    /// Open (creating if needed) a cache directory and its index file.
    pub fn open(dir: impl Into<PathBuf>, index_file: &str, key_on_body: bool) -> StoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let index_path = dir.join(index_file);
        OpenOptions::new().create(true).append(true).open(&index_path)?;

        tracing::info!(dir = %dir.display(), index = index_file, "Disk cache opened");

        Ok(Self {
            inner: Arc::new(DiskCacheInner {
                dir,
                index_path,
                index_lock: Mutex::new(()),
                key_on_body,
            }),
        })
    }

    /// Cache directory.
    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    /// A new store handle for one connection.
    pub fn handle(&self) -> OnDiskCacheStore {
        OnDiskCacheStore {
            cache: self.clone(),
            recording: None,
        }
    }

    /// Number of lines in the index.
    pub fn index_len(&self) -> StoreResult<usize> {
        let _guard = self.lock_index();
        let file = File::open(&self.inner.index_path)?;
        Ok(BufReader::new(file).lines().count())
    }

    fn key_for(&self, request: &ProxyRequest) -> StoreResult<CacheKey> {
        CacheKey::from_request(request, self.inner.key_on_body)
    }

    fn payload_path(&self, name: &str) -> PathBuf {
        self.inner.dir.join(format!("{PAYLOAD_PREFIX}{name}"))
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner.index_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Payload path of the newest index entry for `key`.
    fn lookup(&self, key: &CacheKey) -> StoreResult<Option<PathBuf>> {
        let _guard = self.lock_index();
        let file = File::open(&self.inner.index_path)?;

        let mut found = None;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let fields: Vec<&str> = line.split_whitespace().collect();
            let &[method, host, path, body, name] = fields.as_slice() else {
                if !line.trim().is_empty() {
                    tracing::warn!(line = lineno + 1, "Skipping malformed cache index line");
                }
                continue;
            };
            if method == key.method && host == key.host && path == key.path && body == key.body_column() {
                found = Some(name.to_string());
            }
        }
        Ok(found.map(|name| self.payload_path(&name)))
    }

    fn commit(&self, key: &CacheKey, name: &str) -> std::io::Result<()> {
        let _guard = self.lock_index();
        let mut index = OpenOptions::new().read(true).append(true).open(&self.inner.index_path)?;

        // Hand-written indexes may lack a trailing newline.
        let len = index.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            index.seek(SeekFrom::Start(len - 1))?;
            index.read_exact(&mut last)?;
            if last[0] != b'\n' {
                index.write_all(b"\n")?;
            }
        }

        writeln!(
            index,
            "{} {} {} {} {}",
            key.method,
            key.host,
            key.path,
            key.body_column(),
            name
        )?;
        index.flush()
    }
}

impl StoreProvider for DiskCache {
    fn open(&self) -> StoreResult<Box<dyn CacheStore>> {
        if !self.inner.dir.is_dir() {
            return Err(StoreError::Unavailable(format!(
                "cache directory {} is missing",
                self.inner.dir.display()
            )));
        }
        Ok(Box::new(self.handle()))
    }

    fn name(&self) -> &'static str {
        "disk"
    }
}

/// A response being written to disk.
struct Recording {
    key: CacheKey,
    name: String,
    part_path: PathBuf,
    file: BufWriter<File>,
    written: u64,
}

/// Per-connection handle onto a [`DiskCache`].
pub struct OnDiskCacheStore {
    cache: DiskCache,
    recording: Option<Recording>,
}

impl OnDiskCacheStore {
    fn start_recording(&mut self, key: CacheKey) -> StoreResult<()> {
        // A pipelined request starts a new recording; finish the previous one.
        self.finish_recording();

        let name = Uuid::new_v4().simple().to_string();
        let part_path = self.cache.payload_path(&format!("{name}.part"));
        let file = OpenOptions::new().write(true).create_new(true).open(&part_path)?;

        tracing::info!(path = %part_path.display(), "Caching response");
        self.recording = Some(Recording {
            key,
            name,
            part_path,
            file: BufWriter::new(file),
            written: 0,
        });
        Ok(())
    }

    fn finish_recording(&mut self) {
        let Some(mut recording) = self.recording.take() else {
            return;
        };

        if recording.written == 0 {
            tracing::debug!(path = %recording.part_path.display(), "Discarding empty recording");
            drop(recording.file);
            let _ = fs::remove_file(&recording.part_path);
            return;
        }

        let final_path = self.cache.payload_path(&recording.name);
        let result = recording
            .file
            .flush()
            .and_then(|_| fs::rename(&recording.part_path, &final_path))
            .and_then(|_| self.cache.commit(&recording.key, &recording.name));

        match result {
            Ok(()) => tracing::debug!(
                path = %final_path.display(),
                bytes = recording.written,
                "Cached response committed"
            ),
            Err(e) => {
                tracing::warn!(error = %e, path = %recording.part_path.display(), "Failed to commit cached response");
                metrics::record_store_error("close");
                let _ = fs::remove_file(&recording.part_path);
                let _ = fs::remove_file(&final_path);
            }
        }
    }
}

impl CacheStore for OnDiskCacheStore {
    fn is_cached(&self, request: &ProxyRequest) -> StoreResult<bool> {
        let key = self.cache.key_for(request)?;
        Ok(self.cache.lookup(&key)?.is_some_and(|path| path.is_file()))
    }

    fn cache_request(&mut self, request: &ProxyRequest) -> StoreResult<StoreMessage> {
        let key = self.cache.key_for(request)?;

        if let Some(path) = self.cache.lookup(&key)? {
            match fs::read(&path) {
                Ok(raw) => {
                    tracing::info!(path = %path.display(), "Found in cache");
                    return Ok(StoreMessage::Response(CachedResponse::parse(&raw)?));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "Indexed cache file missing, recording again");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.start_recording(key)?;
        Ok(StoreMessage::Request(request.clone()))
    }

    fn cache_response_chunk(&mut self, chunk: Bytes) -> Bytes {
        if let Some(recording) = self.recording.as_mut() {
            match recording.file.write_all(&chunk) {
                Ok(()) => recording.written += chunk.len() as u64,
                Err(e) => {
                    tracing::warn!(error = %e, path = %recording.part_path.display(), "Recording abandoned");
                    metrics::record_store_error("chunk");
                    let part_path = recording.part_path.clone();
                    self.recording = None;
                    let _ = fs::remove_file(part_path);
                }
            }
        }
        chunk
    }

    fn close(&mut self) {
        self.finish_recording();
    }
}

impl Drop for OnDiskCacheStore {
    fn drop(&mut self) {
        self.finish_recording();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(raw: &[u8]) -> ProxyRequest {
        ProxyRequest::parse(raw).unwrap().unwrap().0
    }

    fn get(path: &str) -> ProxyRequest {
        request(format!("GET http://example.org{path} HTTP/1.1\r\nHost: example.org\r\n\r\n").as_bytes())
    }

    #[test]
    fn records_then_replays() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), DEFAULT_INDEX_FILE, false).unwrap();
        let upstream = b"HTTP/1.1 200 OK\r\n\r\nOriginal Response From Upstream";

        let mut store = cache.handle();
        assert!(!store.is_cached(&get("/get")).unwrap());
        assert!(matches!(store.cache_request(&get("/get")).unwrap(), StoreMessage::Request(_)));

        // Split across chunks, relayed untouched.
        let relayed = store.cache_response_chunk(Bytes::from_static(&upstream[..10]));
        assert_eq!(&relayed[..], &upstream[..10]);
        store.cache_response_chunk(Bytes::from_static(&upstream[10..]));
        store.close();
        store.close();

        let index = fs::read_to_string(dir.path().join(DEFAULT_INDEX_FILE)).unwrap();
        let fields: Vec<&str> = index.trim().split(' ').collect();
        assert_eq!(&fields[..4], &["GET", "example.org", "/get", "None"]);
        let payload = fs::read(dir.path().join(format!("proxy-cache-{}", fields[4]))).unwrap();
        assert_eq!(payload, upstream);

        let mut other = cache.handle();
        assert!(other.is_cached(&get("/get")).unwrap());
        match other.cache_request(&get("/get")).unwrap() {
            StoreMessage::Response(response) => {
                assert_eq!(response.status, Some(200));
                assert_eq!(&response.body[..], b"Original Response From Upstream");
            }
            other => panic!("expected replay, got {other:?}"),
        }
    }

    #[test]
    fn loads_preexisting_index() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("list.txt"), "GET example.org /get None test").unwrap();
        fs::write(dir.path().join("proxy-cache-test"), b"HTTP/1.1 200 OK\r\n\r\nResponse From Cache").unwrap();

        let cache = DiskCache::open(dir.path(), "list.txt", false).unwrap();
        let mut store = cache.handle();
        assert!(store.is_cached(&get("/get")).unwrap());
        assert!(!store.is_cached(&get("/other")).unwrap());
        let StoreMessage::Response(response) = store.cache_request(&get("/get")).unwrap() else {
            panic!("expected cached response");
        };
        assert_eq!(&response.body[..], b"Response From Cache");

        // New entries start on their own line.
        let mut recorder = cache.handle();
        recorder.cache_request(&get("/other")).unwrap();
        recorder.cache_response_chunk(Bytes::from_static(b"HTTP/1.1 204 No Content\r\n\r\n"));
        recorder.close();
        assert_eq!(cache.index_len().unwrap(), 2);
        assert!(cache.handle().is_cached(&get("/get")).unwrap());
        assert!(cache.handle().is_cached(&get("/other")).unwrap());
    }

    #[test]
    fn empty_recording_is_discarded() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), DEFAULT_INDEX_FILE, false).unwrap();
        let mut store = cache.handle();
        store.cache_request(&get("/get")).unwrap();
        store.close();

        assert_eq!(cache.index_len().unwrap(), 0);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(PAYLOAD_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn close_without_recording_is_noop() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), DEFAULT_INDEX_FILE, false).unwrap();
        let mut store = cache.handle();
        store.close();
        assert_eq!(store.cache_response_chunk(Bytes::from_static(b"abc")), Bytes::from_static(b"abc"));
        assert_eq!(cache.index_len().unwrap(), 0);
    }

    #[test]
    fn newest_entry_wins() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), DEFAULT_INDEX_FILE, false).unwrap();
        for body in ["first", "second"] {
            let mut store = cache.handle();
            store.cache_request(&get("/get")).unwrap();
            store.cache_response_chunk(Bytes::from(format!("HTTP/1.1 200 OK\r\n\r\n{body}")));
            store.close();
        }
        let StoreMessage::Response(response) = cache.handle().cache_request(&get("/get")).unwrap() else {
            panic!("expected cached response");
        };
        assert_eq!(&response.body[..], b"second");
    }

    #[test]
    fn corrupt_payload_is_a_store_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("list.txt"), "GET example.org /get None bad\n").unwrap();
        fs::write(dir.path().join("proxy-cache-bad"), b"not a response").unwrap();
        let cache = DiskCache::open(dir.path(), "list.txt", false).unwrap();
        let result = cache.handle().cache_request(&get("/get"));
        assert!(matches!(result, Err(StoreError::Malformed(_))));
    }

    #[test]
    fn request_without_host_is_a_store_error() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCache::open(dir.path(), DEFAULT_INDEX_FILE, false).unwrap();
        let r = request(b"GET /get HTTP/1.1\r\n\r\n");
        assert!(matches!(cache.handle().is_cached(&r), Err(StoreError::MissingHost)));
    }
}
