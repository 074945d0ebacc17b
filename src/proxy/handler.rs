//! Per-connection request handling.
//!
//! Drives the cache hooks at their fixed points: the first request goes
//! through `before_upstream_connection`, every request through
//! `handle_client_request`, every upstream read through `handle_upstream_chunk`,
//! and the end of the upstream leg through `on_upstream_connection_close`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::cache::{CacheFlags, CacheInterceptor, CacheSession};
use crate::config::TimeoutConfig;
use crate::http::{build_http_response, ParseError, ProxyRequest, PROXY_AGENT_HEADER_VALUE};
use crate::observability::metrics;
use crate::store::{CacheStore, NullStore, StoreProvider};

const READ_BUF_SIZE: usize = 16 * 1024;

type Session = CacheSession<Box<dyn CacheStore>>;

/// Error type for a single client connection.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed request: {0}")]
    Parse(#[from] ParseError),

    #[error("Client idle timeout")]
    IdleTimeout,

    #[error("Request names no upstream host")]
    MissingAuthority,

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Connect to {authority} failed: {source}")]
    Connect {
        authority: String,
        source: std::io::Error,
    },
}

/// Serve one client connection until it closes.
///
/// If the store cannot hand out a handle, the connection runs with caching
/// disabled.
pub async fn serve_connection<C>(
    client: C,
    flags: &CacheFlags,
    provider: &dyn StoreProvider,
    timeouts: &TimeoutConfig,
) -> Result<(), HandlerError>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = tokio::io::split(client);
    let mut conn = Connection {
        reader,
        writer,
        buf: BytesMut::with_capacity(READ_BUF_SIZE),
        connect_timeout: Duration::from_secs(timeouts.connect_secs),
        idle_timeout: Duration::from_secs(timeouts.idle_secs),
    };

    let Some(first) = conn.next_request().await? else {
        return Ok(());
    };

    let (store, flags) = match provider.open() {
        Ok(store) => (store, flags.clone()),
        Err(e) => {
            tracing::warn!(error = %e, store = provider.name(), "Store unavailable, caching disabled for connection");
            metrics::record_store_error("open");
            (Box::new(NullStore) as Box<dyn CacheStore>, CacheFlags::new(false, false))
        }
    };

    let (session, upstream) = CacheInterceptor::new(flags, store).before_upstream_connection(first.clone());

    if first.is_connect() {
        conn.tunnel(session, upstream).await
    } else {
        conn.relay(session, first).await
    }
}

struct Connection<C> {
    reader: ReadHalf<C>,
    writer: WriteHalf<C>,
    buf: BytesMut,
    connect_timeout: Duration,
    idle_timeout: Duration,
}

impl<C> Connection<C>
where
    C: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    /// Next pipelined request, or `None` once the client is done.
    ///
    /// Malformed requests are answered with a 400 and end the connection.
    async fn next_request(&mut self) -> Result<Option<ProxyRequest>, HandlerError> {
        match self.read_request().await {
            Err(HandlerError::Parse(e)) => {
                tracing::debug!(error = %e, "Malformed client request");
                let _ = self.writer.write_all(&error_response(400, "Bad request")).await;
                let _ = self.writer.shutdown().await;
                Ok(None)
            }
            other => other,
        }
    }

    async fn read_request(&mut self) -> Result<Option<ProxyRequest>, HandlerError> {
        loop {
            if let Some((request, used)) = ProxyRequest::parse(&self.buf)? {
                self.buf.advance(used);
                return Ok(Some(request));
            }

            let n = tokio::time::timeout(self.idle_timeout, self.reader.read_buf(&mut self.buf))
                .await
                .map_err(|_| HandlerError::IdleTimeout)??;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ParseError::Incomplete.into());
            }
        }
    }

    async fn write_queue(&mut self, session: &mut Session) -> std::io::Result<()> {
        for bytes in session.take_client_queue() {
            self.writer.write_all(&bytes).await?;
        }
        self.writer.flush().await
    }

    /// Plain HTTP: answer from the cache for as long as possible, forward the
    /// first request that needs upstream.
    async fn relay(mut self, mut session: Session, first: ProxyRequest) -> Result<(), HandlerError> {
        let mut request = first;
        loop {
            let forward = session.handle_client_request(request);
            self.write_queue(&mut session).await?;

            if let Some(forward) = forward {
                return self.forward(session, forward).await;
            }
            if session.closes_client() {
                tracing::debug!(state = ?session.state(), "Closing client after answer");
                break;
            }

            request = match self.next_request().await? {
                Some(next) => next,
                None => break,
            };
        }

        let _ = self.writer.shutdown().await;
        Ok(())
    }

    /// Send one request upstream and relay the response until upstream closes.
    async fn forward(mut self, mut session: Session, request: ProxyRequest) -> Result<(), HandlerError> {
        let result = self.exchange(&mut session, &request).await;
        session.on_upstream_connection_close();
        let _ = self.writer.shutdown().await;
        result
    }

    async fn exchange(&mut self, session: &mut Session, request: &ProxyRequest) -> Result<(), HandlerError> {
        if request.is_connect() {
            self.writer.write_all(&error_response(400, "Bad request")).await?;
            return Ok(());
        }

        let mut upstream = match dial(request, self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                let response = match e {
                    HandlerError::MissingAuthority => error_response(400, "Bad request"),
                    _ => error_response(502, "Bad gateway"),
                };
                let _ = self.writer.write_all(&response).await;
                return Err(e);
            }
        };

        upstream.write_all(&request.to_upstream_bytes()).await?;
        let relayed = pump_upstream(&mut upstream, &mut self.writer, session, self.idle_timeout, None).await?;
        tracing::debug!(bytes = relayed, path = %request.path, "Upstream response relayed");
        Ok(())
    }

    /// CONNECT: either refuse, or splice the client and upstream together.
    async fn tunnel(self, mut session: Session, upstream: Option<ProxyRequest>) -> Result<(), HandlerError> {
        let Connection {
            mut reader,
            mut writer,
            mut buf,
            connect_timeout,
            idle_timeout,
        } = self;

        let Some(request) = upstream else {
            for bytes in session.take_client_queue() {
                writer.write_all(&bytes).await?;
            }
            let _ = writer.shutdown().await;
            return Ok(());
        };

        let stream = match dial(&request, connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                let _ = writer.write_all(&error_response(502, "Bad gateway")).await;
                session.on_upstream_connection_close();
                let _ = writer.shutdown().await;
                return Err(e);
            }
        };

        let established = format!(
            "HTTP/1.1 200 Connection established\r\nProxy-agent: {PROXY_AGENT_HEADER_VALUE}\r\n\r\n"
        );
        writer.write_all(established.as_bytes()).await?;

        let (mut upstream_rd, mut upstream_wr) = stream.into_split();
        let mut pending = buf.split();
        let uploaded = Arc::new(AtomicU64::new(0));
        let progress = uploaded.clone();
        let upload = tokio::spawn(async move {
            loop {
                if pending.is_empty() {
                    pending.reserve(READ_BUF_SIZE);
                    if reader.read_buf(&mut pending).await? == 0 {
                        break;
                    }
                }
                upstream_wr.write_all(&pending).await?;
                progress.fetch_add(pending.len() as u64, Ordering::Relaxed);
                pending.clear();
            }
            upstream_wr.shutdown().await
        });

        let relayed = pump_upstream(&mut upstream_rd, &mut writer, &mut session, idle_timeout, Some(&uploaded)).await;
        upload.abort();
        session.on_upstream_connection_close();
        let _ = writer.shutdown().await;

        let relayed = relayed?;
        tracing::debug!(bytes = relayed, authority = %request.target, "Tunnel closed");
        Ok(())
    }
}

async fn dial(request: &ProxyRequest, timeout: Duration) -> Result<TcpStream, HandlerError> {
    let (host, port) = request.authority().ok_or(HandlerError::MissingAuthority)?;
    let authority = format!("{host}:{port}");

    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            tracing::debug!(authority = %authority, "Upstream connected");
            Ok(stream)
        }
        Ok(Err(source)) => Err(HandlerError::Connect { authority, source }),
        Err(_) => Err(HandlerError::ConnectTimeout(authority)),
    }
}

/// Relay upstream bytes to the client through the chunk hook until upstream
/// reaches EOF or fails, or until the idle timeout passes with no traffic.
/// Returns the number of bytes read.
///
/// `uploaded` counts bytes moving the other way; while it keeps growing the
/// leg is not idle even if upstream stays silent.
///
/// Only client write failures are reported; the upstream leg ending is normal.
async fn pump_upstream<R, W>(
    upstream: &mut R,
    client: &mut W,
    session: &mut Session,
    idle_timeout: Duration,
    uploaded: Option<&AtomicU64>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let upload_progress = || uploaded.map_or(0, |n| n.load(Ordering::Relaxed));
    let mut seen_upload = upload_progress();
    let mut total = 0u64;
    loop {
        let mut chunk = BytesMut::with_capacity(READ_BUF_SIZE);
        match tokio::time::timeout(idle_timeout, upstream.read_buf(&mut chunk)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n as u64,
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "Upstream read failed");
                break;
            }
            Err(_) => {
                let now = upload_progress();
                if now != seen_upload {
                    seen_upload = now;
                    continue;
                }
                tracing::debug!("Upstream idle timeout");
                break;
            }
        }

        let out = session.handle_upstream_chunk(chunk.freeze());
        client.write_all(&out).await?;
    }
    client.flush().await?;
    Ok(total)
}

fn error_response(status: u16, reason: &str) -> Bytes {
    build_http_response(
        status,
        Some(reason),
        [
            ("Server", PROXY_AGENT_HEADER_VALUE),
            ("Content-Length", "0"),
            ("Connection", "close"),
        ],
        b"",
    )
}
