//! Proxy request parsing and upstream serialization.
//!
//! # Responsibilities
//! - Decode the request head and a `Content-Length` body from client bytes
//! - Resolve host, port and path for absolute-form, authority-form (CONNECT)
//!   and origin-form targets
//! - Re-serialize the request in origin-form for the upstream server

use axum::http::Method;
use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

use super::{find_head_end, find_header, parse_headers, ParseError, MAX_HEAD_SIZE};

/// Headers that only make sense between the client and the proxy.
const HOP_BY_HOP: &[&str] = &["connection", "proxy-connection", "keep-alive"];

/// A parsed client request as seen by the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyRequest {
    pub method: Method,
    /// Request target exactly as sent by the client.
    pub target: String,
    /// Destination host, from the target or the `Host` header.
    pub host: Option<String>,
    /// Destination port, when the target or `Host` header names one.
    pub port: Option<u16>,
    /// Path and query (empty for CONNECT).
    pub path: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl ProxyRequest {
    /// Parse one request from the front of `buf`.
    ///
    /// Returns `Ok(None)` until the head and the full body are buffered, and
    /// otherwise the request with the number of bytes it occupied.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, ParseError> {
        let head_end = match find_head_end(buf) {
            Some(end) if end > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
            Some(end) => end,
            None if buf.len() > MAX_HEAD_SIZE => return Err(ParseError::HeadTooLarge),
            None => return Ok(None),
        };

        let head = std::str::from_utf8(&buf[..head_end - 4]).map_err(|_| ParseError::InvalidEncoding)?;
        let mut lines = head.split("\r\n");
        let request_line = lines.next().unwrap_or_default();

        let mut parts = request_line.split(' ');
        let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() && v.starts_with("HTTP/") => {
                (m, t, v)
            }
            _ => return Err(ParseError::InvalidRequestLine(request_line.to_string())),
        };
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ParseError::InvalidRequestLine(request_line.to_string()))?;

        let headers = parse_headers(lines)?;

        if let Some(te) = find_header(&headers, "transfer-encoding") {
            if !te.eq_ignore_ascii_case("identity") {
                return Err(ParseError::UnsupportedTransferEncoding);
            }
        }
        let content_length = match find_header(&headers, "content-length") {
            Some(v) => v.parse::<usize>().map_err(|_| ParseError::InvalidContentLength)?,
            None => 0,
        };

        let total = head_end + content_length;
        if buf.len() < total {
            return Ok(None);
        }

        let (host, port, path) = resolve_target(&method, target, &headers)?;

        Ok(Some((
            Self {
                method,
                target: target.to_string(),
                host,
                port,
                path,
                version: version.to_string(),
                headers,
                body: Bytes::copy_from_slice(&buf[head_end..total]),
            },
            total,
        )))
    }

    /// Whether this request asks for a tunnel.
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    /// First header value with the given name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Host and port to dial for this request.
    pub fn authority(&self) -> Option<(&str, u16)> {
        let host = self.host.as_deref()?;
        let default_port = if self.target.starts_with("https://") || self.is_connect() { 443 } else { 80 };
        Some((host, self.port.unwrap_or(default_port)))
    }

    /// Serialize in origin-form for the upstream server.
    ///
    /// Hop-by-hop headers are dropped and `Connection: close` is appended, so the
    /// upstream marks the end of its response by closing the connection.
    pub fn to_upstream_bytes(&self) -> Bytes {
        let path = if self.path.is_empty() { "/" } else { self.path.as_str() };

        let mut out = BytesMut::with_capacity(256 + self.body.len());
        out.put_slice(format!("{} {} {}\r\n", self.method, path, self.version).as_bytes());

        if self.header("host").is_none() {
            if let Some(host) = &self.host {
                match self.port {
                    Some(port) if port != 80 => out.put_slice(format!("Host: {host}:{port}\r\n").as_bytes()),
                    _ => out.put_slice(format!("Host: {host}\r\n").as_bytes()),
                }
            }
        }
        for (name, value) in &self.headers {
            if HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)) {
                continue;
            }
            out.put_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.put_slice(b"Connection: close\r\n\r\n");
        out.put_slice(&self.body);
        out.freeze()
    }
}

fn resolve_target(
    method: &Method,
    target: &str,
    headers: &[(String, String)],
) -> Result<(Option<String>, Option<u16>, String), ParseError> {
    let invalid = || ParseError::InvalidTarget(target.to_string());

    if *method == Method::CONNECT {
        let (host, port) = split_host_port(target).ok_or_else(invalid)?;
        return Ok((Some(host), Some(port.ok_or_else(invalid)?), String::new()));
    }

    if target.starts_with("http://") || target.starts_with("https://") {
        let url = Url::parse(target).map_err(|_| invalid())?;
        let host = url.host_str().ok_or_else(invalid)?.to_string();
        let mut path = url.path().to_string();
        if let Some(query) = url.query() {
            path.push('?');
            path.push_str(query);
        }
        return Ok((Some(host), url.port(), path));
    }

    if target.starts_with('/') || target == "*" {
        let (host, port) = match find_header(headers, "host") {
            Some(value) => {
                let (host, port) = split_host_port(value).ok_or_else(invalid)?;
                (Some(host), port)
            }
            None => (None, None),
        };
        return Ok((host, port, target.to_string()));
    }

    Err(invalid())
}

/// Split `host[:port]`, leaving bracketed IPv6 literals intact.
fn split_host_port(value: &str) -> Option<(String, Option<u16>)> {
    if value.is_empty() {
        return None;
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !port.contains(']') => {
            let port = port.parse::<u16>().ok()?;
            Some((host.to_string(), Some(port)))
        }
        _ => Some((value.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(raw: &[u8]) -> ProxyRequest {
        let (request, used) = ProxyRequest::parse(raw).unwrap().expect("complete request");
        assert_eq!(used, raw.len());
        request
    }

    #[test]
    fn absolute_form_target() {
        let request = parse_one(b"GET http://example.org:8080/get?x=1 HTTP/1.1\r\nHost: example.org\r\n\r\n");
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.host.as_deref(), Some("example.org"));
        assert_eq!(request.port, Some(8080));
        assert_eq!(request.path, "/get?x=1");
        assert_eq!(request.authority(), Some(("example.org", 8080)));
    }

    #[test]
    fn origin_form_uses_host_header() {
        let request = parse_one(b"GET /get HTTP/1.1\r\nHost: example.test\r\n\r\n");
        assert_eq!(request.host.as_deref(), Some("example.test"));
        assert_eq!(request.port, None);
        assert_eq!(request.authority(), Some(("example.test", 80)));
    }

    #[test]
    fn connect_target() {
        let request = parse_one(b"CONNECT example.org:443 HTTP/1.1\r\nHost: example.org:443\r\n\r\n");
        assert!(request.is_connect());
        assert_eq!(request.authority(), Some(("example.org", 443)));
        assert!(request.path.is_empty());
    }

    #[test]
    fn incomplete_body_waits() {
        let raw = b"POST http://example.org/post HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(ProxyRequest::parse(raw).unwrap(), None);
        assert_eq!(ProxyRequest::parse(b"GET / HTTP/1.1\r\n").unwrap(), None);
    }

    #[test]
    fn pipelined_requests_parse_one_at_a_time() {
        let raw = b"GET http://a/1 HTTP/1.1\r\n\r\nGET http://a/2 HTTP/1.1\r\n\r\n";
        let (first, used) = ProxyRequest::parse(raw).unwrap().unwrap();
        assert_eq!(first.path, "/1");
        let (second, _) = ProxyRequest::parse(&raw[used..]).unwrap().unwrap();
        assert_eq!(second.path, "/2");
    }

    #[test]
    fn rejects_chunked_and_bad_lines() {
        let chunked = b"POST http://a/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert_eq!(ProxyRequest::parse(chunked), Err(ParseError::UnsupportedTransferEncoding));

        let bad = b"GET\r\n\r\n";
        assert!(matches!(ProxyRequest::parse(bad), Err(ParseError::InvalidRequestLine(_))));

        let bad_target = b"GET example.org HTTP/1.1\r\n\r\n";
        assert!(matches!(ProxyRequest::parse(bad_target), Err(ParseError::InvalidTarget(_))));
    }

    #[test]
    fn oversized_head_rejected() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
        assert_eq!(ProxyRequest::parse(&raw), Err(ParseError::HeadTooLarge));
    }

    #[test]
    fn upstream_bytes_are_origin_form() {
        let request = parse_one(
            b"POST http://example.org/post HTTP/1.1\r\nProxy-Connection: keep-alive\r\nContent-Length: 2\r\n\r\nhi",
        );
        let bytes = request.to_upstream_bytes();
        assert_eq!(
            &bytes[..],
            &b"POST /post HTTP/1.1\r\nHost: example.org\r\nContent-Length: 2\r\nConnection: close\r\n\r\nhi"[..]
        );
    }
}
