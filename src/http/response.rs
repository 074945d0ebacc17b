//! Recorded responses and response serialization.

use bytes::{BufMut, Bytes, BytesMut};

use super::{find_head_end, find_header, parse_headers, ParseError};

/// A complete response decoded from a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    /// Status code; `None` when the status line carries none.
    pub status: Option<u16>,
    pub reason: Option<String>,
    pub headers: Vec<(String, String)>,
    /// Body bytes exactly as recorded, including any transfer framing.
    pub body: Bytes,
}

impl CachedResponse {
    /// Decode raw response bytes as they were received from an upstream.
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let head_end = find_head_end(raw).ok_or(ParseError::Incomplete)?;
        let head = std::str::from_utf8(&raw[..head_end - 4]).map_err(|_| ParseError::InvalidEncoding)?;
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(ParseError::InvalidStatusLine(status_line.to_string()));
        }
        let status = match parts.next() {
            Some(code) if !code.is_empty() => Some(
                code.parse::<u16>()
                    .map_err(|_| ParseError::InvalidStatusLine(status_line.to_string()))?,
            ),
            _ => None,
        };
        let reason = parts.next().filter(|r| !r.is_empty()).map(str::to_string);

        Ok(Self {
            status,
            reason,
            headers: parse_headers(lines)?,
            body: Bytes::copy_from_slice(&raw[head_end..]),
        })
    }

    /// Whether a client can find the end of this response without the
    /// connection closing.
    pub fn is_self_delimited(&self) -> bool {
        if matches!(self.status, Some(100..=199 | 204 | 304)) {
            return true;
        }
        let chunked = find_header(&self.headers, "transfer-encoding")
            .and_then(|codings| codings.rsplit(',').next())
            .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        chunked || find_header(&self.headers, "content-length").is_some()
    }

    /// Whether the response asks for the connection to be closed after it.
    pub fn closes_connection(&self) -> bool {
        find_header(&self.headers, "connection")
            .is_some_and(|tokens| tokens.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
    }

    /// Serialize for replay to a client.
    pub fn to_bytes(&self) -> Bytes {
        build_http_response(
            self.status.unwrap_or(0),
            self.reason.as_deref(),
            self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            &self.body,
        )
    }
}

/// Serialize an HTTP/1.1 response with headers in the given order.
pub fn build_http_response<'a, I>(status: u16, reason: Option<&str>, headers: I, body: &[u8]) -> Bytes
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut out = BytesMut::with_capacity(128 + body.len());
    out.put_slice(format!("HTTP/1.1 {status}").as_bytes());
    if let Some(reason) = reason {
        out.put_u8(b' ');
        out.put_slice(reason.as_bytes());
    }
    out.put_slice(b"\r\n");
    for (name, value) in headers {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.freeze()
}
