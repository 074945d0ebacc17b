//! HTTP/1.1 message handling.
//!
//! # Data Flow
//! ```text
//! client bytes
//!     → request.rs (ProxyRequest::parse: head + Content-Length body)
//!     → cache interceptor / proxy engine
//!     → request.rs (to_upstream_bytes: origin-form for the upstream)
//!
//! stored upstream bytes
//!     → response.rs (CachedResponse::parse)
//!     → response.rs (build_http_response: replay to client)
//! ```
//!
//! # Design Decisions
//! - Header order and case are preserved so replays match what was recorded
//! - Response bodies are kept raw (no chunked decoding); the framing headers
//!   travel with them
//! - Only what the proxy needs is parsed; anything else is rejected early

pub mod request;
pub mod response;

use thiserror::Error;

pub use request::ProxyRequest;
pub use response::{build_http_response, CachedResponse};

/// Value of the `Server` header on responses the proxy synthesizes itself.
pub const PROXY_AGENT_HEADER_VALUE: &str = concat!("caching-proxy v", env!("CARGO_PKG_VERSION"));

/// Upper bound for a request or response head.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Errors produced while decoding HTTP/1.1 messages.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("message head exceeds 64 KiB")]
    HeadTooLarge,

    #[error("message head is incomplete")]
    Incomplete,

    #[error("message head is not valid UTF-8")]
    InvalidEncoding,

    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),

    #[error("invalid header line: {0:?}")]
    InvalidHeader(String),

    #[error("invalid request target: {0:?}")]
    InvalidTarget(String),

    #[error("invalid Content-Length value")]
    InvalidContentLength,

    #[error("chunked request bodies are not supported")]
    UnsupportedTransferEncoding,
}

/// Offset just past the `\r\n\r\n` that terminates a message head.
pub(crate) fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Parse `Name: value` header lines, keeping their order.
pub(crate) fn parse_headers<'a, I>(lines: I) -> Result<Vec<(String, String)>, ParseError>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = Vec::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ParseError::InvalidHeader(line.to_string()))?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return Err(ParseError::InvalidHeader(line.to_string()));
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

/// Case-insensitive header lookup returning the first match.
pub(crate) fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}
