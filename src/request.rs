//! HTTP/1.x request head parsing

use crate::error::{Result, ServeError};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Header that disables cache reads and writes for one request
pub const CACHE_BYPASS_HEADER: &str = "x-cache-bypass";

/// Largest request body skipped to keep a connection reusable
pub const MAX_DISCARDED_BODY_BYTES: u64 = 64 * 1024;

/// How the body following a request head is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody {
    /// No body
    Empty,
    /// Exactly this many bytes follow the head
    Length(u64),
    /// Transfer-Encoding framing; never decoded
    Encoded,
}

impl RequestBody {
    /// Whether the body can be read off the connection and dropped so the
    /// next request starts at a known offset
    pub fn is_discardable(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Length(len) => *len <= MAX_DISCARDED_BODY_BYTES,
            RequestBody::Encoded => false,
        }
    }
}

/// A parsed request head; bodies are skipped, never interpreted
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    /// Raw request target as sent, e.g. `/docs/a%20b.html?x=1`
    pub target: String,
    pub version: Version,
    /// Unique header names; a repeated header keeps its last value
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl Request {
    /// Parse a complete request head (request line plus header lines)
    ///
    /// The request line must be exactly `METHOD SP TARGET SP VERSION`, with
    /// the version one of HTTP/1.0 or HTTP/1.1. Lines may end in CRLF or LF.
    pub fn parse(head: &[u8]) -> Result<Request> {
        let text = std::str::from_utf8(head)
            .map_err(|_| ServeError::parse("request head is not valid UTF-8"))?;

        let mut lines = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .skip_while(|line| line.is_empty());

        let request_line = lines
            .next()
            .ok_or_else(|| ServeError::parse("empty request"))?;
        let (method, target, version) = parse_request_line(request_line)?;

        let mut headers = HeaderMap::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            let (name, value) = parse_header_line(line)?;
            if name == CONTENT_LENGTH && headers.get(&name).is_some_and(|prev| *prev != value) {
                return Err(ServeError::parse("conflicting Content-Length headers"));
            }
            headers.insert(name, value);
        }

        let body = body_framing(&headers)?;
        Ok(Request {
            method,
            target,
            version,
            headers,
            body,
        })
    }

    /// Target without its query string
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(idx) => &self.target[..idx],
            None => &self.target,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the client is willing to keep the connection open
    ///
    /// HTTP/1.1 is persistent unless `Connection: close` is sent; HTTP/1.0
    /// only with an explicit `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        let has_token = |token: &str| {
            self.headers
                .get(CONNECTION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
                .unwrap_or(false)
        };

        if has_token("close") {
            return false;
        }

        match self.version {
            Version::HTTP_11 => true,
            _ => has_token("keep-alive"),
        }
    }

    /// Whether this request asked to skip the cache
    pub fn bypass_requested(&self) -> bool {
        self.header(CACHE_BYPASS_HEADER)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(ServeError::parse(format!(
            "request line must be 'METHOD TARGET VERSION', got: {}",
            line
        )));
    }

    let method = Method::from_bytes(parts[0].as_bytes())
        .map_err(|_| ServeError::parse(format!("invalid method: {}", parts[0])))?;

    let target = parts[1];
    if !target.starts_with('/') {
        return Err(ServeError::parse(format!("unsupported request target: {}", target)));
    }
    if target.bytes().any(|b| b.is_ascii_control()) {
        return Err(ServeError::parse("control character in request target"));
    }

    let version = match parts[2] {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        other => {
            return Err(ServeError::parse(format!("unsupported protocol version: {}", other)));
        }
    };

    Ok((method, target.to_string(), version))
}

fn body_framing(headers: &HeaderMap) -> Result<RequestBody> {
    let length = headers.get(CONTENT_LENGTH);
    let encoding = headers.get(TRANSFER_ENCODING);

    match (length, encoding) {
        (Some(_), Some(_)) => Err(ServeError::parse(
            "both Content-Length and Transfer-Encoding present",
        )),
        (None, Some(_)) => Ok(RequestBody::Encoded),
        (None, None) => Ok(RequestBody::Empty),
        (Some(value), None) => {
            let text = value
                .to_str()
                .ok()
                .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
                .ok_or_else(|| ServeError::parse("invalid Content-Length"))?;
            let len: u64 = text
                .parse()
                .map_err(|_| ServeError::parse("Content-Length out of range"))?;
            Ok(if len == 0 {
                RequestBody::Empty
            } else {
                RequestBody::Length(len)
            })
        }
    }
}

fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue)> {
    if line.starts_with(' ') || line.starts_with('\t') {
        return Err(ServeError::parse("obsolete header line folding"));
    }

    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| ServeError::parse(format!("header line without ':': {}", line)))?;

    let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ServeError::parse(format!("invalid header name: {}", name)))?;
    let value = HeaderValue::from_str(value.trim())
        .map_err(|_| ServeError::parse(format!("invalid value for header {}", name)))?;

    Ok((name, value))
}

/// Read one request head from a buffered connection
///
/// Returns `Ok(None)` when the peer closed the connection before sending
/// anything. A head longer than `max_bytes` or a malformed head is a
/// `ParseError`; a connection lost mid-head is an `IoError`.
pub async fn read_request<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Request>>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    let mut seen_request_line = false;

    loop {
        let remaining = max_bytes.saturating_sub(head.len());
        if remaining == 0 {
            return Err(ServeError::parse(format!(
                "request head exceeds {} bytes",
                max_bytes
            )));
        }

        let start = head.len();
        let n = (&mut *reader)
            .take(remaining as u64)
            .read_until(b'\n', &mut head)
            .await?;

        if n == 0 {
            if head.iter().all(|b| *b == b'\r' || *b == b'\n') {
                return Ok(None);
            }
            return Err(ServeError::IoError(
                "connection closed in the middle of a request".to_string(),
            ));
        }

        if !head.ends_with(b"\n") {
            // Hit the size cap without finishing the line
            continue;
        }

        let line = &head[start..];
        let blank = line == b"\r\n" || line == b"\n";
        if blank {
            if seen_request_line {
                break;
            }
            // Tolerate stray blank lines between pipelined requests
            head.clear();
            continue;
        }
        seen_request_line = true;
    }

    Request::parse(&head).map(Some)
}

/// Read and drop a request body of known length
///
/// A peer that closes before sending all of it is an `IoError`.
pub async fn discard_body<R>(reader: &mut R, body: RequestBody) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let RequestBody::Length(len) = body else {
        return Ok(());
    };

    let skipped = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    if skipped < len {
        return Err(ServeError::IoError(format!(
            "connection closed after {} of {} body bytes",
            skipped, len
        )));
    }
    Ok(())
}
