//! Response heads and canned error responses

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::path::Path;
use std::time::SystemTime;

/// Status line and headers of a response
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Start a response with the headers every response carries
    pub fn new(status: StatusCode, server_name: &str) -> Self {
        let mut head = ResponseHead {
            status,
            headers: HeaderMap::new(),
        };
        head.set("date", httpdate::fmt_http_date(SystemTime::now()));
        head.set("server", server_name);
        head
    }

    /// Set a header, replacing any previous value
    ///
    /// Values that are not valid header text are dropped.
    pub fn set(&mut self, name: &'static str, value: impl AsRef<str>) -> &mut Self {
        if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
            self.headers.insert(HeaderName::from_static(name), value);
        }
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Serialize as an HTTP/1.1 status line plus header block
    pub fn to_bytes(&self) -> Vec<u8> {
        let reason = self.status.canonical_reason().unwrap_or("Unknown");
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), reason).as_bytes());
        for (name, value) in &self.headers {
            out.extend_from_slice(display_name(name).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

// HeaderMap lowercases names; emit the conventional capitalization
fn display_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|part| match part {
            "etag" => "ETag".to_string(),
            _ => {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Small HTML body used for every error status
pub fn error_body(status: StatusCode) -> Bytes {
    let reason = status.canonical_reason().unwrap_or("Error");
    Bytes::from(format!("<h1>{} {}</h1>", status.as_u16(), reason))
}

/// Content type for a file, from its extension
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT && mime.get_param("charset").is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.essence_str().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_head() {
        let mut head = ResponseHead::new(StatusCode::NOT_MODIFIED, "test/1.0");
        head.set("etag", "\"abc\"").set("connection", "keep-alive");

        let text = String::from_utf8(head.to_bytes()).unwrap();
        assert!(text.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(text.contains("\r\nETag: \"abc\"\r\n"));
        assert!(text.contains("\r\nConnection: keep-alive\r\n"));
        assert!(text.contains("\r\nServer: test/1.0\r\n"));
        assert!(text.contains("\r\nDate: "));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_set_replaces() {
        let mut head = ResponseHead::new(StatusCode::OK, "s");
        head.set("connection", "keep-alive");
        head.set("connection", "close");
        assert_eq!(head.header("connection"), Some("close"));
        assert_eq!(head.headers.get_all("connection").iter().count(), 1);
    }

    #[test]
    fn test_invalid_value_dropped() {
        let mut head = ResponseHead::new(StatusCode::OK, "s");
        head.set("x-cache-status", "bad\r\nvalue");
        assert!(head.header("x-cache-status").is_none());
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(&HeaderName::from_static("content-length")), "Content-Length");
        assert_eq!(display_name(&HeaderName::from_static("x-cache-status")), "X-Cache-Status");
        assert_eq!(display_name(&HeaderName::from_static("etag")), "ETag");
    }

    #[test]
    fn test_error_body() {
        assert_eq!(error_body(StatusCode::NOT_FOUND), Bytes::from_static(b"<h1>404 Not Found</h1>"));
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for(Path::new("index.html")), "text/html; charset=utf-8");
        assert_eq!(content_type_for(Path::new("style.CSS")), "text/css; charset=utf-8");
        assert_eq!(content_type_for(Path::new("photo.png")), "image/png");
        assert_eq!(content_type_for(Path::new("image.JPEG")), "image/jpeg");
        assert_eq!(content_type_for(Path::new("no_extension")), "application/octet-stream");
    }
}
