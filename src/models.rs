//! Core data models shared by the cache, evaluator and router

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use xxhash_rust::xxh3::xxh3_64;

/// Identifies one cached representation of a resource
///
/// The path is the normalized request path (percent-decoded, query removed,
/// index file applied). The variant distinguishes content-negotiated
/// representations of the same path, e.g. an encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    path: String,
    variant: Option<String>,
}

impl CacheKey {
    /// Create a key for the identity representation of a path
    pub fn new(path: impl Into<String>) -> Self {
        CacheKey {
            path: path.into(),
            variant: None,
        }
    }

    /// Create a key for a negotiated variant of a path
    ///
    /// The router only serves identity representations today, so it always
    /// uses [`CacheKey::new`]. A handler that serves pre-encoded files keyed
    /// by `Accept-Encoding` would key them with this constructor so that each
    /// encoding gets its own entry, ETag and LRU slot.
    pub fn with_variant(path: impl Into<String>, variant: impl Into<String>) -> Self {
        CacheKey {
            path: path.into(),
            variant: Some(variant.into()),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{};{}", self.path, variant),
            None => f.write_str(&self.path),
        }
    }
}

/// How the cache participated in serving a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheOutcome {
    /// Served from a valid cache entry
    Hit,
    /// Read from disk (and cached when the body fit)
    Miss,
    /// Cache reads and writes were disabled for this request
    Bypass,
    /// The cache was never consulted (protocol, method or resolution error)
    None,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
            CacheOutcome::Bypass => "bypass",
            CacheOutcome::None => "none",
        }
    }

    /// Value for the X-Cache-Status response header
    pub fn header_value(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "HIT",
            CacheOutcome::Miss => "MISS",
            CacheOutcome::Bypass => "BYPASS",
            CacheOutcome::None => "NONE",
        }
    }
}

impl fmt::Display for CacheOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validators of a resource, as consumed by the conditional evaluator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMeta {
    /// Quoted entity tag, e.g. `"9f1c...-2a"`
    pub etag: String,
    /// Modification time of the source file
    pub last_modified: SystemTime,
    /// Body length in bytes
    pub size: u64,
    pub content_type: String,
}

/// Strong ETag derived from the body contents
///
/// Format: `"<xxh3-64 hex>-<size hex>"`. Identical bytes always produce the
/// same tag, across restarts included.
pub fn content_etag(body: &[u8]) -> String {
    format!("\"{:016x}-{:x}\"", xxh3_64(body), body.len())
}

/// ETag for bodies that are streamed without being loaded
///
/// Format: `"<size hex>-<mtime nanos hex>"`.
pub fn stat_etag(size: u64, modified: SystemTime) -> String {
    let nanos = modified
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos();
    format!("\"{:x}-{:x}\"", size, nanos)
}

/// Drop sub-second precision, matching the resolution of HTTP dates
pub fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let secs = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_variants_are_distinct() {
        let plain = CacheKey::new("/index.html");
        let gzip = CacheKey::with_variant("/index.html", "gzip");

        assert_ne!(plain, gzip);
        assert_eq!(plain.path(), gzip.path());
        assert_eq!(gzip.variant(), Some("gzip"));
        assert_eq!(gzip.to_string(), "/index.html;gzip");
    }

    #[test]
    fn test_content_etag_is_deterministic() {
        let a = content_etag(b"<html>hello</html>");
        let b = content_etag(b"<html>hello</html>");
        let c = content_etag(b"<html>hello!</html>");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with('"') && a.ends_with('"'));
    }

    #[test]
    fn test_stat_etag_changes_with_mtime() {
        let t1 = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let t2 = t1 + Duration::from_millis(1);

        assert_eq!(stat_etag(10, t1), stat_etag(10, t1));
        assert_ne!(stat_etag(10, t1), stat_etag(10, t2));
        assert_ne!(stat_etag(10, t1), stat_etag(11, t1));
    }

    #[test]
    fn test_truncate_to_seconds() {
        let t = UNIX_EPOCH + Duration::from_millis(1_700_000_000_750);
        assert_eq!(
            truncate_to_seconds(t),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000)
        );
    }

    #[test]
    fn test_outcome_names() {
        assert_eq!(CacheOutcome::Hit.as_str(), "hit");
        assert_eq!(CacheOutcome::Bypass.header_value(), "BYPASS");
        assert_eq!(serde_json::to_string(&CacheOutcome::Miss).unwrap(), "\"miss\"");
    }
}
