//! Request routing: path resolution, cache lookup, conditional evaluation
//! and response delivery for a single request

use crate::cache::{CacheEntry, ContentCache};
use crate::conditional::{evaluate, is_supported_method, Decision, Validators};
use crate::config::ServerConfig;
use crate::error::{Result, ServeError};
use crate::events::{EventRecorder, RequestEvent};
use crate::models::{content_etag, stat_etag, CacheKey, CacheOutcome, ResourceMeta};
use crate::request::Request;
use crate::resolve::PathResolver;
use crate::response::{content_type_for, error_body, ResponseHead};
use crate::streaming::{BodySource, StreamOutcome, StreamWriter, TransferFailure};
use bytes::Bytes;
use http::{Method, StatusCode};
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error, warn};

/// A resource ready to be served
struct Resource {
    meta: ResourceMeta,
    body: Body,
    cache: CacheOutcome,
}

enum Body {
    Memory(Bytes),
    /// Open file positioned at its start, streamed without loading
    File(File),
}

impl Resource {
    fn from_entry(entry: &CacheEntry, cache: CacheOutcome) -> Self {
        Resource {
            meta: entry.meta(),
            body: Body::Memory(entry.body()),
            cache,
        }
    }

    fn into_source(self) -> BodySource {
        match self.body {
            Body::Memory(bytes) => BodySource::Memory(bytes),
            Body::File(file) => BodySource::File {
                file,
                len: self.meta.size,
            },
        }
    }
}

/// Identity of the request being answered, for logging and events
struct Exchange {
    client: Option<SocketAddr>,
    method: String,
    path: String,
    head_only: bool,
    started: Instant,
}

/// Answers parsed requests on behalf of a connection
pub struct Router {
    config: Arc<ServerConfig>,
    cache: Arc<ContentCache>,
    resolver: PathResolver,
    writer: StreamWriter,
    recorder: Arc<dyn EventRecorder>,
}

impl Router {
    pub fn new(
        config: Arc<ServerConfig>,
        cache: Arc<ContentCache>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Self {
        let resolver = PathResolver::new(&config.document_root, config.index_file.clone());
        let writer = StreamWriter::new(config.chunk_size);
        Router {
            config,
            cache,
            resolver,
            writer,
            recorder,
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Answer one request and report whether the connection may be reused
    ///
    /// Never fails: every problem becomes an error response or a partial
    /// transfer, and exactly one event is recorded.
    pub async fn handle<W>(&self, req: &Request, client: Option<SocketAddr>, dst: &mut W) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        let exchange = Exchange {
            client,
            method: req.method.to_string(),
            path: req.path().to_string(),
            head_only: req.method == Method::HEAD,
            started: Instant::now(),
        };
        // A body left unread on the socket would be parsed as the next request
        let keep_alive =
            self.config.keep_alive && req.wants_keep_alive() && req.body.is_discardable();

        if !is_supported_method(&req.method) {
            let err = ServeError::MethodNotAllowed(req.method.to_string());
            return self.send_error(&exchange, &err, keep_alive, dst).await;
        }

        let resource = match self.locate(req).await {
            Ok(resource) => resource,
            Err(err) => return self.send_error(&exchange, &err, keep_alive, dst).await,
        };

        let validators = Validators::from_headers(&req.headers);
        match evaluate(&req.method, &validators, Some(&resource.meta)) {
            Decision::Full { send_body } => {
                let head = self.resource_head(StatusCode::OK, &resource, keep_alive);
                let cache = resource.cache;
                let body = send_body.then(|| resource.into_source());
                let outcome = self.write(&head, body, dst).await;
                self.record(&exchange, StatusCode::OK, cache, outcome);
                keep_alive && outcome.is_complete()
            }
            Decision::NotModified => {
                let head = self.resource_head(StatusCode::NOT_MODIFIED, &resource, keep_alive);
                let outcome = self.write(&head, None, dst).await;
                self.record(&exchange, StatusCode::NOT_MODIFIED, resource.cache, outcome);
                keep_alive && outcome.is_complete()
            }
            Decision::NotFound => {
                let err = ServeError::NotFound(exchange.path.clone());
                self.send_error(&exchange, &err, keep_alive, dst).await
            }
            Decision::MethodNotAllowed => {
                let err = ServeError::MethodNotAllowed(exchange.method.clone());
                self.send_error(&exchange, &err, keep_alive, dst).await
            }
        }
    }

    /// Answer a request head that could not be parsed with 400 and close
    pub async fn reject_malformed<W>(&self, err: &ServeError, client: Option<SocketAddr>, dst: &mut W)
    where
        W: AsyncWrite + Unpin,
    {
        debug!("Rejecting malformed request: {}", err);
        let exchange = Exchange {
            client,
            method: "-".to_string(),
            path: "-".to_string(),
            head_only: false,
            started: Instant::now(),
        };
        let err = match err {
            ServeError::ParseError(_) => err.clone(),
            other => ServeError::parse(other.to_string()),
        };
        self.send_error(&exchange, &err, false, dst).await;
    }

    /// Find the resource for a request, going through the cache unless
    /// bypassed
    async fn locate(&self, req: &Request) -> Result<Resource> {
        let resolved = self.resolver.resolve(req.path())?;
        let key = CacheKey::new(resolved.key_path.clone());
        let content_type = content_type_for(&resolved.fs_path);
        let caching = self.config.cache.enabled && !req.bypass_requested();
        let trust_cache = caching && !self.config.cache.validate_on_hit;

        // Unvalidated hits never touch the filesystem
        if trust_cache {
            if let Some(entry) = self.cache.get(&key) {
                return Ok(Resource::from_entry(&entry, CacheOutcome::Hit));
            }
        }

        let path = match self.resolver.confine(&resolved).await {
            Ok(path) => path,
            Err(err) => {
                if caching && matches!(err, ServeError::NotFound(_)) {
                    self.cache.invalidate(&key);
                }
                return Err(err);
            }
        };

        if !caching {
            debug!("Cache bypassed: key={}", key);
            return self
                .load(key, &path, content_type, CacheOutcome::Bypass)
                .await;
        }

        if !trust_cache {
            if let Some(entry) = self.fresh_hit(&key, &path).await? {
                return Ok(Resource::from_entry(&entry, CacheOutcome::Hit));
            }
        }

        // Concurrent misses on the same key queue here; whoever gets the gate
        // after the first loader finds the entry already in place
        let _gate = self.cache.lock_key(&key).await;
        if let Some(entry) = self.fresh_hit(&key, &path).await? {
            return Ok(Resource::from_entry(&entry, CacheOutcome::Hit));
        }

        self.load(key, &path, content_type, CacheOutcome::Miss).await
    }

    /// Cache lookup that drops entries whose file changed or disappeared
    async fn fresh_hit(&self, key: &CacheKey, path: &Path) -> Result<Option<Arc<CacheEntry>>> {
        let Some(entry) = self.cache.get(key) else {
            return Ok(None);
        };

        if !self.config.cache.validate_on_hit {
            return Ok(Some(entry));
        }

        match tokio::fs::metadata(path).await {
            Ok(meta)
                if meta.len() == entry.size() as u64
                    && meta.modified().ok() == Some(entry.last_modified()) =>
            {
                Ok(Some(entry))
            }
            Ok(_) => {
                debug!("File changed on disk, invalidating: key={}", key);
                self.cache.invalidate(key);
                Ok(None)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("File removed from disk, invalidating: key={}", key);
                self.cache.invalidate(key);
                Err(ServeError::NotFound(key.path().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a file from disk
    ///
    /// Files above `max_entry_bytes`, or whose buffer cannot be allocated,
    /// are returned as an open file to stream. Everything else is read into
    /// memory and, for a `Miss`, stored in the cache.
    async fn load(
        &self,
        key: CacheKey,
        path: &Path,
        content_type: String,
        cache: CacheOutcome,
    ) -> Result<Resource> {
        let mut file = File::open(path).await.map_err(|e| open_error(&key, e))?;
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(ServeError::NotFound(key.path().to_string()));
        }

        let size = metadata.len();
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);

        let mut buf = Vec::new();
        let loadable = size <= self.config.cache.max_entry_bytes as u64
            && usize::try_from(size)
                .map(|len| buf.try_reserve_exact(len).is_ok())
                .unwrap_or(false);

        if !loadable {
            if size <= self.config.cache.max_entry_bytes as u64 {
                warn!("Could not reserve {} bytes for {}, streaming from disk", size, key);
            } else {
                debug!("Streaming large file from disk: key={}, size={}", key, size);
            }
            return Ok(Resource {
                meta: ResourceMeta {
                    etag: stat_etag(size, modified),
                    last_modified: modified,
                    size,
                    content_type,
                },
                body: Body::File(file),
                cache,
            });
        }

        read_fully(&mut file, &mut buf, &key).await?;
        let body = Bytes::from(buf);

        if cache == CacheOutcome::Miss {
            let entry = self
                .cache
                .put(key, body, content_type, modified, self.config.cache.ttl());
            return Ok(Resource::from_entry(&entry, cache));
        }

        Ok(Resource {
            meta: ResourceMeta {
                etag: content_etag(&body),
                last_modified: modified,
                size: body.len() as u64,
                content_type,
            },
            body: Body::Memory(body),
            cache,
        })
    }

    fn resource_head(&self, status: StatusCode, resource: &Resource, keep_alive: bool) -> ResponseHead {
        let meta = &resource.meta;
        let mut head = ResponseHead::new(status, &self.config.server_name);
        if status == StatusCode::OK {
            head.set("content-type", &meta.content_type)
                .set("content-length", meta.size.to_string());
        }
        head.set("etag", &meta.etag)
            .set("last-modified", httpdate::fmt_http_date(meta.last_modified))
            .set(
                "cache-control",
                format!("public, max-age={}", self.config.cache_control_max_age),
            )
            .set("x-cache-status", resource.cache.header_value())
            .set("connection", connection_value(keep_alive));
        head
    }

    async fn send_error<W>(&self, exchange: &Exchange, err: &ServeError, keep_alive: bool, dst: &mut W) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        let status = StatusCode::from_u16(err.to_http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let keep_alive = keep_alive && !err.closes_connection();

        if status.is_server_error() {
            error!("{} {} failed: {}", exchange.method, exchange.path, err);
        } else {
            debug!("{} {} -> {}: {}", exchange.method, exchange.path, status.as_u16(), err);
        }

        let body = error_body(status);
        let mut head = ResponseHead::new(status, &self.config.server_name);
        head.set("content-type", "text/html; charset=utf-8")
            .set("content-length", body.len().to_string())
            .set("connection", connection_value(keep_alive));
        if status == StatusCode::METHOD_NOT_ALLOWED {
            head.set("allow", "GET, HEAD");
        }

        let body = (!exchange.head_only).then_some(BodySource::Memory(body));
        let outcome = self.write(&head, body, dst).await;
        self.record(exchange, status, CacheOutcome::None, outcome);
        keep_alive && outcome.is_complete()
    }

    async fn write<W>(&self, head: &ResponseHead, body: Option<BodySource>, dst: &mut W) -> StreamOutcome
    where
        W: AsyncWrite + Unpin,
    {
        if let Err(e) = self.writer.write_head(&head.to_bytes(), dst).await {
            debug!("Client went away before the response head was sent: {}", e);
            return StreamOutcome {
                bytes_sent: 0,
                failure: Some(TransferFailure::Client),
            };
        }

        // An empty memory body still flushes the head
        let source = body.unwrap_or(BodySource::Memory(Bytes::new()));
        self.writer.write_body(source, dst).await
    }

    fn record(&self, exchange: &Exchange, status: StatusCode, cache: CacheOutcome, outcome: StreamOutcome) {
        self.recorder.record(&RequestEvent {
            timestamp: SystemTime::now(),
            client_addr: exchange.client,
            method: exchange.method.clone(),
            path: exchange.path.clone(),
            status: status.as_u16(),
            cache,
            bytes_sent: outcome.bytes_sent,
            latency: exchange.started.elapsed(),
            complete: outcome.is_complete(),
        });
    }
}

fn connection_value(keep_alive: bool) -> &'static str {
    if keep_alive {
        "keep-alive"
    } else {
        "close"
    }
}

fn open_error(key: &CacheKey, e: io::Error) -> ServeError {
    match e.kind() {
        io::ErrorKind::NotFound => ServeError::NotFound(key.path().to_string()),
        io::ErrorKind::PermissionDenied => ServeError::Forbidden(key.path().to_string()),
        _ => ServeError::IoError(format!("open failed for {}: {}", key, e)),
    }
}

/// Read a whole body into a buffer already sized for it
///
/// A failure after a successful open is a server fault, not a client one.
async fn read_fully<R>(src: &mut R, buf: &mut Vec<u8>, key: &CacheKey) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    src.read_to_end(buf).await.map_err(|e| {
        error!("Failed to read {}: {}", key, e);
        ServeError::IoError(format!("read failed for {}", key))
    })?;
    Ok(())
}
