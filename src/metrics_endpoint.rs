//! Metrics HTTP Endpoint
//!
//! A small side server, separate from the file server, that exposes request
//! metrics in Prometheus format along with a health probe and a JSON view of
//! the content cache.

use crate::cache::ContentCache;
use crate::metrics::ServerMetrics;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

/// Metrics endpoint server
pub struct MetricsEndpoint {
    metrics: Arc<ServerMetrics>,
    cache: Arc<ContentCache>,
    addr: SocketAddr,
}

/// Body of the `/stats` response
#[derive(Debug, Serialize)]
struct CacheStatsBody {
    entries: usize,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    hit_rate: f64,
    insertions: u64,
    expirations: u64,
    evictions: u64,
    invalidations: u64,
    rejected: u64,
    pending_loads: usize,
}

impl MetricsEndpoint {
    /// Create a new metrics endpoint
    ///
    /// # Example
    /// ```no_run
    /// use static_cache_server::{ContentCache, MetricsEndpoint, ServerMetrics};
    /// use std::sync::Arc;
    ///
    /// let metrics = Arc::new(ServerMetrics::new().unwrap());
    /// let cache = Arc::new(ContentCache::new(128, None));
    /// let endpoint = MetricsEndpoint::new(metrics, cache, "127.0.0.1:9090".parse().unwrap());
    /// ```
    pub fn new(metrics: Arc<ServerMetrics>, cache: Arc<ContentCache>, addr: SocketAddr) -> Self {
        Self {
            metrics,
            cache,
            addr,
        }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = listener.local_addr()?;
        info!("Metrics endpoint listening on http://{}", addr);
        info!("Metrics available at http://{}/metrics", addr);

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let metrics = Arc::clone(&self.metrics);
            let cache = Arc::clone(&self.cache);

            tokio::task::spawn(async move {
                let service = service_fn(move |req| {
                    let metrics = Arc::clone(&metrics);
                    let cache = Arc::clone(&cache);
                    async move { handle_request(req, metrics, cache).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    error!("Error serving metrics connection: {:?}", err);
                }
            });
        }
    }
}

/// Handle incoming HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<ServerMetrics>,
    cache: Arc<ContentCache>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    match req.uri().path() {
        "/metrics" => Ok(metrics_response(&metrics, &cache)),
        "/stats" => Ok(stats_response(&cache)),
        "/health" => Ok(health_response()),
        _ => Ok(not_found_response()),
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Prometheus text exposition, with cache gauges refreshed first
fn metrics_response(metrics: &ServerMetrics, cache: &ContentCache) -> Response<Full<Bytes>> {
    metrics.observe_cache(&cache.stats());

    match metrics.encode() {
        Ok(body) => respond(
            StatusCode::OK,
            "text/plain; version=0.0.4; charset=utf-8",
            body,
        ),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "500 Internal Server Error",
            )
        }
    }
}

fn stats_response(cache: &ContentCache) -> Response<Full<Bytes>> {
    let stats = cache.stats();
    let body = CacheStatsBody {
        entries: stats.entries,
        total_bytes: stats.total_bytes,
        hits: stats.hits,
        misses: stats.misses,
        hit_rate: stats.hit_rate(),
        insertions: stats.insertions,
        expirations: stats.expirations,
        evictions: stats.evictions,
        invalidations: stats.invalidations,
        rejected: stats.rejected,
        pending_loads: cache.pending_loads(),
    };

    match serde_json::to_vec(&body) {
        Ok(json) => respond(StatusCode::OK, "application/json", json),
        Err(e) => {
            error!("Failed to serialize cache stats: {}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                "500 Internal Server Error",
            )
        }
    }
}

/// Generate health check response
fn health_response() -> Response<Full<Bytes>> {
    respond(StatusCode::OK, "application/json", r#"{"status":"healthy"}"#)
}

fn not_found_response() -> Response<Full<Bytes>> {
    respond(StatusCode::NOT_FOUND, "text/plain", "404 Not Found")
}
