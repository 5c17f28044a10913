//! Static Cache Server
//!
//! A static file server for HTTP/1.1 that keeps recently requested files in an
//! in-memory cache and answers conditional requests with `304 Not Modified`.
//!
//! # Overview
//!
//! Each accepted TCP connection runs in its own task and may carry several
//! requests (keep-alive, pipelining). Request paths are resolved inside a
//! document root; file bodies are served from the cache when a valid entry
//! exists and read from disk otherwise. Large files are streamed from disk in
//! fixed-size chunks without being cached.
//!
//! # Features
//!
//! - **TTL + LRU cache**: entries expire after a fixed TTL and the least
//!   recently used entry is evicted when the entry or byte bound is exceeded
//! - **Single-flight loading**: concurrent misses on one file read it once
//! - **Conditional requests**: strong `ETag` / `If-None-Match` and
//!   `Last-Modified` / `If-Modified-Since`
//! - **Chunked delivery**: bounded writes; client disconnects are reported as
//!   partial transfers and never affect the cache
//! - **Cache bypass**: globally through configuration or per request with
//!   `X-Cache-Bypass: true`
//! - **Observability**: one structured event per request, an access log,
//!   Prometheus metrics and an optional metrics endpoint
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use static_cache_server::{LogRecorder, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_file("static_cache_server.yaml")?;
//! let server = Server::bind(config, Arc::new(LogRecorder)).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`Server`]: listener, connection limit and per-connection request loop
//! - [`Router`]: path resolution, cache lookup and response delivery
//! - [`ContentCache`]: the TTL + LRU content cache with per-key load gates
//! - [`conditional`]: pure conditional-request decision logic
//! - [`StreamWriter`]: chunked body writes from memory or from a file
//! - [`EventRecorder`]: sink for per-request [`RequestEvent`]s
//! - [`ServerMetrics`] / [`MetricsEndpoint`]: Prometheus metrics
//!
//! # Configuration
//!
//! Configuration is loaded from a YAML file; every field has a default:
//!
//! ```yaml
//! listen_address: "0.0.0.0:8080"
//! document_root: "www"
//! keep_alive_timeout: 5
//! chunk_size: 65536
//! cache:
//!   ttl: 30
//!   max_entries: 128
//!   max_bytes: 67108864
//! ```
//!
//! See [`ServerConfig`] for all options.
//!
//! # Error Handling
//!
//! Fallible operations return [`ServeError`]. Request-level errors map to HTTP
//! statuses through [`ServeError::to_http_status`]; only failing to bind the
//! listener stops the server.
//!
//! ```rust,no_run
//! use static_cache_server::{ServeError, ServerConfig};
//!
//! # fn main() {
//! match ServerConfig::from_file("config.yaml") {
//!     Ok(_) => println!("Config loaded successfully"),
//!     Err(ServeError::ConfigError(msg)) => eprintln!("Config error: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! # }
//! ```

pub mod cache;
pub mod conditional;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod metrics_endpoint;
pub mod models;
pub mod request;
pub mod resolve;
pub mod response;
pub mod router;
pub mod server;
pub mod streaming;

// Re-export commonly used types
pub use cache::{CacheEntry, CacheStats, ContentCache};
pub use conditional::{evaluate, Decision, Validators};
pub use config::{CacheConfig, MetricsEndpointConfig, ServerConfig};
pub use error::{Result, ServeError};
pub use events::{ChannelRecorder, EventRecorder, FanoutRecorder, LogRecorder, RequestEvent};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use metrics_endpoint::MetricsEndpoint;
pub use models::{CacheKey, CacheOutcome, ResourceMeta};
pub use request::Request;
pub use resolve::PathResolver;
pub use router::Router;
pub use server::Server;
pub use streaming::{BodySource, StreamOutcome, StreamWriter, TransferFailure};
