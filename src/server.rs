//! TCP listener and per-connection request loop
//!
//! One task per accepted connection, capped by a semaphore. When every permit
//! is taken the accept loop waits, leaving new connections queued in the
//! kernel backlog. Each connection reads, answers and writes requests strictly
//! in order until the client or the router asks to close, the idle timeout
//! fires or a request head is malformed. Request bodies are read and dropped.

use crate::cache::ContentCache;
use crate::config::ServerConfig;
use crate::error::{Result, ServeError};
use crate::events::EventRecorder;
use crate::request::{discard_body, read_request};
use crate::router::Router;
use std::future::{pending, Future};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Static file server bound to a listening socket
pub struct Server {
    listener: TcpListener,
    router: Arc<Router>,
    limiter: Arc<Semaphore>,
    max_connections: usize,
}

impl Server {
    /// Bind the configured listen address with a fresh cache
    ///
    /// Failing to bind is the only fatal error of a server's lifetime.
    pub async fn bind(config: ServerConfig, recorder: Arc<dyn EventRecorder>) -> Result<Self> {
        let cache = Arc::new(ContentCache::from_config(&config.cache));
        Self::bind_with_cache(config, cache, recorder).await
    }

    /// Bind the configured listen address, sharing an existing cache
    pub async fn bind_with_cache(
        config: ServerConfig,
        cache: Arc<ContentCache>,
        recorder: Arc<dyn EventRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        let addr = config.listen_addr()?;

        match tokio::fs::metadata(&config.document_root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(ServeError::ConfigError(format!(
                    "document root {} is not a directory",
                    config.document_root.display()
                )))
            }
            Err(e) => {
                return Err(ServeError::ConfigError(format!(
                    "document root {}: {}",
                    config.document_root.display(),
                    e
                )))
            }
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServeError::BindError {
                address: config.listen_address.clone(),
                message: e.to_string(),
            })?;

        let max_connections = config.max_connections;
        info!(
            "Listening on {} (document root: {}, max connections: {})",
            listener.local_addr()?,
            config.document_root.display(),
            max_connections
        );

        Ok(Server {
            listener,
            router: Arc::new(Router::new(Arc::new(config), cache, recorder)),
            limiter: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Address actually bound, useful when the configured port was 0
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        self.router.cache()
    }

    /// Serve until the process exits
    pub async fn run(self) -> Result<()> {
        self.run_until(pending()).await
    }

    /// Serve until `shutdown` resolves
    ///
    /// After the signal no new connections are accepted; the call returns
    /// once every in-flight connection has finished.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = Arc::clone(&self.limiter).acquire_owned() => permit
                    .map_err(|_| ServeError::InternalError("connection limiter closed".to_string()))?,
            };

            let (stream, peer) = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning
                        warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };

            let router = Arc::clone(&self.router);
            tokio::spawn(async move {
                let _permit = permit;
                serve_connection(router, stream, peer).await;
            });
        }

        info!("Shutdown requested, waiting for open connections to finish");
        let all = u32::try_from(self.max_connections).unwrap_or(u32::MAX);
        let _ = self.limiter.acquire_many(all).await;
        info!("Server stopped");
        Ok(())
    }
}

/// Answer requests on one connection until it should close
async fn serve_connection(router: Arc<Router>, stream: TcpStream, peer: SocketAddr) {
    debug!("Accepted connection from {}", peer);
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let config = router.config();
    let idle = config.keep_alive_timeout();
    let max_header_bytes = config.max_header_bytes;

    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut served = 0u64;

    loop {
        let req = match timeout(idle, read_request(&mut reader, max_header_bytes)).await {
            Err(_) => {
                debug!("Idle timeout for {} after {} requests", peer, served);
                break;
            }
            Ok(Ok(Some(req))) => req,
            Ok(Ok(None)) => break,
            Ok(Err(err @ ServeError::ParseError(_))) => {
                router.reject_malformed(&err, Some(peer), &mut write_half).await;
                break;
            }
            Ok(Err(e)) => {
                debug!("Connection from {} failed mid-request: {}", peer, e);
                break;
            }
        };

        served += 1;
        // Bodies are never used; skip them so the next head is read from the
        // right offset. Anything not discardable makes the router close.
        if req.body.is_discardable() {
            match timeout(idle, discard_body(&mut reader, req.body)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Failed to skip request body from {}: {}", peer, e);
                    break;
                }
                Err(_) => {
                    debug!("Idle timeout reading request body from {}", peer);
                    break;
                }
            }
        }

        if !router.handle(&req, Some(peer), &mut write_half).await {
            break;
        }
    }

    let _ = write_half.shutdown().await;
    debug!("Closed connection from {} ({} requests)", peer, served);
}
