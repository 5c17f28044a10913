//! Cache bypass, globally and per request

use static_cache_server::{ChannelRecorder, Server, ServerConfig};
use static_cache_server::{CacheOutcome, ContentCache, RequestEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

async fn start_server(
    cache_enabled: bool,
) -> (TempDir, SocketAddr, Arc<ContentCache>, UnboundedReceiver<RequestEvent>) {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("page.html"), "<p>page</p>").unwrap();

    let mut config = ServerConfig::default();
    config.listen_address = "127.0.0.1:0".to_string();
    config.document_root = root.path().to_path_buf();
    config.cache.enabled = cache_enabled;

    let (recorder, events) = ChannelRecorder::new();
    let server = Server::bind(config, Arc::new(recorder)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let cache = Arc::clone(server.cache());
    tokio::spawn(server.run());

    (root, addr, cache, events)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

#[tokio::test]
async fn test_bypass_header_skips_cache_reads_and_writes() {
    let (_root, addr, cache, mut events) = start_server(true).await;
    let url = format!("http://{}/page.html", addr);

    let bypassed = client()
        .get(&url)
        .header("x-cache-bypass", "true")
        .send()
        .await
        .unwrap();
    assert_eq!(bypassed.headers()["x-cache-status"], "BYPASS");
    assert!(cache.is_empty());

    // Populate, then bypass again: the entry is neither read nor replaced
    client().get(&url).send().await.unwrap();
    assert_eq!(cache.len(), 1);
    let stats_before = cache.stats();

    let bypassed = client()
        .get(&url)
        .header("x-cache-bypass", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(bypassed.headers()["x-cache-status"], "BYPASS");
    assert_eq!(bypassed.text().await.unwrap(), "<p>page</p>");

    let stats_after = cache.stats();
    assert_eq!(stats_after.hits, stats_before.hits);
    assert_eq!(stats_after.insertions, stats_before.insertions);

    let outcomes: Vec<CacheOutcome> = vec![
        events.recv().await.unwrap().cache,
        events.recv().await.unwrap().cache,
        events.recv().await.unwrap().cache,
    ];
    assert_eq!(
        outcomes,
        vec![CacheOutcome::Bypass, CacheOutcome::Miss, CacheOutcome::Bypass]
    );
}

#[tokio::test]
async fn test_disabled_cache_still_revalidates() {
    let (_root, addr, cache, _events) = start_server(false).await;
    let url = format!("http://{}/page.html", addr);

    let first = client().get(&url).send().await.unwrap();
    assert_eq!(first.headers()["x-cache-status"], "BYPASS");
    let etag = first.headers()["etag"].to_str().unwrap().to_string();

    let second = client()
        .get(&url)
        .header("if-none-match", &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::NOT_MODIFIED);
    assert_eq!(cache.stats().insertions, 0);
}
