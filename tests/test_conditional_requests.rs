//! End-to-end tests for conditional GET handling
//!
//! A real server is bound to 127.0.0.1:0 over a temporary document root and
//! driven with reqwest.

use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use static_cache_server::{ContentCache, LogRecorder, Server, ServerConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const INDEX: &str = "<html><body>Hello</body></html>";

async fn start_server(ttl: u64) -> (TempDir, SocketAddr, Arc<ContentCache>) {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), INDEX).unwrap();
    std::fs::write(root.path().join("test.txt"), "This is a test file").unwrap();

    let mut config = ServerConfig::default();
    config.listen_address = "127.0.0.1:0".to_string();
    config.document_root = root.path().to_path_buf();
    config.cache.ttl = ttl;

    let server = Server::bind(config, Arc::new(LogRecorder)).await.unwrap();
    let addr = server.local_addr().unwrap();
    let cache = Arc::clone(server.cache());
    tokio::spawn(server.run());

    (root, addr, cache)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

fn header(response: &reqwest::Response, name: &str) -> String {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_get_then_not_modified_then_ttl_expiry() {
    let (_root, addr, cache) = start_server(1).await;
    let client = client();
    let url = format!("http://{}/index.html", addr);

    // Empty cache: disk read, entry inserted, full body
    let first = client.get(&url).send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, "x-cache-status"), "MISS");
    let etag = header(&first, "etag");
    assert!(etag.starts_with('"') && etag.ends_with('"'));
    assert_eq!(first.text().await.unwrap(), INDEX);
    assert_eq!(cache.len(), 1);

    // Immediate revalidation
    let second = client.get(&url).header(IF_NONE_MATCH, &etag).send().await.unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&second, "x-cache-status"), "HIT");
    assert_eq!(header(&second, "etag"), etag);
    assert!(second.bytes().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(1200)).await;

    // Entry expired: reloaded from disk as a fresh insertion, same tag for
    // unchanged content, so the validator still matches
    let third = client.get(&url).header(IF_NONE_MATCH, &etag).send().await.unwrap();
    assert_eq!(third.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header(&third, "x-cache-status"), "MISS");
    assert_eq!(header(&third, "etag"), etag);

    let fourth = client.get(&url).send().await.unwrap();
    assert_eq!(fourth.status(), StatusCode::OK);
    assert_eq!(header(&fourth, "x-cache-status"), "HIT");
    assert_eq!(header(&fourth, "etag"), etag);

    let stats = cache.stats();
    assert_eq!(stats.insertions, 2);
    assert_eq!(stats.expirations, 1);
}

#[tokio::test]
async fn test_stale_etag_gets_fresh_content() {
    let (root, addr, _cache) = start_server(30).await;
    let client = client();
    let url = format!("http://{}/test.txt", addr);

    let first = client.get(&url).send().await.unwrap();
    let original_etag = header(&first, "etag");

    std::fs::write(root.path().join("test.txt"), "This file has been modified").unwrap();

    let second = client
        .get(&url)
        .header(IF_NONE_MATCH, &original_etag)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let new_etag = header(&second, "etag");
    assert_ne!(new_etag, original_etag);
    assert_eq!(second.text().await.unwrap(), "This file has been modified");
}

#[tokio::test]
async fn test_if_modified_since() {
    let (_root, addr, _cache) = start_server(30).await;
    let client = client();
    let url = format!("http://{}/test.txt", addr);

    let first = client.get(&url).send().await.unwrap();
    let last_modified = first.headers().get(LAST_MODIFIED).unwrap().clone();

    let second = client
        .get(&url)
        .header(IF_MODIFIED_SINCE, last_modified)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);

    let old = client
        .get(&url)
        .header(IF_MODIFIED_SINCE, "Thu, 01 Jan 1970 00:00:00 GMT")
        .send()
        .await
        .unwrap();
    assert_eq!(old.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_if_none_match_mismatch_ignores_date() {
    let (_root, addr, _cache) = start_server(30).await;
    let client = client();
    let url = format!("http://{}/test.txt", addr);

    let first = client.get(&url).send().await.unwrap();
    let last_modified = first.headers().get(LAST_MODIFIED).unwrap().clone();

    let response = client
        .get(&url)
        .header(IF_NONE_MATCH, "\"something-else\"")
        .header(IF_MODIFIED_SINCE, last_modified)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_head_request() {
    let (_root, addr, _cache) = start_server(30).await;
    let client = client();

    let response = client
        .head(format!("http://{}/index.html", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-length"), INDEX.len().to_string());
    assert!(response.headers().contains_key(ETAG));
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_error_statuses() {
    let (_root, addr, _cache) = start_server(30).await;
    let client = client();

    let missing = client
        .get(format!("http://{}/nonexistent.html", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    assert_eq!(missing.text().await.unwrap(), "<h1>404 Not Found</h1>");

    let post = client
        .post(format!("http://{}/index.html", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(post.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(header(&post, "allow"), "GET, HEAD");
}

#[tokio::test]
async fn test_root_serves_index() {
    let (_root, addr, _cache) = start_server(30).await;

    let response = client().get(format!("http://{}/", addr)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "content-type"), "text/html; charset=utf-8");
    assert_eq!(header(&response, "cache-control"), "public, max-age=60");
    assert_eq!(response.text().await.unwrap(), INDEX);
}
