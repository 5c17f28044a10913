//! Integration tests for the metrics endpoint
//!
//! Requests go through the file server with `ServerMetrics` as the event
//! recorder, then the endpoint is scraped over HTTP.

use static_cache_server::{ContentCache, MetricsEndpoint, Server, ServerConfig, ServerMetrics};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_metrics_endpoint_starts() {
    let metrics = Arc::new(ServerMetrics::new().unwrap());
    let cache = Arc::new(ContentCache::new(16, None));

    let addr = "127.0.0.1:0".parse().unwrap();
    let endpoint = MetricsEndpoint::new(metrics, cache, addr);

    let handle = tokio::spawn(async move { endpoint.start().await });

    // Give it a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());
    handle.abort();
}

#[tokio::test]
async fn test_metrics_reflect_served_requests() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), "hello metrics").unwrap();

    let metrics = Arc::new(ServerMetrics::new().unwrap());
    let mut config = ServerConfig::default();
    config.listen_address = "127.0.0.1:0".to_string();
    config.document_root = root.path().to_path_buf();

    let server = Server::bind(config, metrics.clone()).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let cache = Arc::clone(server.cache());
    tokio::spawn(server.run());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let metrics_addr = listener.local_addr().unwrap();
    let endpoint = MetricsEndpoint::new(Arc::clone(&metrics), cache, metrics_addr);
    let handle = tokio::spawn(async move { endpoint.serve(listener).await });

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    for _ in 0..3 {
        client
            .get(format!("http://{}/", server_addr))
            .send()
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
    }
    client
        .get(format!("http://{}/missing", server_addr))
        .send()
        .await
        .unwrap();

    // Events are recorded just after the response is flushed
    tokio::time::sleep(Duration::from_millis(100)).await;

    let stats = metrics.get_stats();
    assert_eq!(stats.total_requests, 4);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 2);
    assert_eq!(metrics.status_count(404), 1);

    let text = client
        .get(format!("http://{}/metrics", metrics_addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(text.contains("static_cache_requests_total{cache=\"hit\"} 2"));
    assert!(text.contains("static_cache_responses_total{status=\"404\"} 1"));
    assert!(text.contains("static_cache_entries 1"));

    let health = client
        .get(format!("http://{}/health", metrics_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    let body = client
        .get(format!("http://{}/stats", metrics_addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let stats: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(stats["entries"], 1);
    assert_eq!(stats["insertions"], 1);

    let unknown = client
        .get(format!("http://{}/unknown", metrics_addr))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

    handle.abort();
}
