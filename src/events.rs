//! Structured per-request events
//!
//! Every completed or aborted request produces one [`RequestEvent`]. The
//! server hands it to an [`EventRecorder`]; storage and presentation belong
//! to the recorder, not to the request pipeline.

use crate::models::CacheOutcome;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Outcome record for one request
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub timestamp: SystemTime,
    pub client_addr: Option<SocketAddr>,
    /// Request method, or "-" when the request line could not be parsed
    pub method: String,
    /// Request target, or "-" when the request line could not be parsed
    pub path: String,
    pub status: u16,
    pub cache: CacheOutcome,
    /// Body bytes actually written to the connection
    pub bytes_sent: u64,
    pub latency: Duration,
    /// False when the body transfer was cut short
    pub complete: bool,
}

impl RequestEvent {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Sink for request events
///
/// Called inline on the connection task, so implementations must not block.
pub trait EventRecorder: Send + Sync {
    fn record(&self, event: &RequestEvent);
}

/// Writes one access-log line per event through `tracing`
#[derive(Debug, Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, event: &RequestEvent) {
        let client = event
            .client_addr
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "-".to_string());

        if event.complete {
            info!(
                "client_ip=\"{}\" method=\"{}\" path=\"{}\" status={} response_time_ms={:.2} bytes_sent={} cache_status=\"{}\"",
                client,
                event.method,
                event.path,
                event.status,
                event.latency_ms(),
                event.bytes_sent,
                event.cache.header_value()
            );
        } else {
            warn!(
                "client_ip=\"{}\" method=\"{}\" path=\"{}\" status={} response_time_ms={:.2} bytes_sent={} cache_status=\"{}\" partial=true",
                client,
                event.method,
                event.path,
                event.status,
                event.latency_ms(),
                event.bytes_sent,
                event.cache.header_value()
            );
        }
    }
}

/// Forwards events to an external consumer over an unbounded channel
///
/// Events are dropped silently once the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    tx: mpsc::UnboundedSender<RequestEvent>,
}

impl ChannelRecorder {
    /// Create a recorder and the receiving end for the consumer
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RequestEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelRecorder { tx }, rx)
    }
}

impl EventRecorder for ChannelRecorder {
    fn record(&self, event: &RequestEvent) {
        let _ = self.tx.send(event.clone());
    }
}

/// Sends each event to several recorders in order
#[derive(Default, Clone)]
pub struct FanoutRecorder {
    recorders: Vec<Arc<dyn EventRecorder>>,
}

impl FanoutRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }
}

impl EventRecorder for FanoutRecorder {
    fn record(&self, event: &RequestEvent) {
        for recorder in &self.recorders {
            recorder.record(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(status: u16) -> RequestEvent {
        RequestEvent {
            timestamp: SystemTime::now(),
            client_addr: Some("127.0.0.1:4000".parse().unwrap()),
            method: "GET".to_string(),
            path: "/index.html".to_string(),
            status,
            cache: CacheOutcome::Hit,
            bytes_sent: 42,
            latency: Duration::from_micros(1500),
            complete: true,
        }
    }

    #[test]
    fn test_latency_ms() {
        assert!((event(200).latency_ms() - 1.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_channel_recorder_forwards() {
        let (recorder, mut rx) = ChannelRecorder::new();
        recorder.record(&event(200));
        recorder.record(&event(404));

        assert_eq!(rx.recv().await.unwrap().status, 200);
        assert_eq!(rx.recv().await.unwrap().status, 404);
    }

    #[test]
    fn test_channel_recorder_survives_dropped_receiver() {
        let (recorder, rx) = ChannelRecorder::new();
        drop(rx);
        recorder.record(&event(200));
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_recorder() {
        let (a, mut rx_a) = ChannelRecorder::new();
        let (b, mut rx_b) = ChannelRecorder::new();
        let fanout = FanoutRecorder::new()
            .with(Arc::new(a))
            .with(Arc::new(LogRecorder))
            .with(Arc::new(b));

        fanout.record(&event(304));

        assert_eq!(rx_a.recv().await.unwrap().status, 304);
        assert_eq!(rx_b.recv().await.unwrap().status, 304);
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event(200)).unwrap();
        assert_eq!(json["cache"], "hit");
        assert_eq!(json["bytes_sent"], 42);
    }
}
