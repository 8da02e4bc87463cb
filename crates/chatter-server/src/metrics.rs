//! Metrics collection and export for Chatter.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chatter_core::HubHandle;
use chatter_transport::{Frame, FrameSink, FrameStream, TransportError};
use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "chatter_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "chatter_connections_active";
    pub const FRAMES_TOTAL: &str = "chatter_frames_total";
    pub const FRAMES_BYTES: &str = "chatter_frames_bytes";
    pub const ROOMS_ACTIVE: &str = "chatter_rooms_active";
    pub const HUB_CONNECTIONS: &str = "chatter_hub_connections";
    pub const HUB_DELIVERIES: &str = "chatter_hub_deliveries_total";
    pub const HUB_EVICTIONS: &str = "chatter_hub_evictions_total";
    pub const ERRORS_TOTAL: &str = "chatter_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of open WebSocket connections"
    );
    metrics::describe_counter!(names::FRAMES_TOTAL, "Total number of frames by direction");
    metrics::describe_counter!(names::FRAMES_BYTES, "Total frame bytes by direction");
    metrics::describe_gauge!(names::ROOMS_ACTIVE, "Current number of non-empty rooms");
    metrics::describe_gauge!(
        names::HUB_CONNECTIONS,
        "Connections registered with the hub"
    );
    metrics::describe_counter!(
        names::HUB_DELIVERIES,
        "Notifications enqueued by the hub"
    );
    metrics::describe_counter!(
        names::HUB_EVICTIONS,
        "Connections evicted for a full outbound queue"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the exporter cannot be installed.
pub fn start_metrics_server(port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a frame crossing the transport.
pub fn record_frame(bytes: usize, direction: &'static str) {
    counter!(names::FRAMES_TOTAL, "direction" => direction).increment(1);
    counter!(names::FRAMES_BYTES, "direction" => direction).increment(bytes as u64);
}

/// Record an error.
pub fn record_error(error_type: &'static str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type).increment(1);
}

/// Sample hub statistics until `shutdown` fires.
pub async fn report_hub_stats(hub: HubHandle, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(100)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Ok(stats) = hub.stats().await else { break };
                gauge!(names::HUB_CONNECTIONS).set(stats.connections as f64);
                gauge!(names::ROOMS_ACTIVE).set(stats.rooms as f64);
                counter!(names::HUB_DELIVERIES).absolute(stats.deliveries);
                counter!(names::HUB_EVICTIONS).absolute(stats.evictions);
            }
        }
    }
    debug!("Hub stats reporter stopped");
}

/// Tracks an open connection, in the gauge and in the admission counter.
pub struct ConnectionMetricsGuard {
    active: Arc<AtomicUsize>,
}

impl ConnectionMetricsGuard {
    /// Reserve a connection slot, or `None` if `limit` slots are taken.
    ///
    /// The slot is held until the guard drops.
    #[must_use]
    pub fn try_acquire(active: &Arc<AtomicUsize>, limit: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < limit).then_some(n + 1))
            .ok()?;
        counter!(names::CONNECTIONS_TOTAL).increment(1);
        gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
        Some(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
        gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
    }
}

/// A [`FrameSink`] that counts outbound frames.
pub struct MeteredSink<S> {
    inner: S,
}

impl<S> MeteredSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S: FrameSink> FrameSink for MeteredSink<S> {
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let len = frame.len();
        self.inner.send(frame).await?;
        record_frame(len, "outbound");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}

/// A [`FrameStream`] that counts inbound frames.
pub struct MeteredStream<R> {
    inner: R,
}

impl<R> MeteredStream<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R: FrameStream> FrameStream for MeteredStream<R> {
    async fn recv(&mut self) -> Result<Option<Frame>, TransportError> {
        let frame = self.inner.recv().await;
        match &frame {
            Ok(Some(f)) => record_frame(f.len(), "inbound"),
            Ok(None) => {}
            Err(_) => record_error("transport"),
        }
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatter_transport::memory;

    #[test]
    fn test_metrics_guard_tracks_active() {
        let active = Arc::new(AtomicUsize::new(0));
        let guard = ConnectionMetricsGuard::try_acquire(&active, 10).unwrap();
        assert_eq!(active.load(Ordering::Relaxed), 1);
        drop(guard);
        assert_eq!(active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_metrics_guard_respects_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let first = ConnectionMetricsGuard::try_acquire(&active, 2).unwrap();
        let _second = ConnectionMetricsGuard::try_acquire(&active, 2).unwrap();
        assert!(ConnectionMetricsGuard::try_acquire(&active, 2).is_none());
        assert_eq!(active.load(Ordering::Relaxed), 2);

        drop(first);
        assert!(ConnectionMetricsGuard::try_acquire(&active, 2).is_some());
        assert_eq!(active.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_exceed_limit() {
        let active = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let active = Arc::clone(&active);
                tokio::spawn(async move { ConnectionMetricsGuard::try_acquire(&active, 8) })
            })
            .collect();

        let mut held = Vec::new();
        for task in tasks {
            if let Some(guard) = task.await.unwrap() {
                held.push(guard);
            }
        }
        assert_eq!(held.len(), 8);
        assert_eq!(active.load(Ordering::Relaxed), 8);
    }

    #[tokio::test]
    async fn test_metered_halves_pass_frames_through() {
        let (sink, stream, mut peer) = memory::pair(4);
        let mut sink = MeteredSink::new(sink);
        let mut stream = MeteredStream::new(stream);

        sink.send(Frame::Text("out".into())).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::Text("out".into())));

        peer.send_text("in").await.unwrap();
        assert_eq!(stream.recv().await.unwrap(), Some(Frame::Text("in".into())));
    }
}
