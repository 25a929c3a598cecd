// ═══════════════════════════════════════════════════════════════
// METRICS COLLECTOR - Because a breaker that trips silently is a breaker nobody trusts
// ═══════════════════════════════════════════════════════════════
//
// Atomic counters for every way a call can end, plus a tiny HTTP responder
// that serves the whole engine (counters + every breaker's snapshot) as JSON
// so an external telemetry collector can scrape it.
//
// What the collector does with the numbers (dashboards, alerts, paging the
// payments team at 3am) is somebody else's problem.

use portable_atomic::{AtomicU64, Ordering};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::circuit_breaker::BreakerSnapshot;
use crate::models::{OutcomeKind, RejectReason};

/// The metrics snapshot - what gets serialized to JSON
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub calls_total: u64,
    pub successes: u64,
    pub downstream_errors: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub withdrawn_while_queued: u64,
    pub rejected_circuit_open: u64,
    pub rejected_probe_saturated: u64,
    pub rejected_concurrency: u64,
    pub circuit_breaker_trips: u64,
    pub circuit_breaker_recoveries: u64,
    pub fallbacks_served: u64,
    pub fallbacks_propagated: u64,
    pub retries_enqueued: u64,
    pub retry_enqueue_failures: u64,
    pub uptime_seconds: u64,
    pub calls_per_minute: f64,
}

/// Everything the snapshot endpoint serves in one document.
#[derive(Debug, Serialize, Clone)]
pub struct EngineSnapshot {
    pub status: String,
    pub metrics: MetricsSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
}

/// Anything that can describe the whole engine. Implemented by the registry,
/// kept as a trait so the server does not care about the registry's value type.
pub trait SnapshotSource: Send + Sync {
    fn engine_snapshot(&self) -> EngineSnapshot;
}

/// Thread-safe atomic metrics collector, shared by every breaker in a registry.
pub struct MetricsCollector {
    calls_total: AtomicU64,
    successes: AtomicU64,
    downstream_errors: AtomicU64,
    timeouts: AtomicU64,
    cancellations: AtomicU64,
    withdrawn: AtomicU64,
    rejected_circuit_open: AtomicU64,
    rejected_probe_saturated: AtomicU64,
    rejected_concurrency: AtomicU64,
    trips: AtomicU64,
    recoveries: AtomicU64,
    fallbacks_served: AtomicU64,
    fallbacks_propagated: AtomicU64,
    retries_enqueued: AtomicU64,
    retry_enqueue_failures: AtomicU64,
    start_time: Instant,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            downstream_errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            withdrawn: AtomicU64::new(0),
            rejected_circuit_open: AtomicU64::new(0),
            rejected_probe_saturated: AtomicU64::new(0),
            rejected_concurrency: AtomicU64::new(0),
            trips: AtomicU64::new(0),
            recoveries: AtomicU64::new(0),
            fallbacks_served: AtomicU64::new(0),
            fallbacks_propagated: AtomicU64::new(0),
            retries_enqueued: AtomicU64::new(0),
            retry_enqueue_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn increment_calls(&self) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a settled call by how it ended. Concurrency rejections are
    /// counted through `increment_rejected` instead.
    pub fn increment_outcome(&self, kind: OutcomeKind) {
        let counter = match kind {
            OutcomeKind::Ok => &self.successes,
            OutcomeKind::DownstreamError => &self.downstream_errors,
            OutcomeKind::Timeout => &self.timeouts,
            OutcomeKind::Cancelled => &self.cancellations,
            OutcomeKind::ConcurrencyRejected => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_rejected(&self, reason: RejectReason) {
        let counter = match reason {
            RejectReason::CircuitOpen => &self.rejected_circuit_open,
            RejectReason::ProbeSaturated => &self.rejected_probe_saturated,
            RejectReason::ConcurrencyRejected => &self.rejected_concurrency,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_withdrawn(&self) {
        self.withdrawn.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_trips(&self) {
        self.trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_recoveries(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fallback_served(&self) {
        self.fallbacks_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_fallback_propagated(&self) {
        self.fallbacks_propagated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_enqueued(&self) {
        self.retries_enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_retry_enqueue_failures(&self) {
        self.retry_enqueue_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of all metrics (lock-free reads)
    pub fn snapshot(&self) -> MetricsSnapshot {
        let uptime = self.start_time.elapsed().as_secs();
        let calls_total = self.calls_total.load(Ordering::Relaxed);
        let calls_per_minute = if uptime > 0 {
            (calls_total as f64 / uptime as f64) * 60.0
        } else {
            0.0
        };

        MetricsSnapshot {
            calls_total,
            successes: self.successes.load(Ordering::Relaxed),
            downstream_errors: self.downstream_errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            withdrawn_while_queued: self.withdrawn.load(Ordering::Relaxed),
            rejected_circuit_open: self.rejected_circuit_open.load(Ordering::Relaxed),
            rejected_probe_saturated: self.rejected_probe_saturated.load(Ordering::Relaxed),
            rejected_concurrency: self.rejected_concurrency.load(Ordering::Relaxed),
            circuit_breaker_trips: self.trips.load(Ordering::Relaxed),
            circuit_breaker_recoveries: self.recoveries.load(Ordering::Relaxed),
            fallbacks_served: self.fallbacks_served.load(Ordering::Relaxed),
            fallbacks_propagated: self.fallbacks_propagated.load(Ordering::Relaxed),
            retries_enqueued: self.retries_enqueued.load(Ordering::Relaxed),
            retry_enqueue_failures: self.retry_enqueue_failures.load(Ordering::Relaxed),
            uptime_seconds: uptime,
            calls_per_minute,
        }
    }
}

/// How long a client gets to send its request line before we answer anyway.
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Run a tiny HTTP server that serves the engine snapshot as JSON on every
/// request, whatever the path. Stops when `shutdown` flips.
pub async fn run_metrics_server<S>(
    source: Arc<S>,
    port: u16,
    shutdown: &mut watch::Receiver<bool>,
) where
    S: SnapshotSource + ?Sized + 'static,
{
    let addr = format!("0.0.0.0:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind metrics server on {}: {}", addr, e);
            return;
        }
    };

    info!("📊 Metrics server listening on http://{}", addr);
    serve_snapshots(listener, source, shutdown).await;
}

/// Accept loop. Every connection is answered on its own task, so a client
/// that connects and never speaks cannot hold up other scrapes or shutdown.
async fn serve_snapshots<S>(
    listener: TcpListener,
    source: Arc<S>,
    shutdown: &mut watch::Receiver<bool>,
) where
    S: SnapshotSource + ?Sized + 'static,
{
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        let source = Arc::clone(&source);
                        tokio::spawn(async move {
                            answer(stream, peer, source.as_ref()).await;
                        });
                    }
                    Err(e) => {
                        error!("Metrics server accept error: {}", e);
                    }
                }
            }
            _ = shutdown.changed() => {
                info!("Metrics server: shutting down");
                break;
            }
        }
    }
}

async fn answer<S>(mut stream: TcpStream, peer: SocketAddr, source: &S)
where
    S: SnapshotSource + ?Sized,
{
    // Drain whatever request line the scraper sent; every request gets the
    // same answer.
    let mut scratch = [0u8; 1024];
    if tokio::time::timeout(REQUEST_READ_TIMEOUT, stream.read(&mut scratch))
        .await
        .is_err()
    {
        debug!(peer = %peer, "Client sent nothing, answering anyway");
    }

    let snapshot = source.engine_snapshot();
    let json = serde_json::to_string_pretty(&snapshot).unwrap_or_else(|_| "{}".to_string());

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nConnection: close\r\nContent-Length: {}\r\n\r\n{}",
        json.len(),
        json,
    );

    let _ = stream.write_all(response.as_bytes()).await;
    debug!(peer = %peer, breakers = snapshot.breakers.len(), "Served engine snapshot");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_land_in_the_right_buckets() {
        let m = MetricsCollector::new();
        m.increment_calls();
        m.increment_calls();
        m.increment_outcome(OutcomeKind::Ok);
        m.increment_outcome(OutcomeKind::Timeout);
        m.increment_outcome(OutcomeKind::ConcurrencyRejected);
        m.increment_rejected(RejectReason::ConcurrencyRejected);
        m.increment_rejected(RejectReason::CircuitOpen);
        m.increment_trips();

        let s = m.snapshot();
        assert_eq!(s.calls_total, 2);
        assert_eq!(s.successes, 1);
        assert_eq!(s.timeouts, 1);
        assert_eq!(s.downstream_errors, 0);
        assert_eq!(s.rejected_concurrency, 1);
        assert_eq!(s.rejected_circuit_open, 1);
        assert_eq!(s.circuit_breaker_trips, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = EngineSnapshot {
            status: "operational".to_string(),
            metrics: MetricsCollector::new().snapshot(),
            breakers: Vec::new(),
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["status"], "operational");
        assert_eq!(json["metrics"]["calls_total"], 0);
    }

    struct Idle;

    impl SnapshotSource for Idle {
        fn engine_snapshot(&self) -> EngineSnapshot {
            EngineSnapshot {
                status: "operational".to_string(),
                metrics: MetricsCollector::new().snapshot(),
                breakers: Vec::new(),
            }
        }
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_scrapes_or_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            serve_snapshots(listener, Arc::new(Idle), &mut shutdown_rx).await;
        });

        let _silent = TcpStream::connect(addr).await.unwrap();

        let mut scraper = TcpStream::connect(addr).await.unwrap();
        scraper.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut body = String::new();
        tokio::time::timeout(Duration::from_secs(1), scraper.read_to_string(&mut body))
            .await
            .expect("scrape stalled behind a silent client")
            .unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains("\"status\": \"operational\""));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), server)
            .await
            .expect("server ignored shutdown")
            .unwrap();
    }
}
