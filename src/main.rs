// ████████╗██████╗ ██╗██████╗ ██╗    ██╗██╗██████╗ ███████╗
// ╚══██╔══╝██╔══██╗██║██╔══██╗██║    ██║██║██╔══██╗██╔════╝
//    ██║   ██████╔╝██║██████╔╝██║ █╗ ██║██║██████╔╝█████╗
//    ██║   ██╔══██╗██║██╔═══╝ ██║███╗██║██║██╔══██╗██╔══╝
//    ██║   ██║  ██║██║██║     ╚███╔███╔╝██║██║  ██║███████╗
//    ╚═╝   ╚═╝  ╚═╝╚═╝╚═╝      ╚══╝╚══╝ ╚═╝╚═╝  ╚═╝╚══════╝
//
// E N G I N E
//
// Demo harness: a registry, a couple of deliberately unreliable pretend
// dependencies, and a steady stream of calls so you can watch breakers trip,
// probe, and recover in the logs and on the snapshot endpoint.

use anyhow::Context;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use tripwire_engine::{
    metrics, BreakerConfig, BreakerError, BreakerRegistry, CallContext, ChannelRetryQueue,
    EngineConfig, FallbackStrategy, RedisRetryPublisher, Response,
};

fn print_banner() {
    let banner = r#"

    ╔══════════════════════════════════════════════════════════════════╗
    ║                                                                  ║
    ║   ████████╗██████╗ ██╗██████╗ ██╗    ██╗██╗██████╗ ███████╗      ║
    ║   ╚══██╔══╝██╔══██╗██║██╔══██╗██║    ██║██║██╔══██╗██╔════╝      ║
    ║      ██║   ██████╔╝██║██████╔╝██║ █╗ ██║██║██████╔╝█████╗        ║
    ║      ██║   ██╔══██╗██║██╔═══╝ ██║███╗██║██║██╔══██╗██╔══╝        ║
    ║      ██║   ██║  ██║██║██║     ╚███╔███╔╝██║██║  ██║███████╗      ║
    ║      ╚═╝   ╚═╝  ╚═╝╚═╝╚═╝      ╚══╝╚══╝ ╚═╝╚═╝  ╚═╝╚══════╝      ║
    ║                                                                  ║
    ║        ⚡ ADAPTIVE CIRCUIT BREAKER ENGINE ⚡                     ║
    ║                                                                  ║
    ║   Detection:  Sliding Window + Failure Streak                    ║
    ║   Recovery:   Half-Open Probes with Flap Backoff                 ║
    ║   Admission:  Per-Dependency Semaphores + Deadlines              ║
    ║   Fallbacks:  Cached | Default | Deferred | Fail-Fast            ║
    ║                                                                  ║
    ║   "The payment service WILL go down. Checkout will not."         ║
    ║                                                                  ║
    ╚══════════════════════════════════════════════════════════════════╝

    "#;
    println!("{}", banner);
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
            .init();
    }
}

/// A pretend downstream that is healthy most of the time and falls over on
/// a fixed schedule.
#[derive(Clone)]
struct FlakyDependency {
    born: Instant,
    period: Duration,
    outage: Duration,
    latency: Duration,
}

impl FlakyDependency {
    fn is_down(&self) -> bool {
        let elapsed = self.born.elapsed().as_millis() % self.period.as_millis().max(1);
        elapsed >= (self.period - self.outage).as_millis()
    }
}

/// Drive `operation` against `key` every `every` until shutdown.
async fn drive(
    registry: Arc<BreakerRegistry<Value>>,
    key: &'static str,
    operation: &'static str,
    dependency: FlakyDependency,
    every: Duration,
    blocking: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(every);
    let mut seq: u64 = 0;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => return,
        }
        seq += 1;
        let ctx = CallContext::new(operation).with_payload(json!({ "seq": seq }));
        let dep = dependency.clone();

        let result = if blocking {
            registry
                .execute_blocking(key, &ctx, move |token| {
                    std::thread::sleep(dep.latency);
                    if token.is_cancelled() {
                        anyhow::bail!("abandoned by caller");
                    }
                    if dep.is_down() {
                        anyhow::bail!("connection refused");
                    }
                    Ok(json!({ "balance_cents": 125_000, "seq": seq }))
                })
                .await
        } else {
            registry
                .execute(key, &ctx, move |_token| async move {
                    tokio::time::sleep(dep.latency).await;
                    if dep.is_down() {
                        anyhow::bail!("503 service unavailable");
                    }
                    Ok(json!({ "quote_cents": 4_200 + seq % 100, "seq": seq }))
                })
                .await
        };

        match result {
            Ok(Response::Live(_)) => debug!(dependency = key, seq, "live"),
            Ok(Response::Pending(ticket)) => {
                info!(dependency = key, seq, ticket = %ticket.id, "call deferred for replay")
            }
            Ok(degraded) => debug!(dependency = key, seq, response = ?degraded, "served degraded"),
            Err(e @ BreakerError::Tripped { .. }) => debug!(dependency = key, seq, error = %e, "fast-failed"),
            Err(e) => warn!(dependency = key, seq, error = %e, "call failed"),
        }
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 8)]
async fn main() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(config.log_json);
    config.validate().context("refusing to start with a broken configuration")?;

    print_banner();
    info!("🔌 TRIPWIRE ENGINE initializing...");
    let config = Arc::new(config);

    // Deferred-retry channel between the fallback dispatcher and the Redis drain
    let (retry_queue, retry_rx) = ChannelRetryQueue::bounded(config.retry_queue_capacity);
    info!(
        "✅ Deferred-retry channel created (capacity: {})",
        retry_queue.capacity()
    );

    let registry = Arc::new(
        BreakerRegistry::<Value>::new(config.as_ref().clone()).with_retry_queue(Arc::new(retry_queue)),
    );

    registry.register_breaker(
        "payments",
        BreakerConfig {
            failure_threshold: 4,
            min_volume: 10,
            recovery_timeout: Duration::from_secs(5),
            max_recovery_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(2),
            max_concurrency: 20,
            ..config.default_breaker.clone()
        },
    )?;
    registry.register_breaker(
        "legacy_ledger",
        BreakerConfig {
            recovery_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_millis(500),
            max_concurrency: 4,
            ..config.default_breaker.clone()
        },
    )?;

    registry.register_fallback(
        "payments",
        "quote",
        FallbackStrategy::CachedValue {
            default: Some(json!({ "quote_cents": null, "stale": true })),
        },
    );
    registry.register_fallback("payments", "charge", FallbackStrategy::QueueForRetry);
    registry.register_fallback(
        "legacy_ledger",
        "balance",
        FallbackStrategy::DefaultValue(json!({ "balance_cents": null, "unavailable": true })),
    );
    info!("✅ Breakers and fallbacks registered");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ═══════════════════════════════════════════
    // SPAWN REDIS RETRY DRAIN
    // ═══════════════════════════════════════════
    let (publisher, publisher_stats) =
        RedisRetryPublisher::new(Arc::clone(&config), retry_rx, shutdown_rx.clone());
    let publisher_handle = tokio::spawn(async move {
        info!("📤 Retry publisher: ONLINE");
        if let Err(e) = publisher.run().await {
            error!("📤 Retry publisher error: {}", e);
        }
        info!("📤 Retry publisher: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // SPAWN METRICS HTTP SERVER
    // ═══════════════════════════════════════════
    let metrics_source = Arc::clone(&registry);
    let metrics_port = config.metrics_port;
    let mut metrics_shutdown = shutdown_rx.clone();
    let metrics_handle = tokio::spawn(async move {
        metrics::run_metrics_server(metrics_source, metrics_port, &mut metrics_shutdown).await;
        info!("📊 Metrics server: OFFLINE");
    });

    // ═══════════════════════════════════════════
    // SPAWN SIMULATED TRAFFIC
    // ═══════════════════════════════════════════
    let born = Instant::now();
    let payments = FlakyDependency {
        born,
        period: Duration::from_secs(40),
        outage: Duration::from_secs(12),
        latency: Duration::from_millis(30),
    };
    let ledger = FlakyDependency {
        born,
        period: Duration::from_secs(60),
        outage: Duration::from_secs(20),
        latency: Duration::from_millis(80),
    };

    let drivers = vec![
        tokio::spawn(drive(
            Arc::clone(&registry),
            "payments",
            "quote",
            payments.clone(),
            Duration::from_millis(100),
            false,
            shutdown_rx.clone(),
        )),
        tokio::spawn(drive(
            Arc::clone(&registry),
            "payments",
            "charge",
            payments,
            Duration::from_millis(500),
            false,
            shutdown_rx.clone(),
        )),
        tokio::spawn(drive(
            Arc::clone(&registry),
            "legacy_ledger",
            "balance",
            ledger,
            Duration::from_millis(250),
            true,
            shutdown_rx.clone(),
        )),
    ];

    info!("═══════════════════════════════════════════════════════");
    info!("  🟢 ALL SYSTEMS ONLINE - TRIPWIRE ENGINE ACTIVE");
    info!("  🔌 {} dependencies protected", registry.dependencies().len());
    info!("  📤 Deferring to Redis at {}", config.redis_url);
    info!("  📊 Snapshot at http://0.0.0.0:{}/", config.metrics_port);
    info!("  ⚡ Press Ctrl+C for graceful shutdown");
    info!("═══════════════════════════════════════════════════════");

    match signal::ctrl_c().await {
        Ok(()) => warn!("🛑 Shutdown signal received!"),
        Err(err) => error!("❌ Signal listener error: {}", err),
    }
    let _ = shutdown_tx.send(true);

    info!("⏳ Waiting for tasks to complete (timeout: 10s)...");
    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        futures::future::join_all(drivers).await;
        let _ = tokio::join!(publisher_handle, metrics_handle);
    })
    .await;

    let final_metrics = registry.metrics().snapshot();
    info!(
        calls = final_metrics.calls_total,
        trips = final_metrics.circuit_breaker_trips,
        recoveries = final_metrics.circuit_breaker_recoveries,
        fallbacks = final_metrics.fallbacks_served,
        deferred_persisted = publisher_stats.snapshot().requests_persisted,
        "📈 Final tally"
    );
    info!("💤 TRIPWIRE ENGINE: OFFLINE");
    Ok(())
}
