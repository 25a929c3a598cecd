// =============================================================================
// registry.rs - THE SWITCHBOARD
// =============================================================================
//
// The application builds one `BreakerRegistry`, wraps it in an `Arc`, and
// hands it to every call site. There is no global. Each dependency key maps
// to a `DependencyBreaker` (state controller + admission guard), created
// explicitly with `register_breaker` or lazily on first use with the default
// config.
//
// `execute` is the whole pipeline:
//
//   admit ──reject──────────────────────────────┐
//     │                                         │
//   guard.run ──Rejected(concurrency)──record──>├──> fallback dispatcher
//     │       ──Failure──────────────record───> ┘      (exactly once)
//     │       ──Withdrawn──abandon──> Err(Cancelled)
//   Success──record──remember──> Ok(Live)
//
// The map is a DashMap so two different dependencies never contend on one
// lock. Everything per-dependency is serialized by the breaker's own mutex.
// =============================================================================

use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::circuit_breaker::{Admission, BreakerSnapshot, CircuitBreaker, Decision};
use crate::config::{BreakerConfig, ConfigError, EngineConfig};
use crate::error::BreakerError;
use crate::fallback::{Dispatch, FallbackDispatcher, FallbackResult, FallbackStrategy};
use crate::guard::{AdmissionGuard, GuardResult};
use crate::metrics::{EngineSnapshot, MetricsCollector, SnapshotSource};
use crate::models::{CallContext, CircuitState, OutcomeKind, OutcomeRecord, RejectReason};
use crate::retry_queue::{DeferredTicket, RetryQueue};

/// Everything protecting one dependency.
pub struct DependencyBreaker {
    controller: CircuitBreaker,
    guard: AdmissionGuard,
}

impl DependencyBreaker {
    fn new(key: &str, config: BreakerConfig, metrics: Arc<MetricsCollector>) -> Self {
        let guard = AdmissionGuard::new(key, &config);
        Self {
            controller: CircuitBreaker::new(key, config).with_metrics(metrics),
            guard,
        }
    }

    pub fn controller(&self) -> &CircuitBreaker {
        &self.controller
    }

    pub fn guard(&self) -> &AdmissionGuard {
        &self.guard
    }
}

/// What `execute` hands back when it has something to give.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum Response<T> {
    /// Straight from the dependency.
    Live(T),
    /// Last-known-good value from the fallback cache.
    Cached(T),
    /// The registered placeholder.
    Default(T),
    /// Deferred for replay; the caller gets a receipt, not a value.
    Pending(DeferredTicket),
}

impl<T> Response<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Response::Live(v) | Response::Cached(v) | Response::Default(v) => Some(v),
            Response::Pending(_) => None,
        }
    }

    /// Anything other than a live answer.
    pub fn is_degraded(&self) -> bool {
        !matches!(self, Response::Live(_))
    }
}

pub struct BreakerRegistry<T> {
    breakers: DashMap<String, Arc<DependencyBreaker>>,
    config: EngineConfig,
    metrics: Arc<MetricsCollector>,
    fallbacks: FallbackDispatcher<T>,
}

impl<T: Clone> BreakerRegistry<T> {
    pub fn new(config: EngineConfig) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let fallbacks =
            FallbackDispatcher::new(config.fallback_cache_capacity).with_metrics(Arc::clone(&metrics));
        Self {
            breakers: DashMap::new(),
            config,
            metrics,
            fallbacks,
        }
    }

    /// Where `QueueForRetry` fallbacks park their requests.
    pub fn with_retry_queue(mut self, queue: Arc<dyn RetryQueue>) -> Self {
        self.fallbacks = self.fallbacks.with_retry_queue(queue);
        self
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        Arc::clone(&self.metrics)
    }

    /// Create (or replace) the breaker for `key` with its own config.
    pub fn register_breaker(
        &self,
        key: &str,
        config: BreakerConfig,
    ) -> Result<Arc<DependencyBreaker>, ConfigError> {
        config.validate()?;
        let breaker = Arc::new(DependencyBreaker::new(key, config, Arc::clone(&self.metrics)));
        if self
            .breakers
            .insert(key.to_string(), Arc::clone(&breaker))
            .is_some()
        {
            warn!(dependency = %key, "Breaker re-registered, previous state discarded");
        }
        Ok(breaker)
    }

    /// The breaker for `key`, created with the default config if missing.
    pub fn breaker(&self, key: &str) -> Arc<DependencyBreaker> {
        if let Some(existing) = self.breakers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(key.to_string()).or_insert_with(|| {
            info!(dependency = %key, "Breaker created on first use with default config");
            Arc::new(DependencyBreaker::new(
                key,
                self.config.default_breaker.clone(),
                Arc::clone(&self.metrics),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn register_fallback(&self, key: &str, operation: &str, strategy: FallbackStrategy<T>) {
        self.fallbacks.register(key, operation, strategy);
    }

    pub fn current_state(&self, key: &str) -> Option<CircuitState> {
        self.breakers.get(key).map(|b| b.controller.state())
    }

    pub fn snapshot(&self, key: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(key).map(|b| b.controller.snapshot())
    }

    /// Every breaker, sorted by dependency key.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().controller.snapshot())
            .collect();
        all.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        all
    }

    pub fn dependencies(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.breakers.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Run an async call to `key` through the breaker.
    ///
    /// `call` gets a cancellation token that fires when the breaker stops
    /// waiting for it (timeout or caller cancellation).
    pub async fn execute<F, Fut, E>(
        &self,
        key: &str,
        ctx: &CallContext,
        call: F,
    ) -> Result<Response<T>, BreakerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        self.execute_with(key, ctx, move |breaker, started| async move {
            breaker.guard.run(ctx, started, call).await
        })
        .await
    }

    /// Run a blocking call to `key` through the breaker on tokio's blocking
    /// pool. At the deadline the call is detached, not stopped.
    pub async fn execute_blocking<F, E>(
        &self,
        key: &str,
        ctx: &CallContext,
        call: F,
    ) -> Result<Response<T>, BreakerError>
    where
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        self.execute_with(key, ctx, move |breaker, started| async move {
            breaker.guard.run_blocking(ctx, started, call).await
        })
        .await
    }

    async fn execute_with<R, RFut>(
        &self,
        key: &str,
        ctx: &CallContext,
        run: R,
    ) -> Result<Response<T>, BreakerError>
    where
        R: FnOnce(Arc<DependencyBreaker>, Instant) -> RFut,
        RFut: Future<Output = GuardResult<T>>,
    {
        let started = Instant::now();
        self.metrics.increment_calls();
        let breaker = self.breaker(key);

        let admission = match breaker.controller.admit(ctx) {
            Decision::Allow(admission) => HeldAdmission::new(Arc::clone(&breaker), admission),
            Decision::Reject { reason, retry_after } => {
                let err = rejection_error(key, reason, retry_after, breaker.guard.max_concurrency());
                debug!(
                    dependency = %key,
                    operation = ctx.operation(),
                    reason = %reason,
                    "Call rejected by breaker"
                );
                return self.fall_back(key, ctx, err);
            }
        };

        match run(Arc::clone(&breaker), started).await {
            GuardResult::Success(value) => {
                self.settle(&breaker, admission, OutcomeKind::Ok, started);
                self.fallbacks.remember(key, ctx.operation(), &value);
                Ok(Response::Live(value))
            }
            GuardResult::Failure { kind, cause } => {
                self.settle(&breaker, admission, kind, started);
                if kind == OutcomeKind::Cancelled {
                    return Err(cause);
                }
                if ctx.caller_retries() {
                    debug!(
                        dependency = %key,
                        operation = ctx.operation(),
                        error = %cause,
                        "Caller retries on its own, skipping fallback"
                    );
                    return Err(cause);
                }
                self.fall_back(key, ctx, cause)
            }
            GuardResult::Rejected(reason) => {
                self.settle(&breaker, admission, OutcomeKind::ConcurrencyRejected, started);
                self.metrics.increment_rejected(reason);
                let err = rejection_error(key, reason, Duration::ZERO, breaker.guard.max_concurrency());
                self.fall_back(key, ctx, err)
            }
            GuardResult::Withdrawn => {
                admission.abandon();
                self.metrics.increment_withdrawn();
                debug!(
                    dependency = %key,
                    operation = ctx.operation(),
                    "Caller cancelled while queued, nothing recorded"
                );
                Err(BreakerError::Cancelled {
                    dependency: key.to_string(),
                })
            }
        }
    }

    fn settle(
        &self,
        breaker: &DependencyBreaker,
        admission: HeldAdmission,
        kind: OutcomeKind,
        started: Instant,
    ) {
        let record = OutcomeRecord::new(kind, started.elapsed());
        self.metrics.increment_outcome(kind);
        if let Some(admission) = admission.take() {
            breaker.controller.record_outcome(admission, &record);
        }
    }

    fn fall_back(
        &self,
        key: &str,
        ctx: &CallContext,
        err: BreakerError,
    ) -> Result<Response<T>, BreakerError> {
        match self.fallbacks.dispatch(key, ctx.operation(), ctx.payload(), err) {
            Dispatch::Fallback(FallbackResult::Cached(v)) => Ok(Response::Cached(v)),
            Dispatch::Fallback(FallbackResult::Default(v)) => Ok(Response::Default(v)),
            Dispatch::Fallback(FallbackResult::Queued(ticket)) => Ok(Response::Pending(ticket)),
            Dispatch::Fallback(FallbackResult::FailFast(err)) | Dispatch::Propagate(err) => Err(err),
        }
    }
}

/// An admission that has not been settled yet. If the `execute` future is
/// dropped mid-call (caller timeout, losing `select!` arm, aborted task) the
/// admission is abandoned on drop, so a half-open probe slot is never lost.
struct HeldAdmission {
    breaker: Arc<DependencyBreaker>,
    admission: Option<Admission>,
}

impl HeldAdmission {
    fn new(breaker: Arc<DependencyBreaker>, admission: Admission) -> Self {
        Self {
            breaker,
            admission: Some(admission),
        }
    }

    fn take(mut self) -> Option<Admission> {
        self.admission.take()
    }

    fn abandon(mut self) {
        if let Some(admission) = self.admission.take() {
            self.breaker.controller.abandon(admission);
        }
    }
}

impl Drop for HeldAdmission {
    fn drop(&mut self) {
        if let Some(admission) = self.admission.take() {
            debug!(
                dependency = %self.breaker.controller.name(),
                probe = admission.is_probe(),
                "Call dropped before it settled, releasing its admission"
            );
            self.breaker.controller.abandon(admission);
        }
    }
}

fn rejection_error(key: &str, reason: RejectReason, retry_after: Duration, limit: usize) -> BreakerError {
    let dependency = key.to_string();
    match reason {
        RejectReason::CircuitOpen => BreakerError::Tripped {
            dependency,
            remaining: retry_after,
        },
        RejectReason::ProbeSaturated => BreakerError::ProbeSaturated { dependency },
        RejectReason::ConcurrencyRejected => BreakerError::ConcurrencyRejected { dependency, limit },
    }
}

impl<T: Clone + Send + Sync> SnapshotSource for BreakerRegistry<T> {
    fn engine_snapshot(&self) -> EngineSnapshot {
        let breakers = self.snapshots();
        let status = if breakers.iter().all(|b| b.state == CircuitState::Closed) {
            "operational"
        } else {
            "degraded"
        };
        EngineSnapshot {
            status: status.to_string(),
            metrics: self.metrics.snapshot(),
            breakers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_queue::ChannelRetryQueue;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn quick_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(5),
            max_recovery_timeout: Duration::from_secs(60),
            half_open_probe_limit: 1,
            half_open_success_threshold: 2,
            ..BreakerConfig::default()
        }
    }

    fn registry() -> BreakerRegistry<u32> {
        let reg = BreakerRegistry::new(EngineConfig::default());
        reg.register_breaker("carrier_api", quick_config()).unwrap();
        reg
    }

    async fn fail(reg: &BreakerRegistry<u32>, key: &str) -> Result<Response<u32>, BreakerError> {
        reg.execute(key, &CallContext::new("lookup"), |_| async {
            Err::<u32, _>(anyhow::anyhow!("502 bad gateway"))
        })
        .await
    }

    async fn succeed(reg: &BreakerRegistry<u32>, key: &str, v: u32) -> Result<Response<u32>, BreakerError> {
        reg.execute(key, &CallContext::new("lookup"), move |_| async move { Ok::<_, anyhow::Error>(v) })
            .await
    }

    async fn trip(reg: &BreakerRegistry<u32>) {
        for _ in 0..3 {
            assert!(fail(reg, "carrier_api").await.is_err());
        }
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_success_passes_through() {
        let reg = registry();
        assert_eq!(succeed(&reg, "carrier_api", 7).await.unwrap(), Response::Live(7));
        let snap = reg.snapshot("carrier_api").unwrap();
        assert_eq!(snap.volume, 1);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_never_invokes_the_call() {
        let reg = registry();
        trip(&reg).await;

        let invoked = AtomicBool::new(false);
        let res = reg
            .execute("carrier_api", &CallContext::new("lookup"), |_| {
                invoked.store(true, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(1) }
            })
            .await;

        assert!(matches!(res, Err(BreakerError::Tripped { .. })));
        assert!(!invoked.load(Ordering::SeqCst));
        assert_eq!(reg.metrics().snapshot().rejected_circuit_open, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_through_half_open() {
        let reg = registry();
        trip(&reg).await;

        tokio::time::advance(Duration::from_secs(5) + Duration::from_millis(1)).await;
        assert_eq!(succeed(&reg, "carrier_api", 1).await.unwrap(), Response::Live(1));
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::HalfOpen));
        assert_eq!(succeed(&reg, "carrier_api", 2).await.unwrap(), Response::Live(2));
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Closed));

        let snap = reg.snapshot("carrier_api").unwrap();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.volume, 5);
        assert_eq!(reg.metrics().snapshot().circuit_breaker_recoveries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_saturated_while_probe_in_flight() {
        let reg = Arc::new(registry());
        trip(&reg).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let release = Arc::new(Notify::new());
        let probe = {
            let reg = Arc::clone(&reg);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                reg.execute("carrier_api", &CallContext::new("lookup"), |_| async move {
                    release.notified().await;
                    Ok::<_, anyhow::Error>(1)
                })
                .await
            })
        };
        while reg.breaker("carrier_api").guard().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(matches!(
            succeed(&reg, "carrier_api", 2).await,
            Err(BreakerError::ProbeSaturated { .. })
        ));

        release.notify_waiters();
        assert!(probe.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_eleventh_concurrent_call_rejected_and_not_counted() {
        let reg = Arc::new(BreakerRegistry::<u32>::new(EngineConfig::default()));
        reg.register_breaker(
            "rate_engine",
            BreakerConfig {
                max_concurrency: 10,
                ..BreakerConfig::default()
            },
        )
        .unwrap();

        let release = Arc::new(Notify::new());
        let holders: Vec<_> = (0..10)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let release = Arc::clone(&release);
                tokio::spawn(async move {
                    reg.execute("rate_engine", &CallContext::new("quote"), |_| async move {
                        release.notified().await;
                        Ok::<_, anyhow::Error>(1)
                    })
                    .await
                })
            })
            .collect();
        while reg.breaker("rate_engine").guard().in_flight() < 10 {
            tokio::task::yield_now().await;
        }

        let invoked = AtomicBool::new(false);
        let res = reg
            .execute("rate_engine", &CallContext::new("quote"), |_| {
                invoked.store(true, Ordering::SeqCst);
                async { Ok::<_, anyhow::Error>(2) }
            })
            .await;
        assert!(matches!(
            res,
            Err(BreakerError::ConcurrencyRejected { limit: 10, .. })
        ));
        assert!(!invoked.load(Ordering::SeqCst));

        let snap = reg.snapshot("rate_engine").unwrap();
        assert_eq!(snap.volume, 0);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.rejected_in_window, 1);
        assert_eq!(snap.state, CircuitState::Closed);

        release.notify_waiters();
        for h in holders {
            assert_eq!(h.await.unwrap().unwrap(), Response::Live(1));
        }
        let snap = reg.snapshot("rate_engine").unwrap();
        assert_eq!(snap.volume, 10);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_fallback_served_once_per_rejection() {
        let reg = registry();
        reg.register_fallback("carrier_api", "lookup", FallbackStrategy::DefaultValue(0));

        // Failures route through the fallback too.
        assert_eq!(fail(&reg, "carrier_api").await.unwrap(), Response::Default(0));
        fail(&reg, "carrier_api").await.unwrap();
        fail(&reg, "carrier_api").await.unwrap();
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Open));

        let before = reg.metrics().snapshot().fallbacks_served;
        let res = succeed(&reg, "carrier_api", 9).await.unwrap();
        assert_eq!(res, Response::Default(0));
        assert!(res.is_degraded());
        assert_eq!(reg.metrics().snapshot().fallbacks_served, before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_fallback_returns_original_error() {
        let reg = registry();
        match fail(&reg, "carrier_api").await {
            Err(BreakerError::Downstream { dependency, source }) => {
                assert_eq!(dependency, "carrier_api");
                assert_eq!(source.to_string(), "502 bad gateway");
            }
            other => panic!("expected downstream error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_value_serves_last_live_answer() {
        let reg = registry();
        reg.register_fallback(
            "carrier_api",
            "lookup",
            FallbackStrategy::CachedValue { default: None },
        );
        succeed(&reg, "carrier_api", 41).await.unwrap();
        succeed(&reg, "carrier_api", 42).await.unwrap();

        for _ in 0..3 {
            assert_eq!(fail(&reg, "carrier_api").await.unwrap(), Response::Cached(42));
        }
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Open));
        assert_eq!(succeed(&reg, "carrier_api", 0).await.unwrap(), Response::Cached(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_for_retry_returns_pending_ticket() {
        let (queue, rx) = ChannelRetryQueue::bounded(8);
        let reg = BreakerRegistry::<u32>::new(EngineConfig::default()).with_retry_queue(Arc::new(queue));
        reg.register_breaker("carrier_api", quick_config()).unwrap();
        reg.register_fallback("carrier_api", "book", FallbackStrategy::QueueForRetry);

        let ctx = CallContext::new("book").with_payload(serde_json::json!({ "load": "LD-1" }));
        let res = reg
            .execute("carrier_api", &ctx, |_| async { Err::<u32, _>(anyhow::anyhow!("timeout upstream")) })
            .await
            .unwrap();

        let ticket = match res {
            Response::Pending(ticket) => ticket,
            other => panic!("expected pending, got {other:?}"),
        };
        let parked = rx.try_recv().unwrap();
        assert_eq!(parked.id, ticket.id);
        assert_eq!(parked.reason, "downstream_error");
        assert_eq!(parked.payload.unwrap()["load"], "LD-1");
        assert_eq!(Response::<u32>::Pending(ticket).into_value(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_retry_skips_fallback_for_failures() {
        let reg = registry();
        reg.register_fallback("carrier_api", "lookup", FallbackStrategy::DefaultValue(0));
        let ctx = CallContext::new("lookup").with_caller_retry();
        let res = reg
            .execute("carrier_api", &ctx, |_| async { Err::<u32, _>(anyhow::anyhow!("503")) })
            .await;
        assert!(matches!(res, Err(BreakerError::Downstream { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let reg = BreakerRegistry::<u32>::new(EngineConfig::default());
        reg.register_breaker(
            "slowpoke",
            BreakerConfig {
                failure_threshold: 2,
                call_timeout: Duration::from_millis(500),
                ..BreakerConfig::default()
            },
        )
        .unwrap();

        for _ in 0..2 {
            let res = reg
                .execute("slowpoke", &CallContext::new("ping"), |_| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, anyhow::Error>(1)
                })
                .await;
            assert!(matches!(res, Err(BreakerError::Timeout { .. })));
        }
        assert_eq!(reg.current_state("slowpoke"), Some(CircuitState::Open));
        assert_eq!(reg.metrics().snapshot().timeouts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_half_open_future_releases_its_slot() {
        let reg = registry();
        trip(&reg).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let ctx = CallContext::new("lookup");
        let gave_up = tokio::time::timeout(
            Duration::from_millis(100),
            reg.execute("carrier_api", &ctx, |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, anyhow::Error>(1)
            }),
        )
        .await;
        assert!(gave_up.is_err());

        let snap = reg.snapshot("carrier_api").unwrap();
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert_eq!(snap.probe_slots_in_use, 0);
        assert_eq!(reg.breaker("carrier_api").guard().in_flight(), 0);

        assert_eq!(succeed(&reg, "carrier_api", 1).await.unwrap(), Response::Live(1));
        assert_eq!(succeed(&reg, "carrier_api", 2).await.unwrap(), Response::Live(2));
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_half_open_task_releases_its_slot() {
        let reg = Arc::new(registry());
        trip(&reg).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let stuck = {
            let reg = Arc::clone(&reg);
            tokio::spawn(async move {
                reg.execute("carrier_api", &CallContext::new("lookup"), |_| async {
                    std::future::pending::<()>().await;
                    Ok::<u32, anyhow::Error>(0)
                })
                .await
            })
        };
        while reg.breaker("carrier_api").guard().in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(reg.snapshot("carrier_api").unwrap().probe_slots_in_use, 1);

        stuck.abort();
        assert!(stuck.await.unwrap_err().is_cancelled());
        assert_eq!(reg.snapshot("carrier_api").unwrap().probe_slots_in_use, 0);

        succeed(&reg, "carrier_api", 1).await.unwrap();
        succeed(&reg, "carrier_api", 2).await.unwrap();
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_call_turned_away_by_guard_gives_slot_back() {
        let reg = Arc::new(BreakerRegistry::<u32>::new(EngineConfig::default()));
        reg.register_breaker(
            "carrier_api",
            BreakerConfig {
                max_concurrency: 1,
                half_open_probe_limit: 2,
                ..quick_config()
            },
        )
        .unwrap();
        trip(&reg).await;
        tokio::time::advance(Duration::from_secs(6)).await;

        let release = Arc::new(Notify::new());
        let first_probe = {
            let reg = Arc::clone(&reg);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                reg.execute("carrier_api", &CallContext::new("lookup"), |_| async move {
                    release.notified().await;
                    Ok::<_, anyhow::Error>(1)
                })
                .await
            })
        };
        while reg.breaker("carrier_api").guard().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        // Second half-open call gets a slot from the prober but no permit from the guard.
        assert!(matches!(
            succeed(&reg, "carrier_api", 2).await,
            Err(BreakerError::ConcurrencyRejected { limit: 1, .. })
        ));
        let snap = reg.snapshot("carrier_api").unwrap();
        assert_eq!(snap.state, CircuitState::HalfOpen);
        assert_eq!(snap.probe_slots_in_use, 1);
        assert_eq!(snap.half_open_successes, 0);

        release.notify_waiters();
        assert_eq!(first_probe.await.unwrap().unwrap(), Response::Live(1));
        assert_eq!(succeed(&reg, "carrier_api", 3).await.unwrap(), Response::Live(3));
        assert_eq!(reg.current_state("carrier_api"), Some(CircuitState::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_queued_records_nothing() {
        let reg = Arc::new(BreakerRegistry::<u32>::new(EngineConfig::default()));
        reg.register_breaker(
            "warehouse",
            BreakerConfig {
                max_concurrency: 1,
                max_queue_wait: Duration::from_secs(5),
                ..BreakerConfig::default()
            },
        )
        .unwrap();

        let release = Arc::new(Notify::new());
        let holder = {
            let reg = Arc::clone(&reg);
            let release = Arc::clone(&release);
            tokio::spawn(async move {
                reg.execute("warehouse", &CallContext::new("pick"), |_| async move {
                    release.notified().await;
                    Ok::<_, anyhow::Error>(1)
                })
                .await
            })
        };
        while reg.breaker("warehouse").guard().in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let token = CancellationToken::new();
        let ctx = CallContext::new("pick").with_cancellation(token.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });
        let res = reg
            .execute("warehouse", &ctx, |_| async { Ok::<_, anyhow::Error>(2) })
            .await;
        assert!(matches!(res, Err(BreakerError::Cancelled { .. })));

        let snap = reg.snapshot("warehouse").unwrap();
        assert_eq!(snap.volume, 0);
        assert_eq!(snap.rejected_in_window, 0);
        assert_eq!(reg.metrics().snapshot().withdrawn_while_queued, 1);

        release.notify_waiters();
        holder.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_in_flight_records_cancelled_without_fallback() {
        let reg = registry();
        reg.register_fallback("carrier_api", "lookup", FallbackStrategy::DefaultValue(0));
        let token = CancellationToken::new();
        let ctx = CallContext::new("lookup").with_cancellation(token.clone());
        let observed = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&observed);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            token.cancel();
        });
        let res = reg
            .execute("carrier_api", &ctx, move |call_token| async move {
                call_token.cancelled().await;
                seen.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(1)
            })
            .await;

        assert!(matches!(res, Err(BreakerError::Cancelled { .. })));
        let snap = reg.snapshot("carrier_api").unwrap();
        assert_eq!(snap.volume, 0);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(reg.metrics().snapshot().cancellations, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breakers_are_created_lazily() {
        let reg = BreakerRegistry::<u32>::new(EngineConfig::default());
        assert_eq!(reg.current_state("fuel_index"), None);
        succeed(&reg, "fuel_index", 3).await.unwrap();
        assert_eq!(reg.current_state("fuel_index"), Some(CircuitState::Closed));
        assert_eq!(reg.dependencies(), vec!["fuel_index".to_string()]);
    }

    #[test]
    fn test_register_breaker_rejects_bad_config() {
        let reg = BreakerRegistry::<u32>::new(EngineConfig::default());
        let bad = BreakerConfig {
            error_rate_threshold: 1.5,
            ..BreakerConfig::default()
        };
        assert!(reg.register_breaker("broken", bad).is_err());
        assert_eq!(reg.current_state("broken"), None);
    }

    #[tokio::test]
    async fn test_execute_blocking_success() {
        let reg = BreakerRegistry::<u32>::new(EngineConfig::default());
        let res = reg
            .execute_blocking("legacy_edi", &CallContext::new("parse"), |_| Ok::<_, anyhow::Error>(12))
            .await
            .unwrap();
        assert_eq!(res, Response::Live(12));
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_snapshot_reports_degraded_breakers() {
        let reg = registry();
        succeed(&reg, "healthy", 1).await.unwrap();
        trip(&reg).await;

        let snap = reg.engine_snapshot();
        assert_eq!(snap.status, "degraded");
        assert_eq!(snap.breakers.len(), 2);
        assert_eq!(snap.breakers[0].dependency, "carrier_api");
        assert_eq!(snap.breakers[0].state, CircuitState::Open);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["breakers"][1]["state"], "closed");
    }
}
