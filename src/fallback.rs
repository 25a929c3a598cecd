// =============================================================================
// fallback.rs - PLAN B
// =============================================================================
//
// A rejected or failed call is handed here exactly once. The dispatcher looks
// up what the application registered for `(dependency, operation)` and either
// produces a degraded answer or tells the caller to surface the original
// error as-is.
//
// It never admits anything and never touches breaker state. It does keep a
// small LRU of last-known-good responses, fed by live successes, for the
// operations registered with `CachedValue`.
// =============================================================================

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::BreakerError;
use crate::metrics::MetricsCollector;
use crate::retry_queue::{DeferredRequest, DeferredTicket, RetryQueue};

type OperationKey = (String, String);

/// What to do when a call to `(dependency, operation)` cannot be served live.
#[derive(Debug, Clone)]
pub enum FallbackStrategy<T> {
    /// Last-known-good response for this operation, else `default`, else
    /// propagate.
    CachedValue { default: Option<T> },
    /// A static placeholder.
    DefaultValue(T),
    /// Park the request for deferred replay and answer "accepted, pending".
    QueueForRetry,
    /// Hand the original error straight back.
    FailFast,
}

impl<T> FallbackStrategy<T> {
    pub fn label(&self) -> &'static str {
        match self {
            FallbackStrategy::CachedValue { .. } => "cached_value",
            FallbackStrategy::DefaultValue(_) => "default_value",
            FallbackStrategy::QueueForRetry => "queue_for_retry",
            FallbackStrategy::FailFast => "fail_fast",
        }
    }
}

#[derive(Debug)]
pub enum FallbackResult<T> {
    Cached(T),
    Default(T),
    Queued(DeferredTicket),
    FailFast(BreakerError),
}

#[derive(Debug)]
pub enum Dispatch<T> {
    Fallback(FallbackResult<T>),
    /// Nothing registered (or the strategy had nothing to offer): surface the
    /// original error unchanged.
    Propagate(BreakerError),
}

pub struct FallbackDispatcher<T> {
    strategies: RwLock<HashMap<OperationKey, FallbackStrategy<T>>>,
    last_known_good: Mutex<LruCache<OperationKey, T>>,
    retry_queue: Option<Arc<dyn RetryQueue>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl<T: Clone> FallbackDispatcher<T> {
    pub fn new(cache_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            strategies: RwLock::new(HashMap::new()),
            last_known_good: Mutex::new(LruCache::new(capacity)),
            retry_queue: None,
            metrics: None,
        }
    }

    pub fn with_retry_queue(mut self, queue: Arc<dyn RetryQueue>) -> Self {
        self.retry_queue = Some(queue);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Register (or replace) the strategy for one operation on one dependency.
    pub fn register(&self, dependency: &str, operation: &str, strategy: FallbackStrategy<T>) {
        info!(
            dependency = %dependency,
            operation = %operation,
            strategy = strategy.label(),
            "Fallback registered"
        );
        self.strategies
            .write()
            .insert((dependency.to_string(), operation.to_string()), strategy);
    }

    /// Remember a live success, if this operation serves cached values.
    pub fn remember(&self, dependency: &str, operation: &str, value: &T) {
        let key = (dependency.to_string(), operation.to_string());
        let caches = matches!(
            self.strategies.read().get(&key),
            Some(FallbackStrategy::CachedValue { .. })
        );
        if caches {
            self.last_known_good.lock().put(key, value.clone());
        }
    }

    /// Decide what the caller gets instead of a live response.
    pub fn dispatch(
        &self,
        dependency: &str,
        operation: &str,
        payload: Option<&serde_json::Value>,
        original: BreakerError,
    ) -> Dispatch<T> {
        let key = (dependency.to_string(), operation.to_string());
        let strategy = self.strategies.read().get(&key).cloned();

        let outcome = match strategy {
            None => {
                debug!(
                    dependency = %dependency,
                    operation = %operation,
                    error = %original,
                    "No fallback registered, propagating"
                );
                Dispatch::Propagate(original)
            }
            Some(FallbackStrategy::DefaultValue(value)) => {
                Dispatch::Fallback(FallbackResult::Default(value))
            }
            Some(FallbackStrategy::CachedValue { default }) => {
                let cached = self.last_known_good.lock().get(&key).cloned();
                match (cached, default) {
                    (Some(value), _) => Dispatch::Fallback(FallbackResult::Cached(value)),
                    (None, Some(value)) => Dispatch::Fallback(FallbackResult::Default(value)),
                    (None, None) => Dispatch::Propagate(original),
                }
            }
            Some(FallbackStrategy::QueueForRetry) => self.defer(key, payload, original),
            Some(FallbackStrategy::FailFast) => Dispatch::Fallback(FallbackResult::FailFast(original)),
        };

        if let Some(m) = &self.metrics {
            match &outcome {
                Dispatch::Fallback(FallbackResult::FailFast(_)) | Dispatch::Propagate(_) => {
                    m.increment_fallback_propagated()
                }
                Dispatch::Fallback(_) => m.increment_fallback_served(),
            }
        }
        outcome
    }

    fn defer(
        &self,
        key: OperationKey,
        payload: Option<&serde_json::Value>,
        original: BreakerError,
    ) -> Dispatch<T> {
        let Some(queue) = &self.retry_queue else {
            warn!(
                dependency = %key.0,
                operation = %key.1,
                "QueueForRetry registered but no retry queue configured, propagating"
            );
            return Dispatch::Propagate(original);
        };

        let (dependency, operation) = key;
        let request = DeferredRequest::new(dependency, operation, payload.cloned(), original.label());
        match queue.enqueue(request) {
            Ok(ticket) => {
                if let Some(m) = &self.metrics {
                    m.increment_retry_enqueued();
                }
                debug!(
                    request_id = %ticket.id,
                    dependency = %original.dependency(),
                    "Call deferred for replay"
                );
                Dispatch::Fallback(FallbackResult::Queued(ticket))
            }
            Err(e) => {
                if let Some(m) = &self.metrics {
                    m.increment_retry_enqueue_failures();
                }
                warn!(
                    dependency = %original.dependency(),
                    error = %e,
                    "Could not defer call, propagating original error"
                );
                Dispatch::Propagate(original)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_queue::ChannelRetryQueue;
    use std::time::Duration;

    fn tripped() -> BreakerError {
        BreakerError::Tripped {
            dependency: "pricing".into(),
            remaining: Duration::from_secs(12),
        }
    }

    #[test]
    fn test_default_value_is_served() {
        let d = FallbackDispatcher::new(16);
        d.register("pricing", "quote", FallbackStrategy::DefaultValue(0u32));
        match d.dispatch("pricing", "quote", None, tripped()) {
            Dispatch::Fallback(FallbackResult::Default(v)) => assert_eq!(v, 0),
            other => panic!("expected default, got {other:?}"),
        }
    }

    #[test]
    fn test_unregistered_propagates_original_error() {
        let d: FallbackDispatcher<u32> = FallbackDispatcher::new(16);
        d.register("pricing", "other_op", FallbackStrategy::DefaultValue(0));
        match d.dispatch("pricing", "quote", None, tripped()) {
            Dispatch::Propagate(BreakerError::Tripped { dependency, remaining }) => {
                assert_eq!(dependency, "pricing");
                assert_eq!(remaining, Duration::from_secs(12));
            }
            other => panic!("expected propagate, got {other:?}"),
        }
    }

    #[test]
    fn test_cached_value_prefers_last_known_good() {
        let d = FallbackDispatcher::new(16);
        d.register(
            "pricing",
            "quote",
            FallbackStrategy::CachedValue { default: Some(1u32) },
        );

        assert!(matches!(
            d.dispatch("pricing", "quote", None, tripped()),
            Dispatch::Fallback(FallbackResult::Default(1))
        ));

        d.remember("pricing", "quote", &99);
        d.remember("pricing", "quote", &100);
        assert!(matches!(
            d.dispatch("pricing", "quote", None, tripped()),
            Dispatch::Fallback(FallbackResult::Cached(100))
        ));
    }

    #[test]
    fn test_cached_value_without_anything_propagates() {
        let d: FallbackDispatcher<u32> = FallbackDispatcher::new(16);
        d.register("pricing", "quote", FallbackStrategy::CachedValue { default: None });
        assert!(matches!(
            d.dispatch("pricing", "quote", None, tripped()),
            Dispatch::Propagate(BreakerError::Tripped { .. })
        ));
    }

    #[test]
    fn test_remember_ignores_operations_that_do_not_cache() {
        let d = FallbackDispatcher::new(16);
        d.register("pricing", "quote", FallbackStrategy::DefaultValue(5u32));
        d.remember("pricing", "quote", &77);
        assert!(matches!(
            d.dispatch("pricing", "quote", None, tripped()),
            Dispatch::Fallback(FallbackResult::Default(5))
        ));
    }

    #[test]
    fn test_cache_is_bounded() {
        let d = FallbackDispatcher::new(1);
        d.register("pricing", "a", FallbackStrategy::CachedValue { default: None });
        d.register("pricing", "b", FallbackStrategy::CachedValue { default: None });
        d.remember("pricing", "a", &1u32);
        d.remember("pricing", "b", &2u32);
        assert!(matches!(
            d.dispatch("pricing", "a", None, tripped()),
            Dispatch::Propagate(_)
        ));
        assert!(matches!(
            d.dispatch("pricing", "b", None, tripped()),
            Dispatch::Fallback(FallbackResult::Cached(2))
        ));
    }

    #[test]
    fn test_queue_for_retry_parks_the_request() {
        let (queue, rx) = ChannelRetryQueue::bounded(8);
        let metrics = Arc::new(MetricsCollector::new());
        let d: FallbackDispatcher<u32> = FallbackDispatcher::new(16)
            .with_retry_queue(Arc::new(queue))
            .with_metrics(Arc::clone(&metrics));
        d.register("pricing", "reprice", FallbackStrategy::QueueForRetry);

        let payload = serde_json::json!({ "sku": "PALLET-9" });
        let ticket = match d.dispatch("pricing", "reprice", Some(&payload), tripped()) {
            Dispatch::Fallback(FallbackResult::Queued(ticket)) => ticket,
            other => panic!("expected queued, got {other:?}"),
        };

        let parked = rx.try_recv().unwrap();
        assert_eq!(parked.id, ticket.id);
        assert_eq!(parked.reason, "circuit_open");
        assert_eq!(parked.payload, Some(payload));
        assert_eq!(metrics.snapshot().retries_enqueued, 1);
        assert_eq!(metrics.snapshot().fallbacks_served, 1);
    }

    #[test]
    fn test_queue_for_retry_without_room_propagates() {
        let d: FallbackDispatcher<u32> = FallbackDispatcher::new(16);
        d.register("pricing", "reprice", FallbackStrategy::QueueForRetry);
        assert!(matches!(
            d.dispatch("pricing", "reprice", None, tripped()),
            Dispatch::Propagate(_)
        ));

        let (queue, _rx) = ChannelRetryQueue::bounded(1);
        let d: FallbackDispatcher<u32> = FallbackDispatcher::new(16).with_retry_queue(Arc::new(queue));
        d.register("pricing", "reprice", FallbackStrategy::QueueForRetry);
        assert!(matches!(
            d.dispatch("pricing", "reprice", None, tripped()),
            Dispatch::Fallback(FallbackResult::Queued(_))
        ));
        assert!(matches!(
            d.dispatch("pricing", "reprice", None, tripped()),
            Dispatch::Propagate(_)
        ));
    }

    #[test]
    fn test_fail_fast_returns_original() {
        let d: FallbackDispatcher<u32> = FallbackDispatcher::new(16);
        d.register("pricing", "quote", FallbackStrategy::FailFast);
        match d.dispatch("pricing", "quote", None, tripped()) {
            Dispatch::Fallback(FallbackResult::FailFast(err)) => {
                assert!(matches!(err, BreakerError::Tripped { .. }))
            }
            other => panic!("expected fail fast, got {other:?}"),
        }
    }
}
