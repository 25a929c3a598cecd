//! Tripwire: per-dependency adaptive circuit breakers.
//!
//! Build a [`BreakerRegistry`], share it behind an `Arc`, and route every
//! outbound call through [`BreakerRegistry::execute`] (or
//! [`BreakerRegistry::execute_blocking`]). Each dependency key gets its own
//! sliding-window failure tracker, state machine, half-open prober and
//! concurrency/timeout guard; rejected or failed calls go through the
//! registered fallback strategy exactly once.

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod fallback;
pub mod guard;
pub mod metrics;
pub mod models;
pub mod prober;
pub mod publisher;
pub mod registry;
pub mod retry_queue;
pub mod window;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, Decision};
pub use config::{BreakerConfig, ConfigError, EngineConfig};
pub use error::BreakerError;
pub use fallback::{Dispatch, FallbackDispatcher, FallbackResult, FallbackStrategy};
pub use guard::{AdmissionGuard, GuardResult};
pub use metrics::{run_metrics_server, EngineSnapshot, MetricsCollector, SnapshotSource};
pub use models::{CallContext, CircuitState, OutcomeKind, OutcomeRecord, RejectReason};
pub use publisher::RedisRetryPublisher;
pub use registry::{BreakerRegistry, DependencyBreaker, Response};
pub use retry_queue::{ChannelRetryQueue, DeferredRequest, DeferredTicket, QueueError, RetryQueue};
