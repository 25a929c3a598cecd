// =============================================================================
// models.rs - THE VOCABULARY OF DOWNSTREAM DISAPPOINTMENT
// =============================================================================
//
// The small value types every other module speaks in: what state a breaker
// is in, how a call ended, why a call was turned away, and the per-call
// context a caller hands us.
//
// Nothing in here owns a lock or a clock. These are plain values that get
// passed around, copied, logged, and serialized into snapshots.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The three states of a circuit breaker.
///
/// - Closed: the dependency is presumed healthy, calls flow through.
/// - Open: the dependency is presumed broken, calls fail fast.
/// - HalfOpen: a handful of probe calls are testing whether it recovered.
///
/// There is no terminal state. A breaker cycles through these for as long
/// as the registry that owns it is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// How a single call ended.
///
/// Only `Ok`, `Timeout` and `DownstreamError` feed the failure-rate math.
/// `ConcurrencyRejected` and `Cancelled` are tracked on the side so the
/// breaker can never trip itself by being busy, or because a caller got bored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Ok,
    Timeout,
    DownstreamError,
    ConcurrencyRejected,
    Cancelled,
}

impl OutcomeKind {
    /// Whether this outcome participates in volume / error-rate accounting.
    pub fn counts_toward_failure_rate(self) -> bool {
        matches!(
            self,
            OutcomeKind::Ok | OutcomeKind::Timeout | OutcomeKind::DownstreamError
        )
    }

    /// A completed call that failed: the only kind that extends a failure streak.
    pub fn is_failure(self) -> bool {
        matches!(self, OutcomeKind::Timeout | OutcomeKind::DownstreamError)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Ok => "ok",
            OutcomeKind::Timeout => "timeout",
            OutcomeKind::DownstreamError => "downstream_error",
            OutcomeKind::ConcurrencyRejected => "concurrency_rejected",
            OutcomeKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One completed (or locally rejected) call, as seen by the tracker.
///
/// The timestamp alone decides which window bucket the record lands in, so
/// records from concurrent callers may arrive in any order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeRecord {
    pub timestamp: Instant,
    pub success: bool,
    pub latency: Duration,
    pub kind: OutcomeKind,
}

impl OutcomeRecord {
    /// A record stamped with the current time.
    pub fn new(kind: OutcomeKind, latency: Duration) -> Self {
        Self::at(Instant::now(), kind, latency)
    }

    pub fn at(timestamp: Instant, kind: OutcomeKind, latency: Duration) -> Self {
        Self {
            timestamp,
            success: kind == OutcomeKind::Ok,
            latency,
            kind,
        }
    }

    pub fn latency_millis(&self) -> u64 {
        self.latency.as_millis() as u64
    }
}

/// Why a call never reached the dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The circuit is Open and the recovery timeout has not elapsed.
    CircuitOpen,
    /// The circuit is HalfOpen and every probe slot is taken.
    ProbeSaturated,
    /// The admission guard has no concurrency permit left.
    ConcurrencyRejected,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::CircuitOpen => "circuit_open",
            RejectReason::ProbeSaturated => "probe_saturated",
            RejectReason::ConcurrencyRejected => "concurrency_rejected",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-invocation context. Built by the caller, consumed by one `execute`,
/// never stored anywhere.
#[derive(Debug, Clone)]
pub struct CallContext {
    operation: String,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    payload: Option<serde_json::Value>,
    caller_retries: bool,
}

impl CallContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            deadline: None,
            cancel: CancellationToken::new(),
            payload: None,
            caller_retries: false,
        }
    }

    /// Absolute deadline. The guard uses the earlier of this and
    /// `call_start + call_timeout`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Relative deadline, measured from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tie this call to a caller-owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The request body, kept so `QueueForRetry` can hand it to the replayer.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// The caller runs its own retry loop above `execute`. Failed calls are
    /// handed straight back instead of going through the fallback dispatcher.
    pub fn with_caller_retry(mut self) -> Self {
        self.caller_retries = true;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        self.payload.as_ref()
    }

    pub fn caller_retries(&self) -> bool {
        self.caller_retries
    }
}
