// =============================================================================
// circuit_breaker.rs - THE STATE CONTROLLER
// =============================================================================
//
// One of these per dependency key. It decides whether a call may proceed
// (`admit`), and digests how the call went (`record_outcome`).
//
//   Closed --(streak >= failure_threshold, or
//             volume >= min_volume and error_rate >= threshold)--> Open
//   Open   --(recovery timeout elapsed, next admit)--------------> HalfOpen
//   HalfOpen --(success_threshold good probes)-------------------> Closed
//   HalfOpen --(any failed probe)---------------------------------> Open
//
// The two trip triggers are independent and OR'd: whichever fires first wins.
//
// Every transition bumps a generation counter. Admissions remember the
// generation they were issued under, so a slow probe from a previous
// HalfOpen cycle cannot close (or reopen) a cycle it never belonged to.
//
// All state lives behind one parking_lot Mutex per breaker. Different
// dependencies never touch each other's locks.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::metrics::MetricsCollector;
use crate::models::{CallContext, CircuitState, OutcomeKind, OutcomeRecord, RejectReason};
use crate::prober::{ProbeVerdict, RecoveryProber};
use crate::window::WindowTracker;

/// Proof that `admit` let a call through. Hand it back to `record_outcome`
/// (or `abandon`) exactly once.
#[derive(Debug)]
#[must_use = "an admission must be settled with record_outcome or abandon"]
pub struct Admission {
    probe: bool,
    generation: u64,
}

impl Admission {
    /// Whether this call occupies a HalfOpen probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

#[derive(Debug)]
pub enum Decision {
    Allow(Admission),
    Reject {
        reason: RejectReason,
        /// Time left before the breaker will consider probing. Zero for
        /// `probe_saturated`.
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TripCause {
    Streak(u32),
    ErrorRate { volume: u64, rate: f64 },
}

/// Rejections since the breaker last closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RejectionCounters {
    pub circuit_open: u64,
    pub probe_saturated: u64,
    pub concurrency: u64,
}

struct CircuitBreakerInner {
    state: CircuitState,
    generation: u64,
    last_trip: Option<Instant>,
    last_state_change: Instant,
    last_state_change_at: DateTime<Utc>,
    tracker: WindowTracker,
    prober: RecoveryProber,
    rejections: RejectionCounters,
    total_trips: u64,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<CircuitBreakerInner>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let name = name.into();
        info!(
            dependency = %name,
            failure_threshold = config.failure_threshold,
            min_volume = config.min_volume,
            error_rate_threshold = config.error_rate_threshold,
            window_secs = config.window_duration.as_secs(),
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            "Circuit breaker initialized"
        );

        let now = Instant::now();
        let inner = CircuitBreakerInner {
            state: CircuitState::Closed,
            generation: 0,
            last_trip: None,
            last_state_change: now,
            last_state_change_at: Utc::now(),
            tracker: WindowTracker::with_origin(config.window_duration, config.bucket_width, now),
            prober: RecoveryProber::new(
                config.half_open_probe_limit,
                config.half_open_success_threshold,
                config.recovery_timeout,
                config.backoff_multiplier,
                config.max_recovery_timeout,
            ),
            rejections: RejectionCounters::default(),
            total_trips: 0,
        };

        Self {
            name,
            config,
            inner: Mutex::new(inner),
            metrics: None,
        }
    }

    /// Report trips, recoveries and rejections to a shared collector.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decide whether the call described by `ctx` may reach the dependency.
    pub fn admit(&self, ctx: &CallContext) -> Decision {
        self.admit_at(ctx, Instant::now())
    }

    pub fn admit_at(&self, ctx: &CallContext, now: Instant) -> Decision {
        let mut inner = self.inner.lock();
        let state = inner.state;

        match state {
            CircuitState::Closed => {
                if let Some(cause) = self.trip_check(&mut inner, now) {
                    self.trip(&mut inner, now, cause);
                    return self.reject_open(&mut inner, now);
                }
                Decision::Allow(Admission {
                    probe: false,
                    generation: inner.generation,
                })
            }
            CircuitState::Open => {
                let timeout = inner.prober.recovery_timeout();
                let elapsed = inner
                    .last_trip
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(timeout);
                if elapsed < timeout {
                    return self.reject_open(&mut inner, now);
                }

                info!(
                    dependency = %self.name,
                    open_for_ms = elapsed.as_millis() as u64,
                    "Circuit breaker transitioning OPEN -> HALF_OPEN, probing"
                );
                self.transition(&mut inner, CircuitState::HalfOpen, now);
                inner.prober.begin_cycle();
                self.admit_probe(&mut inner, ctx)
            }
            CircuitState::HalfOpen => self.admit_probe(&mut inner, ctx),
        }
    }

    fn admit_probe(&self, inner: &mut CircuitBreakerInner, ctx: &CallContext) -> Decision {
        if inner.prober.try_acquire() {
            debug!(
                dependency = %self.name,
                operation = ctx.operation(),
                slots_in_use = inner.prober.slots_in_use(),
                "Probe admitted"
            );
            Decision::Allow(Admission {
                probe: true,
                generation: inner.generation,
            })
        } else {
            inner.rejections.probe_saturated += 1;
            if let Some(m) = &self.metrics {
                m.increment_rejected(RejectReason::ProbeSaturated);
            }
            Decision::Reject {
                reason: RejectReason::ProbeSaturated,
                retry_after: Duration::ZERO,
            }
        }
    }

    fn reject_open(&self, inner: &mut CircuitBreakerInner, now: Instant) -> Decision {
        inner.rejections.circuit_open += 1;
        if let Some(m) = &self.metrics {
            m.increment_rejected(RejectReason::CircuitOpen);
        }
        let elapsed = inner
            .last_trip
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        Decision::Reject {
            reason: RejectReason::CircuitOpen,
            retry_after: inner.prober.recovery_timeout().saturating_sub(elapsed),
        }
    }

    /// Digest the outcome of an admitted call.
    pub fn record_outcome(&self, admission: Admission, outcome: &OutcomeRecord) -> Option<Transition> {
        self.record_outcome_at(admission, outcome, Instant::now())
    }

    pub fn record_outcome_at(
        &self,
        admission: Admission,
        outcome: &OutcomeRecord,
        now: Instant,
    ) -> Option<Transition> {
        let mut inner = self.inner.lock();
        inner.tracker.record_at(outcome, now);
        if outcome.kind == OutcomeKind::ConcurrencyRejected {
            inner.rejections.concurrency += 1;
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                if !outcome.kind.counts_toward_failure_rate() {
                    return None;
                }
                let cause = self.trip_check(&mut inner, now)?;
                Some(self.trip(&mut inner, now, cause))
            }
            CircuitState::HalfOpen => {
                if !admission.probe || admission.generation != inner.generation {
                    debug!(
                        dependency = %self.name,
                        kind = %outcome.kind,
                        "Outcome from an earlier cycle ignored by the prober"
                    );
                    return None;
                }
                if !outcome.kind.counts_toward_failure_rate() {
                    inner.prober.release();
                    return None;
                }
                match inner.prober.on_probe_outcome(outcome.success) {
                    ProbeVerdict::KeepProbing => {
                        debug!(
                            dependency = %self.name,
                            successes = inner.prober.success_count(),
                            needed = self.config.half_open_success_threshold,
                            "Probe succeeded"
                        );
                        None
                    }
                    ProbeVerdict::Recovered => Some(self.close(&mut inner, now)),
                    ProbeVerdict::Relapsed => Some(self.reopen(&mut inner, now, outcome.kind)),
                }
            }
            // Late results from calls admitted before the trip. The tracker
            // already has them; nothing else to do.
            CircuitState::Open => None,
        }
    }

    /// Release an admission without recording anything, e.g. when the caller
    /// cancelled while still queued for a concurrency permit.
    pub fn abandon(&self, admission: Admission) {
        let mut inner = self.inner.lock();
        if admission.probe
            && inner.state == CircuitState::HalfOpen
            && admission.generation == inner.generation
        {
            inner.prober.release();
        }
    }

    fn trip_check(&self, inner: &mut CircuitBreakerInner, now: Instant) -> Option<TripCause> {
        let streak = inner.tracker.consecutive_failures();
        if streak >= self.config.failure_threshold {
            return Some(TripCause::Streak(streak));
        }
        let (volume, rate) = inner.tracker.volume_and_rate(now);
        if volume >= self.config.min_volume && rate >= self.config.error_rate_threshold {
            return Some(TripCause::ErrorRate { volume, rate });
        }
        None
    }

    fn trip(&self, inner: &mut CircuitBreakerInner, now: Instant, cause: TripCause) -> Transition {
        match cause {
            TripCause::Streak(failures) => warn!(
                dependency = %self.name,
                consecutive_failures = failures,
                threshold = self.config.failure_threshold,
                "Circuit breaker TRIPPED on failure streak, transitioning CLOSED -> OPEN"
            ),
            TripCause::ErrorRate { volume, rate } => warn!(
                dependency = %self.name,
                volume = volume,
                error_rate = format!("{:.1}%", rate * 100.0),
                threshold = format!("{:.1}%", self.config.error_rate_threshold * 100.0),
                "Circuit breaker TRIPPED on error rate, transitioning CLOSED -> OPEN"
            ),
        }
        inner.last_trip = Some(now);
        inner.total_trips += 1;
        self.transition(inner, CircuitState::Open, now)
    }

    fn reopen(&self, inner: &mut CircuitBreakerInner, now: Instant, kind: OutcomeKind) -> Transition {
        warn!(
            dependency = %self.name,
            kind = %kind,
            next_recovery_ms = inner.prober.recovery_timeout().as_millis() as u64,
            flaps = inner.prober.flaps(),
            "Probe failed in HALF_OPEN, transitioning back to OPEN"
        );
        inner.last_trip = Some(now);
        inner.total_trips += 1;
        self.transition(inner, CircuitState::Open, now)
    }

    fn close(&self, inner: &mut CircuitBreakerInner, now: Instant) -> Transition {
        info!(
            dependency = %self.name,
            successes = inner.prober.success_count(),
            "Circuit breaker transitioning HALF_OPEN -> CLOSED, dependency is healthy again"
        );
        inner.tracker.reset_streak();
        inner.rejections = RejectionCounters::default();
        inner.prober.reset_after_recovery();
        self.transition(inner, CircuitState::Closed, now)
    }

    fn transition(&self, inner: &mut CircuitBreakerInner, to: CircuitState, now: Instant) -> Transition {
        let from = inner.state;
        inner.state = to;
        inner.generation += 1;
        inner.last_state_change = now;
        inner.last_state_change_at = Utc::now();

        if let Some(m) = &self.metrics {
            match (from, to) {
                (_, CircuitState::Open) => m.increment_trips(),
                (CircuitState::HalfOpen, CircuitState::Closed) => m.increment_recoveries(),
                _ => {}
            }
        }
        Transition { from, to }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub fn snapshot_at(&self, now: Instant) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        let (volume, error_rate) = inner.tracker.volume_and_rate(now);
        BreakerSnapshot {
            dependency: self.name.clone(),
            state: inner.state,
            volume,
            error_rate,
            consecutive_failures: inner.tracker.consecutive_failures(),
            rejected_in_window: inner.tracker.rejected(now),
            half_open_successes: inner.prober.success_count(),
            probe_slots_in_use: inner.prober.slots_in_use(),
            recovery_timeout_ms: inner.prober.recovery_timeout().as_millis() as u64,
            flaps: inner.prober.flaps(),
            total_trips: inner.total_trips,
            rejections: inner.rejections,
            time_in_current_state_secs: now.saturating_duration_since(inner.last_state_change).as_secs(),
            last_transition_at: inner.last_state_change_at,
        }
    }
}

/// A serializable snapshot of one breaker, for the telemetry endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub volume: u64,
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub rejected_in_window: u64,
    pub half_open_successes: u32,
    pub probe_slots_in_use: u32,
    pub recovery_timeout_ms: u64,
    pub flaps: u32,
    pub total_trips: u64,
    pub rejections: RejectionCounters,
    pub time_in_current_state_secs: u64,
    pub last_transition_at: DateTime<Utc>,
}
