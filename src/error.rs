// =============================================================================
// error.rs - EVERY WAY A CALL CAN GO SIDEWAYS
// =============================================================================
//
// The first three variants are manufactured locally: the downstream was never
// contacted, so there is nothing to retry and nothing to blame it for. The
// next two are real failures and count against the dependency. `Cancelled`
// is the caller walking away and counts against nobody.
// =============================================================================

use std::time::Duration;
use thiserror::Error;

use crate::models::{OutcomeKind, RejectReason};

#[derive(Debug, Error)]
pub enum BreakerError {
    #[error("circuit open for {dependency}: fast-failing for another {remaining:?}")]
    Tripped {
        dependency: String,
        remaining: Duration,
    },

    #[error("half-open probe slots exhausted for {dependency}")]
    ProbeSaturated { dependency: String },

    #[error("concurrency limit of {limit} reached for {dependency}")]
    ConcurrencyRejected { dependency: String, limit: usize },

    #[error("call to {dependency} timed out after {elapsed:?}")]
    Timeout {
        dependency: String,
        elapsed: Duration,
    },

    #[error("downstream {dependency} failed: {source}")]
    Downstream {
        dependency: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("call to {dependency} was cancelled by the caller")]
    Cancelled { dependency: String },
}

impl BreakerError {
    /// Synthesized locally, downstream never contacted.
    pub fn is_rejection(&self) -> bool {
        self.reject_reason().is_some()
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            BreakerError::Tripped { .. } => Some(RejectReason::CircuitOpen),
            BreakerError::ProbeSaturated { .. } => Some(RejectReason::ProbeSaturated),
            BreakerError::ConcurrencyRejected { .. } => Some(RejectReason::ConcurrencyRejected),
            _ => None,
        }
    }

    /// The outcome this error is recorded as, if it is recorded at all.
    /// Breaker-level rejections (`Tripped`, `ProbeSaturated`) never reach the
    /// tracker.
    pub fn outcome_kind(&self) -> Option<OutcomeKind> {
        match self {
            BreakerError::Timeout { .. } => Some(OutcomeKind::Timeout),
            BreakerError::Downstream { .. } => Some(OutcomeKind::DownstreamError),
            BreakerError::ConcurrencyRejected { .. } => Some(OutcomeKind::ConcurrencyRejected),
            BreakerError::Cancelled { .. } => Some(OutcomeKind::Cancelled),
            BreakerError::Tripped { .. } | BreakerError::ProbeSaturated { .. } => None,
        }
    }

    pub fn dependency(&self) -> &str {
        match self {
            BreakerError::Tripped { dependency, .. }
            | BreakerError::ProbeSaturated { dependency }
            | BreakerError::ConcurrencyRejected { dependency, .. }
            | BreakerError::Timeout { dependency, .. }
            | BreakerError::Downstream { dependency, .. }
            | BreakerError::Cancelled { dependency } => dependency,
        }
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BreakerError::Tripped { .. } => "circuit_open",
            BreakerError::ProbeSaturated { .. } => "probe_saturated",
            BreakerError::ConcurrencyRejected { .. } => "concurrency_rejected",
            BreakerError::Timeout { .. } => "timeout",
            BreakerError::Downstream { .. } => "downstream_error",
            BreakerError::Cancelled { .. } => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_not_recorded_failures() {
        let tripped = BreakerError::Tripped {
            dependency: "payments".into(),
            remaining: Duration::from_secs(3),
        };
        assert!(tripped.is_rejection());
        assert_eq!(tripped.outcome_kind(), None);

        let busy = BreakerError::ConcurrencyRejected {
            dependency: "payments".into(),
            limit: 10,
        };
        assert!(busy.is_rejection());
        assert_eq!(busy.outcome_kind(), Some(OutcomeKind::ConcurrencyRejected));
    }

    #[test]
    fn test_downstream_keeps_original_cause() {
        let err = BreakerError::Downstream {
            dependency: "inventory".into(),
            source: anyhow::anyhow!("connection reset by peer"),
        };
        assert!(!err.is_rejection());
        assert_eq!(err.dependency(), "inventory");
        assert!(err.to_string().contains("connection reset by peer"));
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "connection reset by peer");
    }
}
