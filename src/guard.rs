// =============================================================================
// guard.rs - THE BOUNCER AT THE DOOR
// =============================================================================
//
// Wraps the actual downstream call. Two jobs, both orthogonal to whatever
// the circuit state is:
//
// 1. Concurrency: at most `max_concurrency` calls in flight per dependency.
//    The next one is rejected on the spot, or (if `max_queue_wait` is set)
//    waits for a permit, but never past the call's own deadline and never
//    after the caller has cancelled.
//
// 2. Deadlines: the call gets until `min(start + call_timeout, ctx.deadline)`,
//    where `start` is when `execute` began. Time spent queueing for a permit
//    comes out of the same budget.
//
// Async calls get a child cancellation token. On timeout or caller
// cancellation the token fires and the future is dropped.
//
// Blocking calls run on tokio's blocking pool. Threads cannot be dropped,
// so at the deadline the guard reports a timeout, fires the token, and walks
// away. The thread keeps its concurrency permit until it actually returns,
// so a pile of stuck threads still counts against the limit.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::BreakerConfig;
use crate::error::BreakerError;
use crate::models::{CallContext, OutcomeKind, RejectReason};

/// How a guarded call ended.
#[derive(Debug)]
pub enum GuardResult<T> {
    /// The call completed and returned a value.
    Success(T),
    /// The call ran (or was running) and did not produce a value.
    Failure { kind: OutcomeKind, cause: BreakerError },
    /// The call never started.
    Rejected(RejectReason),
    /// The caller cancelled while still queued for a permit. Nothing ran and
    /// nothing should be recorded.
    Withdrawn,
}

enum AcquireError {
    Saturated,
    Withdrawn,
}

pub struct AdmissionGuard {
    dependency: String,
    semaphore: Arc<Semaphore>,
    max_concurrency: usize,
    call_timeout: Duration,
    max_queue_wait: Duration,
}

impl AdmissionGuard {
    pub fn new(dependency: impl Into<String>, config: &BreakerConfig) -> Self {
        let max_concurrency = config.max_concurrency.max(1);
        Self {
            dependency: dependency.into(),
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            max_concurrency,
            call_timeout: config.call_timeout,
            max_queue_wait: config.max_queue_wait,
        }
    }

    /// Calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.max_concurrency - self.semaphore.available_permits()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// The hard stop for a call that began at `started`.
    pub fn deadline_for(&self, ctx: &CallContext, started: Instant) -> Instant {
        let own = started + self.call_timeout;
        match ctx.deadline() {
            Some(caller) => own.min(caller),
            None => own,
        }
    }

    async fn acquire(
        &self,
        ctx: &CallContext,
        deadline: Instant,
    ) -> Result<OwnedSemaphorePermit, AcquireError> {
        if ctx.cancellation().is_cancelled() {
            return Err(AcquireError::Withdrawn);
        }
        if let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() {
            return Ok(permit);
        }
        if self.max_queue_wait.is_zero() {
            return Err(AcquireError::Saturated);
        }

        let queue_deadline = (Instant::now() + self.max_queue_wait).min(deadline);
        debug!(
            dependency = %self.dependency,
            in_flight = self.in_flight(),
            "Concurrency limit reached, queueing for a permit"
        );

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(AcquireError::Withdrawn),
            waited = tokio::time::timeout_at(queue_deadline, Arc::clone(&self.semaphore).acquire_owned()) => {
                match waited {
                    Ok(Ok(permit)) => Ok(permit),
                    // Timed out in the queue, or the semaphore was closed.
                    _ => Err(AcquireError::Saturated),
                }
            }
        }
    }

    fn rejection<T>(&self, err: AcquireError) -> GuardResult<T> {
        match err {
            AcquireError::Saturated => {
                debug!(
                    dependency = %self.dependency,
                    limit = self.max_concurrency,
                    "Concurrency limit reached, rejecting call"
                );
                GuardResult::Rejected(RejectReason::ConcurrencyRejected)
            }
            AcquireError::Withdrawn => GuardResult::Withdrawn,
        }
    }

    fn timed_out<T>(&self, started: Instant) -> GuardResult<T> {
        GuardResult::Failure {
            kind: OutcomeKind::Timeout,
            cause: BreakerError::Timeout {
                dependency: self.dependency.clone(),
                elapsed: started.elapsed(),
            },
        }
    }

    fn cancelled<T>(&self) -> GuardResult<T> {
        GuardResult::Failure {
            kind: OutcomeKind::Cancelled,
            cause: BreakerError::Cancelled {
                dependency: self.dependency.clone(),
            },
        }
    }

    fn downstream<T>(&self, source: anyhow::Error) -> GuardResult<T> {
        GuardResult::Failure {
            kind: OutcomeKind::DownstreamError,
            cause: BreakerError::Downstream {
                dependency: self.dependency.clone(),
                source,
            },
        }
    }

    /// Run an async call under the concurrency limit and deadline.
    ///
    /// `call` receives a token that fires when the guard gives up on it.
    pub async fn run<T, E, F, Fut>(&self, ctx: &CallContext, started: Instant, call: F) -> GuardResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<anyhow::Error>,
    {
        let deadline = self.deadline_for(ctx, started);
        let _permit = match self.acquire(ctx, deadline).await {
            Ok(permit) => permit,
            Err(err) => return self.rejection(err),
        };

        let token = ctx.cancellation().child_token();
        let call = call(token.clone());

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                token.cancel();
                self.cancelled()
            }
            finished = tokio::time::timeout_at(deadline, call) => match finished {
                Ok(Ok(value)) => GuardResult::Success(value),
                Ok(Err(e)) => self.downstream(e.into()),
                Err(_) => {
                    token.cancel();
                    self.timed_out(started)
                }
            }
        }
    }

    /// Run a blocking call on the blocking pool under the same limits.
    ///
    /// On timeout or cancellation the guard returns immediately while the
    /// thread runs on; it should watch its token and bail out early.
    pub async fn run_blocking<T, E, F>(&self, ctx: &CallContext, started: Instant, call: F) -> GuardResult<T>
    where
        F: FnOnce(CancellationToken) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let deadline = self.deadline_for(ctx, started);
        let permit = match self.acquire(ctx, deadline).await {
            Ok(permit) => permit,
            Err(err) => return self.rejection(err),
        };

        let token = ctx.cancellation().child_token();
        let thread_token = token.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            call(thread_token)
        });

        tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => {
                token.cancel();
                self.cancelled()
            }
            finished = tokio::time::timeout_at(deadline, handle) => match finished {
                Ok(Ok(Ok(value))) => GuardResult::Success(value),
                Ok(Ok(Err(e))) => self.downstream(e.into()),
                Ok(Err(join_error)) => {
                    self.downstream(anyhow::anyhow!("blocking call did not complete: {join_error}"))
                }
                Err(_) => {
                    token.cancel();
                    warn!(
                        dependency = %self.dependency,
                        "Blocking call missed its deadline, detaching"
                    );
                    self.timed_out(started)
                }
            }
        }
    }
}
