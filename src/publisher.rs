// =============================================================================
// publisher.rs - THE REDIS PARKING GARAGE
// =============================================================================
//
// Drains deferred requests from the retry queue's crossbeam channel and parks
// them in a Redis sorted set, scored by when they were deferred, so an
// external replayer can pick them up oldest-first once the dependency is back.
//
// Architecture:
// 1. Consumer loop reads from the bounded crossbeam channel
// 2. Requests are serialized to JSON (serde does the heavy lifting)
// 3. A whole batch goes to Redis in one pipelined round trip
// 4. On shutdown, whatever is still in the channel is flushed first
//
// The engine never replays anything itself. This module only makes sure a
// deferred request outlives the process that deferred it.
// =============================================================================

use anyhow::Result;
use crossbeam_channel::Receiver;
use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::retry_queue::DeferredRequest;

const BATCH_SIZE: usize = 50;

pub struct RedisRetryPublisher {
    config: Arc<EngineConfig>,
    receiver: Receiver<DeferredRequest>,
    shutdown: watch::Receiver<bool>,
    stats: Arc<PublisherStats>,
}

/// Publisher statistics for metrics.
#[derive(Default)]
pub struct PublisherStats {
    pub requests_persisted: AtomicU64,
    pub persist_errors: AtomicU64,
    pub batches_sent: AtomicU64,
}

/// A serializable snapshot of publisher stats.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PublisherSnapshot {
    pub requests_persisted: u64,
    pub persist_errors: u64,
    pub batches_sent: u64,
}

impl PublisherStats {
    pub fn snapshot(&self) -> PublisherSnapshot {
        PublisherSnapshot {
            requests_persisted: self.requests_persisted.load(Ordering::Relaxed),
            persist_errors: self.persist_errors.load(Ordering::Relaxed),
            batches_sent: self.batches_sent.load(Ordering::Relaxed),
        }
    }
}

/// Score used in the sorted set: enqueue time in epoch milliseconds.
pub fn score_of(request: &DeferredRequest) -> f64 {
    request.enqueued_at.timestamp_millis() as f64
}

/// Pull up to `BATCH_SIZE` requests off the channel without blocking.
/// `None` means the sending side is gone and nothing was left.
fn drain_batch(receiver: &Receiver<DeferredRequest>, batch: &mut Vec<DeferredRequest>) -> Option<()> {
    batch.clear();
    while batch.len() < BATCH_SIZE {
        match receiver.try_recv() {
            Ok(request) => batch.push(request),
            Err(crossbeam_channel::TryRecvError::Empty) => break,
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                if batch.is_empty() {
                    return None;
                }
                break;
            }
        }
    }
    Some(())
}

impl RedisRetryPublisher {
    pub fn new(
        config: Arc<EngineConfig>,
        receiver: Receiver<DeferredRequest>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Arc<PublisherStats>) {
        let stats = Arc::new(PublisherStats::default());
        (
            Self {
                config,
                receiver,
                shutdown,
                stats: Arc::clone(&stats),
            },
            stats,
        )
    }

    /// Run until the shutdown signal flips or the queue is dropped.
    pub async fn run(self) -> Result<()> {
        info!(
            sorted_set = %self.config.redis_retry_set,
            "Retry publisher starting, deferred requests will be parked in Redis"
        );

        let client = redis::Client::open(self.config.redis_url.as_str())?;
        let mut con = loop {
            match client.get_multiplexed_async_connection().await {
                Ok(con) => {
                    info!("Redis connection established");
                    break con;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to Redis, retrying in 5 seconds");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    if *self.shutdown.borrow() {
                        info!("Shutdown received during Redis connection retry, exiting");
                        return Ok(());
                    }
                }
            }
        };

        let mut batch: Vec<DeferredRequest> = Vec::with_capacity(BATCH_SIZE);

        loop {
            if *self.shutdown.borrow() {
                info!(
                    pending = self.receiver.len(),
                    "Shutdown signal received, flushing deferred requests"
                );
                while drain_batch(&self.receiver, &mut batch).is_some() && !batch.is_empty() {
                    if let Err(e) = self.persist_batch(&mut con, &batch).await {
                        error!(error = %e, "Failed to persist final batch during shutdown");
                        break;
                    }
                }
                info!("Retry publisher shutting down");
                return Ok(());
            }

            if drain_batch(&self.receiver, &mut batch).is_none() {
                info!("Retry queue dropped, publisher shutting down");
                return Ok(());
            }

            if batch.is_empty() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            if let Err(e) = self.persist_batch(&mut con, &batch).await {
                error!(
                    error = %e,
                    batch_size = batch.len(),
                    "Failed to persist batch to Redis, deferred requests lost"
                );
                self.stats
                    .persist_errors
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
            }
        }
    }

    /// ZADD the whole batch in one pipeline.
    async fn persist_batch(
        &self,
        con: &mut redis::aio::MultiplexedConnection,
        batch: &[DeferredRequest],
    ) -> Result<()> {
        let mut pipe = redis::pipe();
        for request in batch {
            let json = serde_json::to_string(request)?;
            pipe.zadd(&self.config.redis_retry_set, json, score_of(request))
                .ignore();
        }
        let _: () = pipe.query_async(con).await?;

        self.stats
            .requests_persisted
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);

        for request in batch {
            debug!(
                request_id = %request.id,
                dependency = %request.dependency_key,
                operation = %request.operation,
                reason = %request.reason,
                "Deferred request parked in Redis"
            );
        }
        Ok(())
    }
}
