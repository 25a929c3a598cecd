// =============================================================================
// window.rs - THE ROLLING LEDGER OF BAD NEWS
// =============================================================================
//
// A sliding window of call outcomes, chopped into fixed-width time buckets
// arranged in a ring. Each bucket knows which slice of time it belongs to,
// so a stale bucket is recognized (and wiped) the moment anyone looks at it.
//
// Eviction is lazy: nothing runs in the background. Every read and every
// write first throws away buckets that have fallen out of the window, which
// means the window can never report data older than `window_duration`.
//
// The consecutive-failure streak lives outside the buckets on purpose. A
// dependency that fails five times in a row over ten minutes is broken,
// even if the window only ever holds one of those failures at a time.
// =============================================================================

use std::time::Duration;
use tokio::time::Instant;

use crate::models::OutcomeRecord;

/// One slice of the window.
#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    /// Absolute slice number since the tracker's origin. Used to tell whether
    /// the slot still belongs to the current lap of the ring.
    index: u64,
    total: u64,
    failed: u64,
    rejected: u64,
}

impl Bucket {
    fn reset(&mut self, index: u64) {
        *self = Bucket {
            index,
            ..Bucket::default()
        };
    }
}

/// Time-bucketed outcome counts for a single dependency.
///
/// Not thread-safe on its own; the owning breaker keeps it behind its lock.
#[derive(Debug)]
pub struct WindowTracker {
    buckets: Vec<Bucket>,
    bucket_width: Duration,
    origin: Instant,
    consecutive_failures: u32,
}

impl WindowTracker {
    /// Build a tracker covering `window_duration` in slices of `bucket_width`.
    ///
    /// The bucket count is rounded up so the ring always spans at least the
    /// full window. A zero width is treated as one millisecond. Bucket
    /// boundaries are laid out from `origin`.
    pub fn with_origin(window_duration: Duration, bucket_width: Duration, origin: Instant) -> Self {
        let bucket_width = bucket_width.max(Duration::from_millis(1));
        let window_duration = window_duration.max(bucket_width);
        let slots = window_duration.as_nanos().div_ceil(bucket_width.as_nanos()) as usize;

        Self {
            buckets: vec![Bucket::default(); slots.max(1)],
            bucket_width,
            origin,
            consecutive_failures: 0,
        }
    }

    fn slice_of(&self, at: Instant) -> u64 {
        (at.saturating_duration_since(self.origin).as_nanos() / self.bucket_width.as_nanos()) as u64
    }

    fn slots(&self) -> u64 {
        self.buckets.len() as u64
    }

    /// A slice is live at `now` if it is one of the last `slots` slices,
    /// ending with the slice that contains `now`.
    fn is_live(&self, index: u64, current: u64) -> bool {
        index <= current && current - index < self.slots()
    }

    /// Wipe every bucket whose slice has left the window. Buckets stamped
    /// after `now` belong to a caller whose clock read landed later than
    /// ours; they are skipped by reads but never wiped.
    fn evict(&mut self, now: Instant) {
        let current = self.slice_of(now);
        let slots = self.slots();
        for bucket in &mut self.buckets {
            let stale = bucket.index <= current && current - bucket.index >= slots;
            if stale && (bucket.total != 0 || bucket.rejected != 0) {
                bucket.reset(bucket.index);
            }
        }
    }

    /// Append one outcome.
    ///
    /// Completed calls update the streak no matter how old their timestamp
    /// is. Bucket counts are only touched if the timestamp still falls inside
    /// the window as of `max(now, record.timestamp)`.
    pub fn record(&mut self, record: &OutcomeRecord) {
        self.record_at(record, Instant::now());
    }

    pub fn record_at(&mut self, record: &OutcomeRecord, now: Instant) {
        if record.kind.is_failure() {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        } else if record.success {
            self.consecutive_failures = 0;
        }

        let now = now.max(record.timestamp);
        self.evict(now);

        let current = self.slice_of(now);
        let index = self.slice_of(record.timestamp);
        if !self.is_live(index, current) {
            return;
        }

        let slot = (index % self.slots()) as usize;
        let bucket = &mut self.buckets[slot];
        if bucket.index > index && (bucket.total != 0 || bucket.rejected != 0) {
            // The slot already holds a later lap; this record is too old for it.
            return;
        }
        if bucket.index != index {
            bucket.reset(index);
        }

        if record.kind.counts_toward_failure_rate() {
            bucket.total += 1;
            if !record.success {
                bucket.failed += 1;
            }
        } else {
            bucket.rejected += 1;
        }
    }

    fn totals(&mut self, now: Instant) -> (u64, u64, u64) {
        self.evict(now);
        let current = self.slice_of(now);
        self.buckets
            .iter()
            .filter(|b| self.is_live(b.index, current))
            .fold((0, 0, 0), |(t, f, r), b| (t + b.total, f + b.failed, r + b.rejected))
    }

    /// Completed calls (ok, timeout, downstream error) inside the window.
    pub fn volume(&mut self, now: Instant) -> u64 {
        self.totals(now).0
    }

    /// Failed / completed inside the window, 0.0 when the window is empty.
    pub fn error_rate(&mut self, now: Instant) -> f64 {
        let (total, failed, _) = self.totals(now);
        if total == 0 {
            0.0
        } else {
            failed as f64 / total as f64
        }
    }

    /// Volume and error rate in one pass, for trip evaluation.
    pub fn volume_and_rate(&mut self, now: Instant) -> (u64, f64) {
        let (total, failed, _) = self.totals(now);
        let rate = if total == 0 { 0.0 } else { failed as f64 / total as f64 };
        (total, rate)
    }

    /// Concurrency rejections and cancellations inside the window.
    pub fn rejected(&mut self, now: Instant) -> u64 {
        self.totals(now).2
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn reset_streak(&mut self) {
        self.consecutive_failures = 0;
    }
}
