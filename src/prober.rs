// =============================================================================
// prober.rs - THE CAUTIOUS TOE IN THE WATER
// =============================================================================
//
// While a breaker is HalfOpen, a small number of trial calls ("probes") are
// let through to see whether the dependency has recovered. The prober owns
// the probe slots and the running tally of successful probes, and turns each
// probe outcome into a verdict for the state controller.
//
// The slots are a plain counter, not a tokio semaphore: they are only ever
// touched under the breaker's own lock, and nobody waits for one. A call that
// finds them exhausted is rejected on the spot with `probe_saturated`.
// =============================================================================

use std::time::Duration;

/// What a single probe outcome means for the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// Not enough evidence yet; stay HalfOpen.
    KeepProbing,
    /// Enough consecutive successes; close the circuit.
    Recovered,
    /// A probe failed; back to Open.
    Relapsed,
}

#[derive(Debug)]
pub struct RecoveryProber {
    probe_limit: u32,
    success_threshold: u32,
    slots_in_use: u32,
    success_count: u32,

    base_recovery_timeout: Duration,
    max_recovery_timeout: Duration,
    backoff_multiplier: f64,
    current_recovery_timeout: Duration,
    flaps: u32,
}

impl RecoveryProber {
    pub fn new(
        probe_limit: u32,
        success_threshold: u32,
        recovery_timeout: Duration,
        backoff_multiplier: f64,
        max_recovery_timeout: Duration,
    ) -> Self {
        Self {
            probe_limit: probe_limit.max(1),
            success_threshold: success_threshold.max(1),
            slots_in_use: 0,
            success_count: 0,
            base_recovery_timeout: recovery_timeout,
            max_recovery_timeout: max_recovery_timeout.max(recovery_timeout),
            backoff_multiplier: backoff_multiplier.max(1.0),
            current_recovery_timeout: recovery_timeout,
            flaps: 0,
        }
    }

    /// Start a fresh HalfOpen cycle. Slots from a previous cycle are
    /// forgotten; their outcomes arrive with a stale generation and are
    /// never handed back here.
    pub fn begin_cycle(&mut self) {
        self.slots_in_use = 0;
        self.success_count = 0;
    }

    /// Claim a probe slot. `false` means the call must be rejected.
    pub fn try_acquire(&mut self) -> bool {
        if self.slots_in_use >= self.probe_limit {
            return false;
        }
        self.slots_in_use += 1;
        true
    }

    /// Give a slot back without a verdict (the probe was cancelled or
    /// turned away by the admission guard before reaching the dependency).
    pub fn release(&mut self) {
        self.slots_in_use = self.slots_in_use.saturating_sub(1);
    }

    /// Feed one completed probe. Releases its slot.
    pub fn on_probe_outcome(&mut self, success: bool) -> ProbeVerdict {
        self.release();
        if !success {
            self.flap();
            return ProbeVerdict::Relapsed;
        }

        self.success_count += 1;
        if self.success_count >= self.success_threshold {
            ProbeVerdict::Recovered
        } else {
            ProbeVerdict::KeepProbing
        }
    }

    /// A failed probe: stretch the next Open period, up to the ceiling.
    fn flap(&mut self) {
        self.flaps = self.flaps.saturating_add(1);
        let stretched = self
            .current_recovery_timeout
            .mul_f64(self.backoff_multiplier);
        self.current_recovery_timeout = stretched.min(self.max_recovery_timeout);
    }

    /// Called once the breaker closes: the dependency earned a clean slate.
    pub fn reset_after_recovery(&mut self) {
        self.begin_cycle();
        self.flaps = 0;
        self.current_recovery_timeout = self.base_recovery_timeout;
    }

    pub fn recovery_timeout(&self) -> Duration {
        self.current_recovery_timeout
    }

    pub fn slots_in_use(&self) -> u32 {
        self.slots_in_use
    }

    pub fn success_count(&self) -> u32 {
        self.success_count
    }

    pub fn flaps(&self) -> u32 {
        self.flaps
    }
}
