// =============================================================================
// config.rs - THE KNOB FACTORY
// =============================================================================
//
// Two layers of configuration:
//
// 1. `BreakerConfig`: the per-dependency thresholds. Every breaker gets one,
//    either the engine default or an explicit override handed to
//    `register_breaker`.
// 2. `EngineConfig`: everything around the breakers (metrics port, fallback
//    cache size, the deferred-retry queue and where it drains to).
//
// All values can be overridden via TRIPWIRE_* environment variables. Unset
// or unparseable values fall back to the defaults documented below, and the
// whole thing is validated before anyone gets to use it, because a breaker
// configured with `error_rate_threshold = 7.5` is a breaker that never trips.
// =============================================================================

use std::env;
use std::time::Duration;
use thiserror::Error;

/// Per-dependency breaker thresholds.
///
/// | field                        | default |
/// |------------------------------|---------|
/// | `failure_threshold`          | 5       |
/// | `min_volume`                 | 20      |
/// | `error_rate_threshold`       | 0.5     |
/// | `window_duration`            | 60s     |
/// | `bucket_width`               | 1s      |
/// | `recovery_timeout`           | 30s     |
/// | `backoff_multiplier`         | 2.0     |
/// | `max_recovery_timeout`       | 300s    |
/// | `half_open_probe_limit`      | 1       |
/// | `half_open_success_threshold`| 2       |
/// | `max_concurrency`            | 100     |
/// | `call_timeout`               | 10s     |
/// | `max_queue_wait`             | 0       |
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Consecutive failed calls that trip the breaker regardless of volume.
    pub failure_threshold: u32,

    /// Completed calls the window must hold before the error rate is trusted.
    pub min_volume: u64,

    /// Error rate (0.0..=1.0) at or above which the breaker trips, once
    /// `min_volume` is met.
    pub error_rate_threshold: f64,

    /// Span of the sliding window.
    pub window_duration: Duration,

    /// Granularity of the sliding window. Smaller means smoother eviction
    /// and a bigger ring.
    ///
    /// Records leave the window a whole bucket at a time, so an outcome
    /// counts for at least `window_duration - bucket_width` and never past
    /// `window_duration`.
    pub bucket_width: Duration,

    /// How long a freshly tripped breaker stays Open before probing.
    pub recovery_timeout: Duration,

    /// Applied to the recovery timeout every time a probe fails, so a
    /// dependency that keeps flapping gets progressively longer breaks.
    pub backoff_multiplier: f64,

    /// Ceiling for the backed-off recovery timeout.
    pub max_recovery_timeout: Duration,

    /// Probe calls allowed in flight at once while HalfOpen.
    pub half_open_probe_limit: u32,

    /// Successful probes needed to close the breaker again.
    pub half_open_success_threshold: u32,

    /// Calls allowed in flight at once, in any state.
    pub max_concurrency: usize,

    /// Per-call budget, measured from the moment `execute` starts.
    pub call_timeout: Duration,

    /// How long a call may wait for a concurrency permit. Zero rejects the
    /// (N+1)-th call immediately.
    pub max_queue_wait: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            min_volume: 20,
            error_rate_threshold: 0.5,
            window_duration: Duration::from_secs(60),
            bucket_width: Duration::from_secs(1),
            recovery_timeout: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
            half_open_probe_limit: 1,
            half_open_success_threshold: 2,
            max_concurrency: 100,
            call_timeout: Duration::from_secs(10),
            max_queue_wait: Duration::ZERO,
        }
    }
}

impl BreakerConfig {
    /// Read breaker defaults from TRIPWIRE_* variables.
    pub fn from_env() -> Self {
        let d = BreakerConfig::default();
        Self {
            failure_threshold: env_parse("TRIPWIRE_FAILURE_THRESHOLD", d.failure_threshold),
            min_volume: env_parse("TRIPWIRE_MIN_VOLUME", d.min_volume),
            error_rate_threshold: env_parse("TRIPWIRE_ERROR_RATE_THRESHOLD", d.error_rate_threshold),
            window_duration: env_millis("TRIPWIRE_WINDOW_MS", d.window_duration),
            bucket_width: env_millis("TRIPWIRE_BUCKET_MS", d.bucket_width),
            recovery_timeout: env_millis("TRIPWIRE_RECOVERY_TIMEOUT_MS", d.recovery_timeout),
            backoff_multiplier: env_parse("TRIPWIRE_BACKOFF_MULTIPLIER", d.backoff_multiplier),
            max_recovery_timeout: env_millis("TRIPWIRE_MAX_RECOVERY_TIMEOUT_MS", d.max_recovery_timeout),
            half_open_probe_limit: env_parse("TRIPWIRE_HALF_OPEN_PROBES", d.half_open_probe_limit),
            half_open_success_threshold: env_parse(
                "TRIPWIRE_HALF_OPEN_SUCCESSES",
                d.half_open_success_threshold,
            ),
            max_concurrency: env_parse("TRIPWIRE_MAX_CONCURRENCY", d.max_concurrency),
            call_timeout: env_millis("TRIPWIRE_CALL_TIMEOUT_MS", d.call_timeout),
            max_queue_wait: env_millis("TRIPWIRE_MAX_QUEUE_WAIT_MS", d.max_queue_wait),
        }
    }

    /// Check every semantic constraint and report all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.failure_threshold == 0 {
            problems.push("failure_threshold must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            problems.push(format!(
                "error_rate_threshold must be within 0..=1, got {}",
                self.error_rate_threshold
            ));
        }
        if self.window_duration.is_zero() {
            problems.push("window_duration must be non-zero".to_string());
        }
        if self.bucket_width.is_zero() || self.bucket_width > self.window_duration {
            problems.push("bucket_width must be non-zero and no wider than window_duration".to_string());
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            problems.push(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            ));
        }
        if self.max_recovery_timeout < self.recovery_timeout {
            problems.push("max_recovery_timeout must be >= recovery_timeout".to_string());
        }
        if self.half_open_probe_limit == 0 {
            problems.push("half_open_probe_limit must be at least 1".to_string());
        }
        if self.half_open_success_threshold == 0 {
            problems.push("half_open_success_threshold must be at least 1".to_string());
        }
        if self.max_concurrency == 0 {
            problems.push("max_concurrency must be at least 1".to_string());
        }
        if self.call_timeout.is_zero() {
            problems.push("call_timeout must be non-zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Engine-wide settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Config applied to every breaker created lazily on first use.
    pub default_breaker: BreakerConfig,

    /// Port for the JSON snapshot endpoint. Default: 9090.
    pub metrics_port: u16,

    /// Last-known-good responses kept for `CachedValue` fallbacks.
    /// Default: 10_000 entries.
    pub fallback_cache_capacity: usize,

    /// Capacity of the in-process deferred-retry channel. Default: 10_000.
    pub retry_queue_capacity: usize,

    /// Redis the deferred-retry drain writes to.
    pub redis_url: String,

    /// Sorted set holding deferred requests, scored by enqueue time.
    pub redis_retry_set: String,

    /// Emit logs as JSON lines instead of the human format.
    pub log_json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_breaker: BreakerConfig::default(),
            metrics_port: 9090,
            fallback_cache_capacity: 10_000,
            retry_queue_capacity: 10_000,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            redis_retry_set: "tripwire:deferred".to_string(),
            log_json: false,
        }
    }
}

impl EngineConfig {
    /// Load from the environment (and a `.env` file, if one is lying around).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let d = EngineConfig::default();

        Self {
            default_breaker: BreakerConfig::from_env(),
            metrics_port: env_parse("TRIPWIRE_METRICS_PORT", d.metrics_port),
            fallback_cache_capacity: env_parse("TRIPWIRE_FALLBACK_CACHE_SIZE", d.fallback_cache_capacity),
            retry_queue_capacity: env_parse("TRIPWIRE_RETRY_QUEUE_CAPACITY", d.retry_queue_capacity),
            redis_url: env_or_default("TRIPWIRE_REDIS_URL", &d.redis_url),
            redis_retry_set: env_or_default("TRIPWIRE_REDIS_RETRY_SET", &d.redis_retry_set),
            log_json: env_parse("TRIPWIRE_LOG_JSON", d.log_json),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = match self.default_breaker.validate() {
            Ok(()) => Vec::new(),
            Err(ConfigError::Invalid(p)) => p,
        };
        if self.fallback_cache_capacity == 0 {
            problems.push("fallback_cache_capacity must be at least 1".to_string());
        }
        if self.retry_queue_capacity == 0 {
            problems.push("retry_queue_capacity must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Read an environment variable with a default fallback.
fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}
