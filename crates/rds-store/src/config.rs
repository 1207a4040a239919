//! Aggregated configuration for one `Store` (SPEC_FULL §1 "Configuration").
//! Grounded on `mqk-config`'s serde-first stance: this module owns no
//! parser and no opinionated file format, just `Deserialize` structs a
//! host application loads however it likes (YAML, env, JSON, whatever).

use std::time::Duration;

use rand::Rng;
use serde::Deserialize;

use rds_breaker::BreakerConfig;
use rds_conflict::ConflictServiceConfig;
use rds_policy::{FetchPolicy, WritePolicy};
use rds_pool::PoolConfig;

pub use rds_error::{ErrorSink, TracingErrorSink};

/// Backoff schedule for the pending-change sync driver (spec §5 "Timeouts").
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 8,
        }
    }
}

impl RetryConfig {
    /// `min(max_delay, initial_delay * multiplier^attempt)` with full
    /// jitter (SPEC_FULL §2 "RetryConfig backoff algorithm"). `attempt` is
    /// clamped to `max_attempts` so a change that has exhausted its
    /// budget doesn't keep growing its delay unboundedly.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.min(self.max_attempts);
        let scaled = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64()).max(0.0);
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_secs_f64(jittered)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Every sub-config a `Store` needs, aggregated for a host to deserialize
/// in one shot (SPEC_FULL §1 "Configuration").
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub pool: PoolConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub conflict: ConflictServiceConfig,
    pub default_fetch_policy: FetchPolicy,
    pub default_write_policy: WritePolicy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            conflict: ConflictServiceConfig::default(),
            default_fetch_policy: FetchPolicy::CacheFirst,
            default_write_policy: WritePolicy::CacheAndNetwork,
        }
    }
}
