use std::time::Duration;

use serde::Deserialize;

/// Pool tuning knobs (spec §4.3). Grounded on the shape of
/// `sqlx::postgres::PgPoolOptions` (`mqk-db::connect_from_env` builds one
/// with `.max_connections(10)`), generalized to the full lifecycle the core
/// needs: idle reclamation, borrow/return validation, acquire deadlines.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub test_on_borrow: bool,
    pub test_on_return: bool,
    /// Cleanup tick interval. Spec requires this be `<= idle_timeout`;
    /// `initialize()` clamps it down if a caller supplies something larger.
    pub cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(1800),
            test_on_borrow: false,
            test_on_return: false,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    /// Clamp `cleanup_interval` to at most `idle_timeout`, per spec §4.3.
    pub(crate) fn normalized(mut self) -> Self {
        if self.cleanup_interval > self.idle_timeout {
            self.cleanup_interval = self.idle_timeout;
        }
        self
    }
}
