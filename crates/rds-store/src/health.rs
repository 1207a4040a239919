//! `health_status()` aggregation (spec §4.12). Pool, circuit breaker, and
//! backend each contribute a `HealthStatus`; the worst of the three wins,
//! per the total order spec §3 defines (`Healthy < Degraded < Unhealthy`).
//! Grounded on `CompositeBackend::health` (rds-backend), which already
//! folds primary/cache health the same way — this module just adds the
//! pool and breaker as two more inputs to the same fold.

use rds_backend::HealthStatus;
use rds_breaker::CircuitState;
use rds_pool::PoolMetrics;

/// Pool-health heuristic (SPEC_FULL §2 names this function without fixing
/// thresholds — see DESIGN.md for the Open Question decision): a pool at
/// or above 80% utilization is degraded; fully saturated with at least one
/// recent acquire timeout is unhealthy.
pub fn pool_health(metrics: &PoolMetrics) -> HealthStatus {
    if metrics.current_total == 0 {
        return HealthStatus::Healthy;
    }
    let utilization = metrics.current_in_use as f64 / metrics.current_total as f64;
    if utilization >= 1.0 && metrics.timed_out_total > 0 {
        HealthStatus::Unhealthy
    } else if utilization >= 0.8 {
        HealthStatus::Degraded
    } else {
        HealthStatus::Healthy
    }
}

/// An open breaker means the backend is being shed entirely (unhealthy); a
/// half-open breaker means it's being probed (degraded).
pub fn breaker_health(state: CircuitState) -> HealthStatus {
    match state {
        CircuitState::Closed => HealthStatus::Healthy,
        CircuitState::HalfOpen => HealthStatus::Degraded,
        CircuitState::Open => HealthStatus::Unhealthy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_pool_is_healthy() {
        assert_eq!(pool_health(&PoolMetrics::default()), HealthStatus::Healthy);
    }

    #[test]
    fn saturated_pool_with_timeouts_is_unhealthy() {
        let metrics = PoolMetrics {
            current_in_use: 10,
            current_total: 10,
            timed_out_total: 1,
            ..Default::default()
        };
        assert_eq!(pool_health(&metrics), HealthStatus::Unhealthy);
    }

    #[test]
    fn high_utilization_without_timeouts_is_degraded() {
        let metrics = PoolMetrics {
            current_in_use: 9,
            current_total: 10,
            ..Default::default()
        };
        assert_eq!(pool_health(&metrics), HealthStatus::Degraded);
    }

    #[test]
    fn breaker_state_maps_to_health() {
        assert_eq!(breaker_health(CircuitState::Closed), HealthStatus::Healthy);
        assert_eq!(breaker_health(CircuitState::HalfOpen), HealthStatus::Degraded);
        assert_eq!(breaker_health(CircuitState::Open), HealthStatus::Unhealthy);
    }
}
