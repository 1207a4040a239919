use std::collections::VecDeque;
use std::time::Duration;

/// Rolling acquire-latency window, capped at 100 samples (spec §4.3).
const LATENCY_WINDOW: usize = 100;

#[derive(Default)]
pub(crate) struct MetricsState {
    created_total: u64,
    destroyed_total: u64,
    acquired_total: u64,
    timed_out_total: u64,
    peak_in_use: usize,
    latencies_micros: VecDeque<u64>,
}

impl MetricsState {
    pub(crate) fn record_created(&mut self) {
        self.created_total += 1;
    }

    pub(crate) fn record_destroyed(&mut self) {
        self.destroyed_total += 1;
    }

    pub(crate) fn record_acquired(&mut self, latency: Duration, in_use: usize) {
        self.acquired_total += 1;
        self.peak_in_use = self.peak_in_use.max(in_use);
        if self.latencies_micros.len() == LATENCY_WINDOW {
            self.latencies_micros.pop_front();
        }
        self.latencies_micros.push_back(latency.as_micros() as u64);
    }

    pub(crate) fn record_timeout(&mut self) {
        self.timed_out_total += 1;
    }

    pub(crate) fn snapshot(&self, current_idle: usize, current_in_use: usize) -> PoolMetrics {
        let mut sorted: Vec<u64> = self.latencies_micros.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |pct: f64| -> Duration {
            if sorted.is_empty() {
                return Duration::ZERO;
            }
            let idx = ((sorted.len() as f64 - 1.0) * pct).round() as usize;
            Duration::from_micros(sorted[idx.min(sorted.len() - 1)])
        };
        PoolMetrics {
            created_total: self.created_total,
            destroyed_total: self.destroyed_total,
            acquired_total: self.acquired_total,
            timed_out_total: self.timed_out_total,
            current_idle,
            current_in_use,
            current_total: current_idle + current_in_use,
            peak_in_use: self.peak_in_use,
            acquire_latency_p50: pick(0.50),
            acquire_latency_p99: pick(0.99),
        }
    }
}

/// Point-in-time pool metrics snapshot (spec §4.3 + SPEC_FULL §2).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct PoolMetrics {
    pub created_total: u64,
    pub destroyed_total: u64,
    pub acquired_total: u64,
    pub timed_out_total: u64,
    pub current_idle: usize,
    pub current_in_use: usize,
    pub current_total: usize,
    pub peak_in_use: usize,
    pub acquire_latency_p50: Duration,
    pub acquire_latency_p99: Duration,
}
