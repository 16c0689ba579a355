//! Forwarding counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide forwarding counters, updated lock-free.
#[derive(Debug, Default)]
pub struct GatewayStats {
    requests: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    upstream_failures: AtomicU64,
    in_flight: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub attempts: u64,
    pub retries: u64,
    pub upstream_failures: u64,
    pub in_flight: u64,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a request and marks it in flight until the guard drops.
    pub fn begin_request(&self) -> InFlightGuard<'_> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { stats: self }
    }

    pub fn record_attempt(&self, retry: bool) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
        if retry {
            self.retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a request that ran out of attempts.
    pub fn record_upstream_failure(&self) {
        self.upstream_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            upstream_failures: self.upstream_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the in-flight gauge on drop, including when the client
/// disconnects and the request future is dropped.
#[must_use]
pub struct InFlightGuard<'a> {
    stats: &'a GatewayStats,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.stats.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = GatewayStats::new();
        {
            let _guard = stats.begin_request();
            stats.record_attempt(false);
            stats.record_attempt(true);
            stats.record_upstream_failure();
            assert_eq!(stats.snapshot().in_flight, 1);
        }
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                requests: 1,
                attempts: 2,
                retries: 1,
                upstream_failures: 1,
                in_flight: 0,
            }
        );
    }
}
