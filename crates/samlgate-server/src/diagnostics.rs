//! Periodic background tasks: runtime statistics and pending-request sweeps.

use std::sync::Arc;
use std::time::Duration;

use samlgate_auth::RequestTracker;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::gateway::{BackendPool, GatewayStats};

/// Logs runtime and forwarding statistics every `interval`.
pub fn spawn_stats_reporter(
    stats: Arc<GatewayStats>,
    pool: Arc<BackendPool>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let metrics = tokio::runtime::Handle::current().metrics();
                    let snapshot = stats.snapshot();
                    info!(
                        runtime.workers = metrics.num_workers(),
                        runtime.alive_tasks = metrics.num_alive_tasks(),
                        backends.total = pool.backends().len(),
                        backends.healthy = pool.healthy_count(),
                        requests = snapshot.requests,
                        attempts = snapshot.attempts,
                        retries = snapshot.retries,
                        upstream_failures = snapshot.upstream_failures,
                        in_flight = snapshot.in_flight,
                        "gateway stats"
                    );
                }
            }
        }
        debug!("stats reporter stopped");
    })
}

/// Removes expired pending requests and tombstones every `interval`.
pub fn spawn_request_sweeper(
    tracker: Arc<dyn RequestTracker>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match tracker.cleanup_expired(OffsetDateTime::now_utc()).await {
                        Ok(0) => {}
                        Ok(removed) => debug!(removed, "swept expired authentication requests"),
                        Err(e) => warn!(error = %e, "failed to sweep authentication requests"),
                    }
                }
            }
        }
        debug!("request sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use samlgate_auth::{InMemoryRequestTracker, PendingRequest};

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let tracker = Arc::new(InMemoryRequestTracker::new(Duration::ZERO));
        let issued = OffsetDateTime::now_utc() - time::Duration::minutes(10);
        tracker
            .register(PendingRequest {
                request_id: "id-old".into(),
                relay_state: "relay".into(),
                return_path: "/".into(),
                issued_at: issued,
                expires_at: issued + time::Duration::minutes(5),
            })
            .await
            .unwrap();
        assert_eq!(tracker.len(), 1);

        let shutdown = CancellationToken::new();
        let handle = spawn_request_sweeper(
            tracker.clone(),
            Duration::from_millis(20),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(tracker.is_empty());

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stats_reporter_stops_on_cancel() {
        let shutdown = CancellationToken::new();
        let handle = spawn_stats_reporter(
            Arc::new(GatewayStats::new()),
            Arc::new(BackendPool::new()),
            Duration::from_millis(10),
            shutdown.clone(),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();
    }
}
