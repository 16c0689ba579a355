//! Active backend health checking.
//!
//! Every interval each backend is checked with a `GET` on the configured path.
//! A connection failure, timeout or 5xx marks it unhealthy; any other
//! response marks it healthy again.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::redirect::Policy;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use super::pool::BackendPool;
use crate::config::HealthCheckConfig;

pub struct HealthChecker {
    pool: Arc<BackendPool>,
    client: reqwest::Client,
    path: String,
    interval: Duration,
}

impl HealthChecker {
    pub fn new(pool: Arc<BackendPool>, config: &HealthCheckConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            pool,
            client,
            path: config.path.clone(),
            interval: config.interval,
        })
    }

    /// Checks every backend once and updates the pool.
    pub async fn check_once(&self) {
        let backends = self.pool.backends();
        let checks = backends.iter().map(|backend| self.check(backend.url()));
        let results = join_all(checks).await;
        for (backend, healthy) in backends.iter().zip(results) {
            self.pool.set_healthy(backend.url(), healthy);
        }
    }

    async fn check(&self, base: &Url) -> bool {
        let mut url = base.clone();
        url.set_path(&format!(
            "{}{}",
            base.path().trim_end_matches('/'),
            self.path
        ));
        match self.client.get(url).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                debug!(target_url = %base, error = %e, "health check failed");
                false
            }
        }
    }

    /// Runs checks until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval = ?self.interval, path = %self.path, "backend health checks started");
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => self.check_once().await,
                }
            }
            debug!("backend health checks stopped");
        })
    }
}
