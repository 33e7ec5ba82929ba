use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::forwarder::UpstreamForwarder;

/// Last observed health of one upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamHealth {
    pub upstream: String,
    pub healthy: bool,
}

/// Periodic upstream health prober.
///
/// Observability only: unhealthy targets stay in the round-robin rotation
/// (a transport failure maps to 502 on its own), but the probe results feed
/// `/metrics` and the logs.
pub struct HealthChecker {
    forwarder: Arc<UpstreamForwarder>,
    interval: Duration,
    results: Mutex<Vec<UpstreamHealth>>,
}

impl HealthChecker {
    pub fn new(forwarder: Arc<UpstreamForwarder>, interval: Duration) -> Self {
        Self {
            forwarder,
            interval,
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<UpstreamHealth> {
        self.results.lock().clone()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_all().await;
                }
                _ = shutdown.changed() => {
                    debug!("Health checker stopping");
                    return;
                }
            }
        }
    }

    async fn check_all(&self) {
        let probed = self.forwarder.probe_all().await;
        let mut results = Vec::with_capacity(probed.len());
        for (upstream, healthy) in probed {
            if !healthy {
                warn!(upstream = %upstream, "Upstream health probe failed");
            } else {
                debug!(upstream = %upstream, "Upstream healthy");
            }
            results.push(UpstreamHealth { upstream, healthy });
        }
        *self.results.lock() = results;
    }
}
