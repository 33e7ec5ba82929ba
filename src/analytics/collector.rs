use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Aggregate process counters for `/metrics` and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_requests: u64,
    pub forwarded: u64,
    pub blocked_rate_limit: u64,
    pub blocked_bot: u64,
    pub blocked_reputation: u64,
    pub upstream_errors: u64,
    pub active_connections: u64,
    pub memory_rss_bytes: u64,
}

/// Lock-free counters updated on every request; read by the metrics routes
/// and by the shutdown drain loop.
pub struct MetricsCollector {
    start_time: Instant,
    total_requests: AtomicU64,
    forwarded: AtomicU64,
    blocked_rate_limit: AtomicU64,
    blocked_bot: AtomicU64,
    blocked_reputation: AtomicU64,
    upstream_errors: AtomicU64,
    active_connections: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_requests: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            blocked_rate_limit: AtomicU64::new(0),
            blocked_bot: AtomicU64::new(0),
            blocked_reputation: AtomicU64::new(0),
            upstream_errors: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
        }
    }

    pub fn inc_requests(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_rate_limit(&self) {
        self.blocked_rate_limit.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_bot(&self) {
        self.blocked_bot.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocked_reputation(&self) {
        self.blocked_reputation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_upstream_errors(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            blocked_rate_limit: self.blocked_rate_limit.load(Ordering::Relaxed),
            blocked_bot: self.blocked_bot.load(Ordering::Relaxed),
            blocked_reputation: self.blocked_reputation.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            memory_rss_bytes: process_rss_bytes(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Resident set size from /proc, zero where unavailable.
fn process_rss_bytes() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb: u64 = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    return kb * 1024;
                }
            }
        }
    }
    0
}
