use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::settings::RateLimitConfig;
use crate::models::decision::{LimitReason, RateDecision};

/// Per-key mutable state behind the sliding window.
#[derive(Debug, Clone)]
struct ClientRecord {
    /// Request instants inside the current window. Never holds more than
    /// `max_requests + 1` entries; the overflow entry is the request that
    /// triggered the block.
    timestamps: VecDeque<Instant>,
    blocked: bool,
    blocked_until: Instant,
    total_requests: u64,
    total_blocks: u64,
    last_seen: Instant,
}

impl ClientRecord {
    fn new(now: Instant) -> Self {
        Self {
            timestamps: VecDeque::new(),
            blocked: false,
            blocked_until: now,
            total_requests: 0,
            total_blocks: 0,
            last_seen: now,
        }
    }

    fn has_active_block(&self, now: Instant) -> bool {
        self.blocked && now < self.blocked_until
    }
}

/// Point-in-time view of one key's state, for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub requests_in_window: usize,
    pub blocked: bool,
    pub block_remaining_secs: u64,
    pub total_requests: u64,
    pub total_blocks: u64,
}

/// Aggregate counters across every tracked key.
#[derive(Debug, Clone, Serialize)]
pub struct TrackerStats {
    pub tracked_clients: usize,
    pub currently_blocked: usize,
    pub total_requests: u64,
    pub total_blocks: u64,
}

/// Sliding-window request tracker.
///
/// Decides, for a given client key and instant, whether one more request is
/// admissible. All state is process-local; a janitor evicts idle records.
pub struct ClientTracker {
    records: DashMap<String, ClientRecord>,
    window: Duration,
    max_requests: usize,
    block_duration: Duration,
}

impl ClientTracker {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            records: DashMap::new(),
            window: config.window(),
            max_requests: config.max_requests,
            block_duration: config.block_duration(),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Admit or refuse one request for `key` at instant `now`.
    pub fn track(&self, key: &str, now: Instant) -> RateDecision {
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| ClientRecord::new(now));
        record.last_seen = now;

        // Active block timer wins before any window accounting.
        if record.blocked {
            if now < record.blocked_until {
                return RateDecision::refuse(LimitReason::Blocked, record.blocked_until - now);
            }
            // Timer expired; the key starts over with an empty window.
            record.blocked = false;
            record.blocked_until = now;
            record.timestamps.clear();
        }

        // Evict window entries older than `now - window`.
        let cutoff = now.checked_sub(self.window);
        if let Some(cutoff) = cutoff {
            while let Some(front) = record.timestamps.front() {
                if *front < cutoff {
                    record.timestamps.pop_front();
                } else {
                    break;
                }
            }
        }

        record.timestamps.push_back(now);
        record.total_requests += 1;

        if record.timestamps.len() > self.max_requests {
            record.blocked = true;
            record.blocked_until = now + self.block_duration;
            record.total_blocks += 1;
            return RateDecision::refuse(LimitReason::RateLimitExceeded, self.block_duration);
        }

        let remaining = self.max_requests - record.timestamps.len();
        let reset = record
            .timestamps
            .front()
            .and_then(|first| (*first + self.window).checked_duration_since(now))
            .unwrap_or(Duration::ZERO);

        RateDecision::allow(remaining, reset)
    }

    /// Force a block for `key`, regardless of window state.
    pub fn block(&self, key: &str, duration: Duration, reason: &str) {
        let now = Instant::now();
        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| ClientRecord::new(now));
        if !record.blocked {
            record.total_blocks += 1;
        }
        record.blocked = true;
        record.blocked_until = now + duration;
        record.last_seen = now;
        drop(record);
        debug!(
            key = %crate::models::request::mask_client_key(key),
            duration_secs = duration.as_secs(),
            reason,
            "Block applied"
        );
    }

    /// Lift any block and clear the window for `key`.
    pub fn unblock(&self, key: &str) {
        if let Some(mut record) = self.records.get_mut(key) {
            record.blocked = false;
            record.blocked_until = Instant::now();
            record.timestamps.clear();
        }
    }

    /// Current blocked state without mutation.
    pub fn is_blocked(&self, key: &str, now: Instant) -> bool {
        self.records
            .get(key)
            .map(|r| r.has_active_block(now))
            .unwrap_or(false)
    }

    /// Keys currently serving a block timer.
    pub fn blocked_keys(&self, now: Instant) -> Vec<(String, u64)> {
        self.records
            .iter()
            .filter(|e| e.value().has_active_block(now))
            .map(|e| {
                let secs = (e.value().blocked_until - now).as_secs();
                (e.key().clone(), secs)
            })
            .collect()
    }

    /// Snapshot of one key's state, if tracked.
    pub fn stats(&self, key: &str) -> Option<ClientStats> {
        let now = Instant::now();
        self.records.get(key).map(|r| ClientStats {
            requests_in_window: r.timestamps.len(),
            blocked: r.has_active_block(now),
            block_remaining_secs: if r.has_active_block(now) {
                (r.blocked_until - now).as_secs()
            } else {
                0
            },
            total_requests: r.total_requests,
            total_blocks: r.total_blocks,
        })
    }

    /// Aggregate counters across all records.
    pub fn global_stats(&self) -> TrackerStats {
        let now = Instant::now();
        let mut stats = TrackerStats {
            tracked_clients: 0,
            currently_blocked: 0,
            total_requests: 0,
            total_blocks: 0,
        };
        for entry in self.records.iter() {
            let r = entry.value();
            stats.tracked_clients += 1;
            if r.has_active_block(now) {
                stats.currently_blocked += 1;
            }
            stats.total_requests += r.total_requests;
            stats.total_blocks += r.total_blocks;
        }
        stats
    }

    /// Janitor pass: drop records idle beyond the window with no active
    /// block. A blocked record is never evicted while its timer runs.
    pub fn cleanup(&self, now: Instant) {
        let cutoff = now.checked_sub(self.window);
        let before = self.records.len();
        self.records.retain(|_, record| {
            if record.has_active_block(now) {
                return true;
            }
            match cutoff {
                Some(cutoff) => record.timestamps.back().is_some_and(|t| *t >= cutoff),
                None => true,
            }
        });
        let evicted = before - self.records.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.records.len(), "Client tracker cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(window_ms: u64, max: usize, block_ms: u64) -> ClientTracker {
        let config = RateLimitConfig {
            enabled: true,
            window_ms,
            max_requests: max,
            block_duration_ms: block_ms,
            cleanup_interval_ms: 60_000,
            skip_paths: Vec::new(),
        };
        ClientTracker::new(&config)
    }

    #[test]
    fn admits_up_to_max_then_blocks_the_overflow() {
        let t = tracker(1_000, 5, 2_000);
        let now = Instant::now();

        for i in 0..5 {
            let d = t.track("1.2.3.4", now + Duration::from_millis(i * 10));
            assert!(d.allowed, "request {} should be admitted", i + 1);
            assert_eq!(d.remaining, Some(5 - (i as usize + 1)));
        }

        let sixth = t.track("1.2.3.4", now + Duration::from_millis(60));
        assert!(!sixth.allowed);
        assert!(sixth.blocked);
        assert_eq!(sixth.remaining, Some(0));
        assert_eq!(sixth.reason, LimitReason::RateLimitExceeded);
        assert_eq!(sixth.retry_after_secs(), 2);
    }

    #[test]
    fn block_expires_at_exact_instant() {
        let t = tracker(1_000, 1, 2_000);
        let now = Instant::now();

        assert!(t.track("k", now).allowed);
        assert!(!t.track("k", now).allowed);

        let expiry = now + Duration::from_secs(2);
        assert!(t.is_blocked("k", expiry - Duration::from_millis(1)));
        // A request at exactly blocked_until is treated as unblocked.
        assert!(!t.is_blocked("k", expiry));
        let d = t.track("k", expiry);
        assert!(d.allowed);
        assert_eq!(d.remaining, Some(0));
    }

    #[test]
    fn window_slides_out_old_entries() {
        let t = tracker(1_000, 2, 5_000);
        let now = Instant::now();

        assert!(t.track("k", now).allowed);
        assert!(t.track("k", now + Duration::from_millis(100)).allowed);
        // Outside the window of the first two requests.
        let later = now + Duration::from_millis(1_200);
        let d = t.track("k", later);
        assert!(d.allowed);
        assert_eq!(d.remaining, Some(1));
    }

    #[test]
    fn lifetime_counters_are_monotonic() {
        let t = tracker(1_000, 2, 1_000);
        let now = Instant::now();

        for i in 0..3 {
            t.track("k", now + Duration::from_millis(i));
        }
        let stats = t.stats("k").expect("record exists");
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_blocks, 1);

        // Re-blocking after expiry bumps total_blocks exactly once more.
        let after = now + Duration::from_secs(2);
        for i in 0..3 {
            t.track("k", after + Duration::from_millis(i));
        }
        let stats = t.stats("k").expect("record exists");
        assert_eq!(stats.total_requests, 6);
        assert_eq!(stats.total_blocks, 2);
    }

    #[test]
    fn manual_block_and_unblock_round_trip() {
        let t = tracker(1_000, 100, 1_000);
        let now = Instant::now();

        t.block("10.0.0.1", Duration::from_secs(60), "abuse");
        assert!(t.is_blocked("10.0.0.1", now + Duration::from_millis(1)));

        t.unblock("10.0.0.1");
        assert!(!t.is_blocked("10.0.0.1", Instant::now()));
        assert!(t.track("10.0.0.1", Instant::now()).allowed);
    }

    #[test]
    fn manual_block_only_counts_transition() {
        let t = tracker(1_000, 100, 1_000);
        t.block("k", Duration::from_secs(60), "abuse");
        t.block("k", Duration::from_secs(120), "abuse");
        let stats = t.stats("k").expect("record exists");
        assert_eq!(stats.total_blocks, 1);
    }

    #[test]
    fn janitor_keeps_blocked_records() {
        let t = tracker(1_000, 1, 600_000);
        let now = Instant::now();

        t.track("idle", now);
        t.track("blocked", now);
        t.track("blocked", now); // trips the block

        let later = now + Duration::from_secs(10);
        t.cleanup(later);

        assert!(t.stats("idle").is_none(), "idle record evicted");
        assert!(t.stats("blocked").is_some(), "blocked record survives");
    }

    #[test]
    fn global_stats_aggregate() {
        let t = tracker(60_000, 1, 600_000);
        let now = Instant::now();
        t.track("a", now);
        t.track("b", now);
        t.track("b", now); // blocks b

        let g = t.global_stats();
        assert_eq!(g.tracked_clients, 2);
        assert_eq!(g.currently_blocked, 1);
        assert_eq!(g.total_requests, 3);
        assert_eq!(g.total_blocks, 1);
    }
}
