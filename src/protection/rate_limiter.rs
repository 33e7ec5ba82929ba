use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::settings::RateLimitConfig;
use crate::models::decision::{LimitReason, RateDecision};
use crate::models::request::RequestContext;

use super::client_tracker::{ClientTracker, TrackerStats};

/// Admission coordinator wrapping the sliding-window tracker with
/// allow/deny lists, skip-path policy, and client-key extraction.
///
/// Check order: disabled → skip-path → allow-list → deny-list → tracker.
/// The two lists are kept disjoint: adding a key to one side removes it
/// from the other.
pub struct RateLimiter {
    tracker: ClientTracker,
    whitelist: DashMap<String, ()>,
    blacklist: DashMap<String, ()>,
    skip_paths: Vec<String>,
    trust_proxy: bool,
    enabled: bool,
}

/// Snapshot for `/metrics` and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub whitelist_size: usize,
    pub blacklist_size: usize,
    #[serde(flatten)]
    pub tracker: TrackerStats,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig, trust_proxy: bool) -> Self {
        Self {
            tracker: ClientTracker::new(config),
            whitelist: DashMap::new(),
            blacklist: DashMap::new(),
            skip_paths: config.skip_paths.clone(),
            trust_proxy,
            enabled: config.enabled,
        }
    }

    /// Decide admission for one request.
    pub fn check(&self, ctx: &RequestContext, now: Instant) -> RateDecision {
        if !self.enabled {
            return RateDecision::bypass(LimitReason::Disabled);
        }

        if self
            .skip_paths
            .iter()
            .any(|prefix| ctx.path.starts_with(prefix.as_str()))
        {
            return RateDecision::bypass(LimitReason::Skipped);
        }

        if self.whitelist.contains_key(&ctx.client_key) {
            return RateDecision::bypass(LimitReason::Whitelisted);
        }

        if self.blacklist.contains_key(&ctx.client_key) {
            debug!(key = %ctx.masked_key(), "Deny-list refusal");
            return RateDecision::refuse(LimitReason::Blacklisted, std::time::Duration::ZERO);
        }

        self.tracker.track(&ctx.client_key, now)
    }

    /// Derive the client key from headers and the socket peer.
    ///
    /// The forwarded chain is honoured only when `trust_proxy` is set; the
    /// first entry wins, falling back to the real-ip header, then the peer.
    pub fn client_key(&self, headers: &HashMap<String, String>, peer: IpAddr) -> String {
        if self.trust_proxy {
            if let Some(chain) = headers.get("x-forwarded-for") {
                if let Some(first) = chain.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
            if let Some(real_ip) = headers.get("x-real-ip") {
                let real_ip = real_ip.trim();
                if !real_ip.is_empty() {
                    return real_ip.to_string();
                }
            }
        }
        peer.to_string()
    }

    // -----------------------------------------------------------------------
    // List mutators (admin surface)
    // -----------------------------------------------------------------------

    /// Returns true when the key was newly added.
    pub fn add_to_whitelist(&self, key: &str) -> bool {
        self.blacklist.remove(key);
        self.whitelist.insert(key.to_string(), ()).is_none()
    }

    pub fn remove_from_whitelist(&self, key: &str) -> bool {
        self.whitelist.remove(key).is_some()
    }

    pub fn add_to_blacklist(&self, key: &str) -> bool {
        self.whitelist.remove(key);
        self.blacklist.insert(key.to_string(), ()).is_none()
    }

    pub fn remove_from_blacklist(&self, key: &str) -> bool {
        self.blacklist.remove(key).is_some()
    }

    pub fn whitelist_entries(&self) -> Vec<String> {
        self.whitelist.iter().map(|e| e.key().clone()).collect()
    }

    pub fn blacklist_entries(&self) -> Vec<String> {
        self.blacklist.iter().map(|e| e.key().clone()).collect()
    }

    /// Direct access to block/unblock and per-key stats.
    pub fn tracker(&self) -> &ClientTracker {
        &self.tracker
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            enabled: self.enabled,
            whitelist_size: self.whitelist.len(),
            blacklist_size: self.blacklist.len(),
            tracker: self.tracker.global_stats(),
        }
    }

    /// Janitor pass, delegated to the tracker.
    pub fn cleanup(&self, now: Instant) {
        self.tracker.cleanup(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn limiter(max: usize) -> RateLimiter {
        let config = RateLimitConfig {
            enabled: true,
            window_ms: 1_000,
            max_requests: max,
            block_duration_ms: 2_000,
            cleanup_interval_ms: 60_000,
            skip_paths: vec!["/health".to_string()],
        };
        RateLimiter::new(&config, true)
    }

    fn ctx(key: &str, path: &str) -> RequestContext {
        RequestContext {
            client_key: key.to_string(),
            peer_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            method: "GET".to_string(),
            path: path.to_string(),
            host: "example.test".to_string(),
            scheme: "http",
            headers: HashMap::new(),
            request_id: "0000000000000000".to_string(),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn whitelist_short_circuits_the_tracker() {
        let rl = limiter(2);
        rl.add_to_whitelist("10.0.0.1");
        let c = ctx("10.0.0.1", "/");
        for _ in 0..100 {
            let d = rl.check(&c, Instant::now());
            assert!(d.allowed);
            assert_eq!(d.reason, LimitReason::Whitelisted);
            assert_eq!(d.remaining, None);
        }
    }

    #[test]
    fn blacklist_refuses_before_the_tracker() {
        let rl = limiter(100);
        rl.add_to_blacklist("6.6.6.6");
        let d = rl.check(&ctx("6.6.6.6", "/"), Instant::now());
        assert!(!d.allowed);
        assert_eq!(d.reason, LimitReason::Blacklisted);
    }

    #[test]
    fn skip_paths_bypass_tracking() {
        let rl = limiter(1);
        let c = ctx("1.1.1.1", "/health");
        for _ in 0..10 {
            assert_eq!(rl.check(&c, Instant::now()).reason, LimitReason::Skipped);
        }
        // The tracker never saw those requests.
        assert!(rl.tracker().stats("1.1.1.1").is_none());
    }

    #[test]
    fn lists_stay_disjoint() {
        let rl = limiter(10);
        rl.add_to_whitelist("2.2.2.2");
        rl.add_to_blacklist("2.2.2.2");
        assert!(!rl.whitelist_entries().contains(&"2.2.2.2".to_string()));
        assert!(rl.blacklist_entries().contains(&"2.2.2.2".to_string()));

        rl.add_to_whitelist("2.2.2.2");
        assert!(rl.whitelist_entries().contains(&"2.2.2.2".to_string()));
        assert!(!rl.blacklist_entries().contains(&"2.2.2.2".to_string()));
    }

    #[test]
    fn list_round_trip_restores_prior_state() {
        let rl = limiter(10);
        assert!(rl.add_to_whitelist("3.3.3.3"));
        assert!(rl.remove_from_whitelist("3.3.3.3"));
        assert!(rl.whitelist_entries().is_empty());
        assert!(!rl.remove_from_whitelist("3.3.3.3"));
    }

    #[test]
    fn disabled_mode_admits_everything() {
        let config = RateLimitConfig {
            enabled: false,
            window_ms: 1_000,
            max_requests: 1,
            block_duration_ms: 1_000,
            cleanup_interval_ms: 60_000,
            skip_paths: Vec::new(),
        };
        let rl = RateLimiter::new(&config, true);
        let c = ctx("4.4.4.4", "/");
        for _ in 0..5 {
            let d = rl.check(&c, Instant::now());
            assert!(d.allowed);
            assert_eq!(d.reason, LimitReason::Disabled);
        }
    }

    #[test]
    fn key_extraction_honours_trust_proxy() {
        let rl = limiter(10);
        let peer = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 9));

        let mut headers = HashMap::new();
        headers.insert(
            "x-forwarded-for".to_string(),
            "198.51.100.7, 10.0.0.2".to_string(),
        );
        assert_eq!(rl.client_key(&headers, peer), "198.51.100.7");

        let mut headers = HashMap::new();
        headers.insert("x-real-ip".to_string(), "198.51.100.8".to_string());
        assert_eq!(rl.client_key(&headers, peer), "198.51.100.8");

        assert_eq!(rl.client_key(&HashMap::new(), peer), "192.0.2.9");

        let config = RateLimitConfig {
            enabled: true,
            window_ms: 1_000,
            max_requests: 10,
            block_duration_ms: 1_000,
            cleanup_interval_ms: 60_000,
            skip_paths: Vec::new(),
        };
        let untrusted = RateLimiter::new(&config, false);
        let mut headers = HashMap::new();
        headers.insert("x-forwarded-for".to_string(), "198.51.100.7".to_string());
        assert_eq!(untrusted.client_key(&headers, peer), "192.0.2.9");
    }

    #[test]
    fn tracker_refusal_flows_through() {
        let rl = limiter(2);
        let c = ctx("5.5.5.5", "/app");
        let now = Instant::now();
        assert!(rl.check(&c, now).allowed);
        assert!(rl.check(&c, now + Duration::from_millis(1)).allowed);
        let d = rl.check(&c, now + Duration::from_millis(2));
        assert!(!d.allowed);
        assert_eq!(d.reason, LimitReason::RateLimitExceeded);
    }
}
