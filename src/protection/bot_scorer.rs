use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::settings::BotDetectionConfig;
use crate::models::decision::BotVerdict;
use crate::models::request::RequestContext;

/// Crawler user-agent fragments worth +20.
const KNOWN_BOTS: &[&str] = &[
    "googlebot",
    "bingbot",
    "slurp",
    "duckduckbot",
    "baiduspider",
    "yandexbot",
    "sogou",
    "facebot",
    "ia_archiver",
    "semrushbot",
    "ahrefsbot",
    "mj12bot",
    "dotbot",
    "petalbot",
    "bytespider",
];

/// Scripted HTTP client fragments worth +15.
const SUSPICIOUS_CLIENTS: &[&str] = &[
    "python-requests",
    "python-urllib",
    "curl",
    "wget",
    "httpie",
    "postman",
    "insomnia",
    "axios",
    "node-fetch",
    "go-http-client",
    "java",
    "libwww",
    "lwp-trivial",
    "php",
    "ruby",
];

/// Attack-tool fragments worth +50.
const BAD_PATTERNS: &[&str] = &[
    "sqlmap",
    "nikto",
    "nmap",
    "masscan",
    "zgrab",
    "nessus",
    "openvas",
    "burp",
    "owasp",
    "acunetix",
    "dirbuster",
    "gobuster",
    "wfuzz",
    "hydra",
    "medusa",
];

/// Crawlers the pipeline may choose to forward despite a bot verdict.
const GOOD_BOTS: &[&str] = &["googlebot", "bingbot", "duckduckbot"];

/// Temporal window the pattern tracker keeps per key.
const PATTERN_WINDOW: Duration = Duration::from_secs(10);

/// Idle lifetime of a pattern record before the janitor drops it.
const PATTERN_TTL: Duration = Duration::from_secs(60);

/// Per-key temporal state feeding the rapid-request signal.
#[derive(Debug)]
struct PatternRecord {
    recent: VecDeque<Instant>,
    last_seen: Instant,
}

/// Snapshot for `/metrics` and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct BotScorerStats {
    pub enabled: bool,
    pub threshold: u8,
    pub tracked_patterns: usize,
}

/// Multi-signal behavioral bot scorer.
///
/// Scoring is a pure function of the request headers plus the key's own
/// temporal pattern record; identical headers always produce identical
/// header-derived signals.
pub struct BotScorer {
    patterns: DashMap<String, PatternRecord>,
    threshold: u8,
    enabled: bool,
}

impl BotScorer {
    pub fn new(config: &BotDetectionConfig) -> Self {
        Self {
            patterns: DashMap::new(),
            threshold: config.score_threshold,
            enabled: config.enabled,
        }
    }

    /// Score one request at instant `now`.
    pub fn score(&self, ctx: &RequestContext, now: Instant) -> BotVerdict {
        if !self.enabled {
            return BotVerdict::human();
        }

        let mut score: u32 = 0;
        let mut reasons: Vec<String> = Vec::new();

        match ctx.user_agent() {
            None => {
                score += 30;
                reasons.push("missing_or_short_ua".to_string());
            }
            Some(ua) if ua.len() < 10 => {
                score += 30;
                reasons.push("missing_or_short_ua".to_string());
            }
            Some(ua) => {
                let lower = ua.to_lowercase();
                if let Some(name) = KNOWN_BOTS.iter().find(|b| lower.contains(*b)) {
                    score += 20;
                    reasons.push(format!("known_bot:{}", name));
                }
                if let Some(name) = SUSPICIOUS_CLIENTS.iter().find(|b| lower.contains(*b)) {
                    score += 15;
                    reasons.push(format!("suspicious_ua:{}", name));
                }
                if let Some(name) = BAD_PATTERNS.iter().find(|b| lower.contains(*b)) {
                    score += 50;
                    reasons.push(format!("bad_pattern:{}", name));
                }
            }
        }

        if !ctx.headers.contains_key("accept") {
            score += 10;
            reasons.push("missing_accept".to_string());
        }
        if !ctx.headers.contains_key("accept-language") {
            score += 10;
            reasons.push("missing_accept_language".to_string());
        }
        if !ctx.headers.contains_key("accept-encoding") {
            score += 5;
            reasons.push("missing_accept_encoding".to_string());
        }
        if ctx.headers.contains_key("x-forwarded-for") && !ctx.headers.contains_key("via") {
            score += 5;
            reasons.push("proxy_without_via".to_string());
        }
        if ctx
            .header("connection")
            .is_some_and(|c| c.eq_ignore_ascii_case("close"))
        {
            score += 5;
            reasons.push("connection_close".to_string());
        }

        let temporal = self.track_pattern(&ctx.client_key, now);
        if temporal > 0 {
            score += temporal;
            reasons.push("rapid_requests".to_string());
        }

        let score = score.min(100) as u8;
        let is_bot = score >= self.threshold;

        if is_bot {
            debug!(
                key = %ctx.masked_key(),
                score,
                reasons = ?reasons,
                "Bot score over threshold"
            );
        }

        BotVerdict {
            is_bot,
            score,
            reasons,
            allowed: !is_bot,
        }
    }

    /// Reputable-crawler predicate used by the pipeline to optionally pass
    /// bots that identify as major search engines.
    pub fn is_known_good_bot(user_agent: Option<&str>) -> bool {
        match user_agent {
            Some(ua) => {
                let lower = ua.to_lowercase();
                GOOD_BOTS.iter().any(|b| lower.contains(b))
            }
            None => false,
        }
    }

    /// Update the temporal record and return the rapid-request points.
    fn track_pattern(&self, key: &str, now: Instant) -> u32 {
        let mut record = self.patterns.entry(key.to_string()).or_insert_with(|| PatternRecord {
            recent: VecDeque::new(),
            last_seen: now,
        });

        let previous = record.recent.back().copied();
        record.last_seen = now;

        if let Some(cutoff) = now.checked_sub(PATTERN_WINDOW) {
            while let Some(front) = record.recent.front() {
                if *front < cutoff {
                    record.recent.pop_front();
                } else {
                    break;
                }
            }
        }
        record.recent.push_back(now);

        let mut points = 0;
        if let Some(prev) = previous {
            let gap = now.saturating_duration_since(prev);
            if gap > Duration::ZERO && gap < Duration::from_millis(100) {
                points += 15;
            }
        }
        if record.recent.len() > 20 {
            points += 20;
        } else if record.recent.len() > 10 {
            points += 10;
        }
        points
    }

    pub fn stats(&self) -> BotScorerStats {
        BotScorerStats {
            enabled: self.enabled,
            threshold: self.threshold,
            tracked_patterns: self.patterns.len(),
        }
    }

    /// Janitor pass: drop pattern records idle beyond their TTL.
    pub fn cleanup(&self, now: Instant) {
        self.patterns
            .retain(|_, record| now.saturating_duration_since(record.last_seen) < PATTERN_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};

    fn scorer(threshold: u8) -> BotScorer {
        BotScorer::new(&BotDetectionConfig {
            enabled: true,
            score_threshold: threshold,
            allow_good_bots: true,
        })
    }

    fn ctx(key: &str, headers: &[(&str, &str)]) -> RequestContext {
        let mut map = HashMap::new();
        for (k, v) in headers {
            map.insert(k.to_string(), v.to_string());
        }
        RequestContext {
            client_key: key.to_string(),
            peer_addr: IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)),
            method: "GET".to_string(),
            path: "/x".to_string(),
            host: "example.test".to_string(),
            scheme: "http",
            headers: map,
            request_id: "0000000000000000".to_string(),
            received_at: Instant::now(),
        }
    }

    fn browser_headers<'a>(ua: &'a str) -> Vec<(&'a str, &'a str)> {
        vec![
            ("user-agent", ua),
            ("accept", "text/html"),
            ("accept-language", "en-US"),
            ("accept-encoding", "gzip"),
        ]
    }

    #[test]
    fn sqlmap_with_bare_headers_scores_75() {
        let s = scorer(70);
        let verdict = s.score(&ctx("1.2.3.4", &[("user-agent", "sqlmap/1.0")]), Instant::now());
        // 50 bad_pattern + 10 accept + 10 accept-language + 5 accept-encoding
        assert_eq!(verdict.score, 75);
        assert!(verdict.is_bot);
        assert!(!verdict.allowed);
        assert!(verdict.reasons.iter().any(|r| r == "bad_pattern:sqlmap"));
    }

    #[test]
    fn full_browser_headers_score_zero() {
        let s = scorer(70);
        let headers = browser_headers(
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 Chrome/120.0 Safari/537.36",
        );
        let verdict = s.score(&ctx("9.9.9.9", &headers), Instant::now());
        assert_eq!(verdict.score, 0);
        assert!(!verdict.is_bot);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn identical_headers_score_identically() {
        let s = scorer(70);
        let headers = [("user-agent", "curl/8.5.0"), ("accept", "*/*")];
        let a = s.score(&ctx("key-a", &headers), Instant::now());
        let b = s.score(&ctx("key-b", &headers), Instant::now());
        assert_eq!(a.score, b.score);
        assert_eq!(a.reasons, b.reasons);
    }

    #[test]
    fn score_is_monotone_with_extra_signals() {
        let s = scorer(70);
        let base = s.score(
            &ctx("m1", &browser_headers("python-requests/2.31")),
            Instant::now(),
        );
        let worse = s.score(
            &ctx("m2", &[("user-agent", "python-requests/2.31")]),
            Instant::now(),
        );
        assert!(worse.score >= base.score);
    }

    #[test]
    fn score_caps_at_100() {
        let s = scorer(70);
        // Short UA (30) would also need stacking; use every header signal plus
        // a scanner UA long enough to dodge the short-UA branch.
        let c = ctx(
            "cap",
            &[
                ("user-agent", "sqlmap/1.8 python-requests googlebot probe"),
                ("x-forwarded-for", "1.1.1.1"),
                ("connection", "close"),
            ],
        );
        let now = Instant::now();
        // 50+15+20 UA groups, 10+10+5 accept trio, 5 via, 5 close = 120 raw.
        let verdict = s.score(&c, now);
        assert_eq!(verdict.score, 100);
    }

    #[test]
    fn rapid_requests_raise_the_score() {
        let s = scorer(200);
        let c = ctx("burst", &browser_headers("Mozilla/5.0 AppleWebKit Chrome"));
        let start = Instant::now();
        let first = s.score(&c, start);
        assert_eq!(first.score, 0);

        // 40 ms gap: +15 for the interval.
        let second = s.score(&c, start + Duration::from_millis(40));
        assert_eq!(second.score, 15);
        assert!(second.reasons.iter().any(|r| r == "rapid_requests"));

        // Push the 10 s window past 20 entries: +20 on top of the gap.
        let mut t = start + Duration::from_millis(80);
        for _ in 0..19 {
            t += Duration::from_millis(40);
            s.score(&c, t);
        }
        let burst = s.score(&c, t + Duration::from_millis(40));
        assert_eq!(burst.score, 35);
    }

    #[test]
    fn disabled_scorer_returns_human() {
        let s = BotScorer::new(&BotDetectionConfig {
            enabled: false,
            score_threshold: 70,
            allow_good_bots: true,
        });
        let verdict = s.score(&ctx("x", &[("user-agent", "sqlmap/1.0")]), Instant::now());
        assert!(!verdict.is_bot);
        assert_eq!(verdict.score, 0);
    }

    #[test]
    fn known_good_bot_predicate() {
        assert!(BotScorer::is_known_good_bot(Some(
            "Mozilla/5.0 (compatible; Googlebot/2.1; +http://www.google.com/bot.html)"
        )));
        assert!(BotScorer::is_known_good_bot(Some("Mozilla/5.0 bingbot/2.0")));
        assert!(!BotScorer::is_known_good_bot(Some("sqlmap/1.0")));
        assert!(!BotScorer::is_known_good_bot(None));
    }

    #[test]
    fn googlebot_is_still_scored_as_bot() {
        let s = scorer(50);
        let verdict = s.score(
            &ctx("gb", &[("user-agent", "Mozilla/5.0 (compatible; Googlebot/2.1)")]),
            Instant::now(),
        );
        // 20 known_bot + 25 missing accept trio = 45; below 50 threshold,
        // but the known_bot reason is recorded either way.
        assert!(verdict.reasons.iter().any(|r| r == "known_bot:googlebot"));
    }

    #[test]
    fn janitor_drops_idle_patterns() {
        let s = scorer(70);
        let now = Instant::now();
        s.score(&ctx("old", &[("user-agent", "curl/8.5.0")]), now);
        assert_eq!(s.stats().tracked_patterns, 1);
        s.cleanup(now + Duration::from_secs(61));
        assert_eq!(s.stats().tracked_patterns, 0);
    }
}
