use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{Local, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::settings::IpReputationConfig;
use crate::models::decision::{ReputationReason, ReputationVerdict};
use crate::models::request::mask_client_key;

const PROVIDER_CHECK_URL: &str = "https://api.abuseipdb.com/api/v2/check";
const PROVIDER_REPORT_URL: &str = "https://api.abuseipdb.com/api/v2/report";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Cache entries beyond this count trigger eviction of the oldest quarter.
const CACHE_MAX_ENTRIES: usize = 10_000;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Cached provider verdict for one IP. `last_checked` is unix milliseconds so
/// the record stays meaningful across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationRecord {
    pub score: u8,
    pub reports: u32,
    pub categories: Vec<u32>,
    pub country: Option<String>,
    pub isp: Option<String>,
    pub last_checked: i64,
}

impl ReputationRecord {
    fn is_fresh(&self, now_ms: i64, ttl: Duration) -> bool {
        now_ms - self.last_checked <= ttl.as_millis() as i64
    }
}

/// Daily call budget against the provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct QuotaState {
    calls_today: u32,
    /// Unix ms of the next local-midnight rollover.
    reset_at: i64,
}

impl QuotaState {
    fn fresh() -> Self {
        Self {
            calls_today: 0,
            reset_at: next_local_midnight_ms(),
        }
    }

    /// Roll the counter over when midnight has passed.
    fn maybe_reset(&mut self, now_ms: i64) {
        if now_ms >= self.reset_at {
            self.calls_today = 0;
            self.reset_at = next_local_midnight_ms();
        }
    }
}

/// On-disk layout: one JSON document holding the cache and the quota.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    cache: HashMap<String, ReputationRecord>,
    #[serde(rename = "apiCallsToday")]
    api_calls_today: u32,
    #[serde(rename = "apiResetTime")]
    api_reset_time: i64,
    #[serde(rename = "savedAt")]
    saved_at: i64,
}

/// Snapshot for `/metrics` and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct ReputationStats {
    pub enabled: bool,
    pub cached_entries: usize,
    pub api_calls_today: u32,
    pub daily_limit: u32,
    pub api_errors: u64,
    pub reports_sent: u64,
    pub whitelist_size: usize,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// External IP reputation engine: TTL cache over an abuse-reporting
/// provider, with a daily call quota and file persistence.
///
/// Lock discipline: the cache mutex is only held for map operations; the
/// provider call happens unlocked (check under lock, fetch, reinsert).
pub struct IpReputationManager {
    config: IpReputationConfig,
    cache: Mutex<HashMap<String, ReputationRecord>>,
    quota: Mutex<QuotaState>,
    whitelist: DashMap<String, ()>,
    client: reqwest::Client,
    check_url: String,
    report_url: String,
    api_errors: AtomicU64,
    reports_sent: AtomicU64,
}

impl IpReputationManager {
    pub fn new(config: &IpReputationConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .expect("Failed to build reputation HTTP client");

        let manager = Self {
            config: config.clone(),
            cache: Mutex::new(HashMap::new()),
            quota: Mutex::new(QuotaState::fresh()),
            whitelist: DashMap::new(),
            client,
            check_url: PROVIDER_CHECK_URL.to_string(),
            report_url: PROVIDER_REPORT_URL.to_string(),
            api_errors: AtomicU64::new(0),
            reports_sent: AtomicU64::new(0),
        };

        if config.enabled {
            manager.load_from_disk();
            info!(
                block_threshold = config.block_threshold,
                daily_limit = config.daily_limit,
                api_key_set = !config.api_key.is_empty(),
                "IP reputation engine initialised"
            );
        }

        manager
    }

    /// Full reputation check for one IP, issuing a provider lookup on a
    /// cache miss. Fails open on any provider error.
    pub async fn check(&self, ip: &str) -> ReputationVerdict {
        if !self.config.enabled {
            return ReputationVerdict::pass(ReputationReason::NoApiKey);
        }

        let parsed: IpAddr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => return ReputationVerdict::pass(ReputationReason::PrivateIp),
        };
        if is_private_ip(&parsed) {
            return ReputationVerdict::pass(ReputationReason::PrivateIp);
        }

        if self.whitelist.contains_key(ip) {
            return ReputationVerdict::pass(ReputationReason::Whitelisted);
        }

        if let Some(verdict) = self.check_cache(ip) {
            return verdict;
        }

        if self.config.api_key.is_empty() {
            return ReputationVerdict::pass(ReputationReason::NoApiKey);
        }

        // Refuse early when today's allowance is gone; the slot itself is
        // only consumed by a successful lookup.
        {
            let mut quota = self.quota.lock();
            quota.maybe_reset(Utc::now().timestamp_millis());
            if quota.calls_today >= self.config.daily_limit {
                debug!(ip = %mask_client_key(ip), "Reputation daily quota exhausted");
                return ReputationVerdict::pass(ReputationReason::RateLimited);
            }
        }

        let record = match self.fetch_from_provider(ip).await {
            Ok(record) => record,
            Err(err) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                error!(ip = %mask_client_key(ip), error = %err, "Reputation lookup failed");
                return ReputationVerdict::pass(ReputationReason::ApiError);
            }
        };

        self.insert_cached(ip, record.clone());
        {
            let mut quota = self.quota.lock();
            quota.maybe_reset(Utc::now().timestamp_millis());
            quota.calls_today += 1;
        }
        self.verdict_from(&record, false, ip)
    }

    /// Cache-only fast path: no I/O, no quota. Used by the pipeline's async
    /// mode before spawning the full lookup.
    pub fn check_cached(&self, ip: &str) -> Option<ReputationVerdict> {
        if !self.config.enabled {
            return None;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) if !is_private_ip(&addr) => self.check_cache(ip),
            _ => Some(ReputationVerdict::pass(ReputationReason::PrivateIp)),
        }
    }

    fn check_cache(&self, ip: &str) -> Option<ReputationVerdict> {
        let now_ms = Utc::now().timestamp_millis();
        let cache = self.cache.lock();
        let record = cache.get(ip)?;
        if !record.is_fresh(now_ms, self.config.cache_ttl()) {
            // Expired records are treated as absent; the next full check
            // refetches and overwrites them.
            return None;
        }
        let record = record.clone();
        drop(cache);

        let mut verdict = self.verdict_from_silent(&record);
        verdict.cached = true;
        Some(verdict)
    }

    /// Engine-local allow-list. Separate from the coordinator's list: an
    /// operator may trust an IP for reputation purposes while still rate
    /// limiting it.
    pub fn add_to_whitelist(&self, ip: &str) {
        self.whitelist.insert(ip.to_string(), ());
    }

    pub fn remove_from_whitelist(&self, ip: &str) -> bool {
        self.whitelist.remove(ip).is_some()
    }

    /// Submit an abuse report for `ip`. Refused for private addresses and
    /// when no API key is configured.
    pub async fn report(&self, ip: &str, categories: &[u32], comment: &str) -> bool {
        if self.config.api_key.is_empty() {
            return false;
        }
        match ip.parse::<IpAddr>() {
            Ok(addr) if !is_private_ip(&addr) => {}
            _ => return false,
        }

        let categories = categories
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let result = self
            .client
            .post(&self.report_url)
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .form(&[("ip", ip), ("categories", categories.as_str()), ("comment", comment)])
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                self.reports_sent.fetch_add(1, Ordering::Relaxed);
                info!(ip = %mask_client_key(ip), "Abuse report submitted");
                true
            }
            Ok(resp) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                warn!(ip = %mask_client_key(ip), status = %resp.status(), "Abuse report rejected");
                false
            }
            Err(err) => {
                self.api_errors.fetch_add(1, Ordering::Relaxed);
                error!(ip = %mask_client_key(ip), error = %err, "Abuse report failed");
                false
            }
        }
    }

    pub fn stats(&self) -> ReputationStats {
        let quota = self.quota.lock();
        ReputationStats {
            enabled: self.config.enabled,
            cached_entries: self.cache.lock().len(),
            api_calls_today: quota.calls_today,
            daily_limit: self.config.daily_limit,
            api_errors: self.api_errors.load(Ordering::Relaxed),
            reports_sent: self.reports_sent.load(Ordering::Relaxed),
            whitelist_size: self.whitelist.len(),
        }
    }

    /// Flusher tick: roll the quota if midnight passed and persist state.
    pub fn flush(&self) {
        {
            let mut quota = self.quota.lock();
            quota.maybe_reset(Utc::now().timestamp_millis());
        }
        self.save_to_disk();
    }

    // -----------------------------------------------------------------------
    // Provider protocol
    // -----------------------------------------------------------------------

    async fn fetch_from_provider(&self, ip: &str) -> Result<ReputationRecord, anyhow::Error> {
        let response = self
            .client
            .get(&self.check_url)
            .header("Key", &self.config.api_key)
            .header("Accept", "application/json")
            .query(&[("ipAddress", ip), ("maxAgeInDays", "90"), ("verbose", "")])
            .send()
            .await?
            .error_for_status()?;

        let body: Value = response.json().await?;
        let data = body
            .get("data")
            .ok_or_else(|| anyhow::anyhow!("provider response missing data"))?;

        let score = data
            .get("abuseConfidenceScore")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            .min(100) as u8;
        let reports = data
            .get("totalReports")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;
        let country = data
            .get("countryCode")
            .and_then(Value::as_str)
            .map(str::to_string);
        let isp = data.get("isp").and_then(Value::as_str).map(str::to_string);

        // Categories, deduplicated across the first ten report objects.
        let mut categories: Vec<u32> = Vec::new();
        if let Some(report_list) = data.get("reports").and_then(Value::as_array) {
            for report in report_list.iter().take(10) {
                if let Some(cats) = report.get("categories").and_then(Value::as_array) {
                    for cat in cats {
                        if let Some(c) = cat.as_u64() {
                            let c = c as u32;
                            if !categories.contains(&c) {
                                categories.push(c);
                            }
                        }
                    }
                }
            }
        }

        Ok(ReputationRecord {
            score,
            reports,
            categories,
            country,
            isp,
            last_checked: Utc::now().timestamp_millis(),
        })
    }

    fn insert_cached(&self, ip: &str, record: ReputationRecord) {
        let mut cache = self.cache.lock();
        if cache.len() >= CACHE_MAX_ENTRIES {
            evict_oldest_quarter(&mut cache);
        }
        cache.insert(ip.to_string(), record);
    }

    fn verdict_from(&self, record: &ReputationRecord, cached: bool, ip: &str) -> ReputationVerdict {
        let mut verdict = self.verdict_from_silent(record);
        verdict.cached = cached;

        if verdict.blocked {
            warn!(
                ip = %mask_client_key(ip),
                score = record.score,
                reports = record.reports,
                "IP blocked by reputation"
            );
        } else if record.score >= self.config.warn_threshold {
            info!(
                ip = %mask_client_key(ip),
                score = record.score,
                "Elevated IP reputation score"
            );
        }
        verdict
    }

    fn verdict_from_silent(&self, record: &ReputationRecord) -> ReputationVerdict {
        ReputationVerdict {
            blocked: record.score >= self.config.block_threshold,
            score: record.score,
            reason: ReputationReason::Scored,
            cached: false,
            reports: Some(record.reports),
            categories: Some(record.categories.clone()),
            country: record.country.clone(),
            isp: record.isp.clone(),
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn load_from_disk(&self) {
        let path = &self.config.cache_file;
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(_) => return,
        };
        let persisted: PersistedState = match serde_json::from_str(&content) {
            Ok(p) => p,
            Err(err) => {
                debug!(path = %path, error = %err, "Ignoring unreadable reputation cache file");
                return;
            }
        };

        let now_ms = Utc::now().timestamp_millis();
        let ttl = self.config.cache_ttl();
        let mut cache = self.cache.lock();
        let mut loaded = 0usize;
        for (ip, record) in persisted.cache {
            if record.is_fresh(now_ms, ttl) {
                cache.insert(ip, record);
                loaded += 1;
            }
        }
        drop(cache);

        // Restore the quota only while its reset instant is still ahead.
        if persisted.api_reset_time > now_ms {
            let mut quota = self.quota.lock();
            quota.calls_today = persisted.api_calls_today;
            quota.reset_at = persisted.api_reset_time;
        }

        info!(entries = loaded, path = %path, "Reputation cache restored");
    }

    fn save_to_disk(&self) {
        let path = &self.config.cache_file;
        let state = {
            let cache = self.cache.lock();
            let quota = self.quota.lock();
            PersistedState {
                cache: cache.clone(),
                api_calls_today: quota.calls_today,
                api_reset_time: quota.reset_at,
                saved_at: Utc::now().timestamp_millis(),
            }
        };

        if let Some(parent) = Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let result = serde_json::to_string(&state)
            .map_err(std::io::Error::other)
            .and_then(|json| std::fs::write(path, json));
        if let Err(err) = result {
            debug!(path = %path, error = %err, "Failed to persist reputation cache");
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Private, loopback and link-local ranges that must never be sent to the
/// provider: 10/8, 172.16/12, 192.168/16, 127/8, 169.254/16, ::1, fc00::/7,
/// fe80::/10.
pub fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || octets[0] == 10
                || (octets[0] == 172 && (16..=31).contains(&octets[1]))
                || (octets[0] == 192 && octets[1] == 168)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                // fc00::/7, matched on the top 7 bits rather than a string prefix.
                || (first & 0xfe00) == 0xfc00
                // fe80::/10
                || (first & 0xffc0) == 0xfe80
        }
    }
}

fn evict_oldest_quarter(cache: &mut HashMap<String, ReputationRecord>) {
    let mut by_age: Vec<(String, i64)> = cache
        .iter()
        .map(|(ip, record)| (ip.clone(), record.last_checked))
        .collect();
    by_age.sort_by_key(|(_, checked)| *checked);
    let evict = by_age.len() / 4;
    for (ip, _) in by_age.into_iter().take(evict) {
        cache.remove(&ip);
    }
}

/// Unix ms of the upcoming local midnight.
fn next_local_midnight_ms() -> i64 {
    let tomorrow = Local::now().date_naive() + chrono::Days::new(1);
    match tomorrow.and_hms_opt(0, 0, 0) {
        Some(naive) => match Local.from_local_datetime(&naive).earliest() {
            Some(dt) => dt.timestamp_millis(),
            None => Utc::now().timestamp_millis() + 86_400_000,
        },
        None => Utc::now().timestamp_millis() + 86_400_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::CheckMode;

    fn config(api_key: &str) -> IpReputationConfig {
        use std::sync::atomic::AtomicUsize;
        static FILE_SEQ: AtomicUsize = AtomicUsize::new(0);
        let seq = FILE_SEQ.fetch_add(1, Ordering::Relaxed);
        IpReputationConfig {
            enabled: true,
            api_key: api_key.to_string(),
            block_threshold: 80,
            warn_threshold: 50,
            check_mode: CheckMode::Sync,
            cache_ttl_ms: 3_600_000,
            daily_limit: 1_000,
            cache_file: std::env::temp_dir()
                .join(format!("rampart-rep-test-{}-{}.json", std::process::id(), seq))
                .to_string_lossy()
                .into_owned(),
        }
    }

    fn record(score: u8, age_ms: i64) -> ReputationRecord {
        ReputationRecord {
            score,
            reports: 12,
            categories: vec![14, 18],
            country: Some("NL".to_string()),
            isp: Some("Example Hosting".to_string()),
            last_checked: Utc::now().timestamp_millis() - age_ms,
        }
    }

    #[test]
    fn private_ranges_are_detected() {
        for ip in [
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
            "::1",
            "fc00::1",
            "fdff::1",
            "fe80::1",
        ] {
            let parsed: IpAddr = ip.parse().expect("valid test ip");
            assert!(is_private_ip(&parsed), "{} should be private", ip);
        }
        for ip in ["8.8.8.8", "172.32.0.1", "203.0.113.9", "2001:db8::1", "fb00::1"] {
            let parsed: IpAddr = ip.parse().expect("valid test ip");
            assert!(!is_private_ip(&parsed), "{} should be public", ip);
        }
    }

    #[tokio::test]
    async fn private_ip_never_reaches_the_provider() {
        let engine = IpReputationManager::new(&config("test-key"));
        let verdict = engine.check("192.168.0.10").await;
        assert!(!verdict.blocked);
        assert_eq!(verdict.reason, ReputationReason::PrivateIp);
        assert_eq!(engine.stats().api_calls_today, 0);
    }

    #[tokio::test]
    async fn missing_api_key_fails_open() {
        let engine = IpReputationManager::new(&config(""));
        let verdict = engine.check("203.0.113.9").await;
        assert!(!verdict.blocked);
        assert_eq!(verdict.reason, ReputationReason::NoApiKey);
    }

    #[tokio::test]
    async fn whitelisted_ip_short_circuits() {
        let engine = IpReputationManager::new(&config("test-key"));
        engine.add_to_whitelist("203.0.113.9");
        let verdict = engine.check("203.0.113.9").await;
        assert_eq!(verdict.reason, ReputationReason::Whitelisted);
    }

    #[test]
    fn cache_hit_derives_block_from_threshold() {
        let engine = IpReputationManager::new(&config("test-key"));
        engine.insert_cached("203.0.113.1", record(85, 0));
        engine.insert_cached("203.0.113.2", record(40, 0));

        let blocked = engine.check_cached("203.0.113.1").expect("cache hit");
        assert!(blocked.blocked);
        assert!(blocked.cached);
        assert_eq!(blocked.score, 85);

        let clean = engine.check_cached("203.0.113.2").expect("cache hit");
        assert!(!clean.blocked);
        assert_eq!(clean.reports, Some(12));
    }

    #[test]
    fn expired_cache_entries_are_absent() {
        let engine = IpReputationManager::new(&config("test-key"));
        engine.insert_cached("203.0.113.3", record(90, 4_000_000));
        assert!(engine.check_cached("203.0.113.3").is_none());
    }

    #[test]
    fn persistence_round_trip_keeps_fresh_records() {
        let cfg = config("test-key");
        let engine = IpReputationManager::new(&cfg);
        engine.insert_cached("203.0.113.4", record(65, 0));
        engine.insert_cached("203.0.113.5", record(20, 4_000_000)); // already expired
        engine.flush();

        let restored = IpReputationManager::new(&cfg);
        assert!(restored.check_cached("203.0.113.4").is_some());
        assert!(restored.check_cached("203.0.113.5").is_none());

        let _ = std::fs::remove_file(&cfg.cache_file);
    }

    #[test]
    fn eviction_drops_the_oldest_quarter() {
        let mut cache = HashMap::new();
        for i in 0..8 {
            cache.insert(
                format!("203.0.113.{}", i),
                record(10, (8 - i as i64) * 1_000),
            );
        }
        evict_oldest_quarter(&mut cache);
        assert_eq!(cache.len(), 6);
        // The two oldest entries (largest age) are gone.
        assert!(!cache.contains_key("203.0.113.0"));
        assert!(!cache.contains_key("203.0.113.1"));
        assert!(cache.contains_key("203.0.113.7"));
    }

    #[test]
    fn quota_rolls_over_at_reset_instant() {
        let mut quota = QuotaState {
            calls_today: 500,
            reset_at: 1_000,
        };
        quota.maybe_reset(999);
        assert_eq!(quota.calls_today, 500);
        quota.maybe_reset(1_000);
        assert_eq!(quota.calls_today, 0);
        assert!(quota.reset_at > 1_000);
    }

    #[tokio::test]
    async fn api_error_leaves_quota_untouched() {
        let mut engine = IpReputationManager::new(&config("test-key"));
        // Closed local port: the lookup fails fast with a connect error.
        engine.check_url = "http://127.0.0.1:9/api/v2/check".to_string();

        let verdict = engine.check("203.0.113.50").await;
        assert!(!verdict.blocked);
        assert_eq!(verdict.reason, ReputationReason::ApiError);

        let stats = engine.stats();
        assert_eq!(stats.api_calls_today, 0);
        assert_eq!(stats.api_errors, 1);
        // Nothing was cached for the failed lookup.
        assert!(engine.check_cached("203.0.113.50").is_none());
    }

    #[tokio::test]
    async fn report_refuses_private_ip() {
        let engine = IpReputationManager::new(&config("test-key"));
        assert!(!engine.report("10.0.0.1", &[14], "scan").await);
        assert_eq!(engine.stats().reports_sent, 0);
    }
}
