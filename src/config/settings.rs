use std::env;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use super::defaults;

/// Top-level configuration for the Rampart gateway.
///
/// Every field is read from an environment variable with a typed default;
/// values below the documented minimum are clamped up to it. Unparseable
/// values fall back to the default with a warning.
#[derive(Debug, Clone, Serialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub discovery: DiscoveryConfig,
    pub rate_limit: RateLimitConfig,
    pub bot_detection: BotDetectionConfig,
    pub ip_reputation: IpReputationConfig,
    pub stealth_mode: bool,
    pub trust_proxy: bool,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_cert_file: String,
    pub tls_key_file: String,
    pub access_log: String,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// TLS is active only when both PEM paths are configured.
    pub fn tls_enabled(&self) -> bool {
        !self.tls_cert_file.is_empty() && !self.tls_key_file.is_empty()
    }
}

/// Static upstream pool configuration.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamConfig {
    /// Manually configured upstream URLs. Empty enables discovery.
    pub hosts: Vec<String>,
    pub timeout_ms: u64,
    /// Headers set on every upstream request, overriding inbound values.
    pub static_headers: Vec<(String, String)>,
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Container discovery configuration.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub interval_ms: u64,
    /// Overlay network discovered containers are joined to.
    pub network: String,
    /// Substring identifying the gateway's own container.
    pub self_name: String,
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Sliding-window rate limiter configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub max_requests: usize,
    pub block_duration_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Path prefixes that bypass the tracker entirely.
    pub skip_paths: Vec<String>,
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Behavioral bot scorer configuration.
#[derive(Debug, Clone, Serialize)]
pub struct BotDetectionConfig {
    pub enabled: bool,
    pub score_threshold: u8,
    /// Forward reputable crawlers even when scored as bots.
    pub allow_good_bots: bool,
}

/// External IP reputation configuration.
#[derive(Debug, Clone, Serialize)]
pub struct IpReputationConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub block_threshold: u8,
    pub warn_threshold: u8,
    pub check_mode: CheckMode,
    pub cache_ttl_ms: u64,
    pub daily_limit: u32,
    pub cache_file: String,
}

impl IpReputationConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }
}

/// Whether the pipeline awaits the reputation verdict or lets the lookup
/// complete in the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckMode {
    Sync,
    Async,
}

impl Settings {
    /// Assemble the full configuration from the process environment.
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                host: env_string("HOST", defaults::HOST),
                port: env_parse("PORT", defaults::PORT),
                tls_cert_file: env_string("TLS_CERT_FILE", ""),
                tls_key_file: env_string("TLS_KEY_FILE", ""),
                access_log: env_string("ACCESS_LOG", ""),
            },
            upstream: UpstreamConfig {
                hosts: env_csv("UPSTREAM_HOSTS"),
                timeout_ms: env_parse_min("UPSTREAM_TIMEOUT_MS", defaults::UPSTREAM_TIMEOUT_MS, 1_000),
                static_headers: env_kv_csv("UPSTREAM_STATIC_HEADERS"),
            },
            discovery: DiscoveryConfig {
                enabled: env_bool("AUTO_DISCOVER", defaults::AUTO_DISCOVER),
                interval_ms: env_parse_min(
                    "AUTO_DISCOVER_INTERVAL",
                    defaults::AUTO_DISCOVER_INTERVAL_MS,
                    5_000,
                ),
                network: env_string("DISCOVER_NETWORK", defaults::DISCOVER_NETWORK),
                self_name: env_string("SELF_CONTAINER_NAME", defaults::SELF_CONTAINER_NAME),
            },
            rate_limit: RateLimitConfig {
                enabled: env_bool("RATE_LIMIT_ENABLED", true),
                window_ms: env_parse_min("RATE_LIMIT_WINDOW_MS", defaults::RATE_LIMIT_WINDOW_MS, 1_000),
                max_requests: env_parse_min(
                    "RATE_LIMIT_MAX_REQUESTS",
                    defaults::RATE_LIMIT_MAX_REQUESTS,
                    1,
                ),
                block_duration_ms: env_parse_min(
                    "RATE_LIMIT_BLOCK_DURATION_MS",
                    defaults::RATE_LIMIT_BLOCK_DURATION_MS,
                    1_000,
                ),
                cleanup_interval_ms: env_parse_min(
                    "RATE_LIMIT_CLEANUP_INTERVAL_MS",
                    defaults::RATE_LIMIT_CLEANUP_INTERVAL_MS,
                    1_000,
                ),
                skip_paths: env_csv("RATE_LIMIT_SKIP_PATHS"),
            },
            bot_detection: BotDetectionConfig {
                enabled: env_bool("BOT_DETECTION_ENABLED", true),
                score_threshold: env_parse_capped("BOT_SCORE_THRESHOLD", defaults::BOT_SCORE_THRESHOLD),
                allow_good_bots: env_bool("BOT_ALLOW_GOOD_BOTS", true),
            },
            ip_reputation: IpReputationConfig {
                enabled: env_bool("IP_REPUTATION_ENABLED", true),
                api_key: env_string("IP_REPUTATION_API_KEY", ""),
                block_threshold: env_parse_capped(
                    "IP_REPUTATION_BLOCK_THRESHOLD",
                    defaults::IP_REPUTATION_BLOCK_THRESHOLD,
                ),
                warn_threshold: env_parse_capped(
                    "IP_REPUTATION_WARN_THRESHOLD",
                    defaults::IP_REPUTATION_WARN_THRESHOLD,
                ),
                check_mode: env_check_mode("IP_REPUTATION_CHECK_MODE"),
                cache_ttl_ms: env_parse_min(
                    "IP_REPUTATION_CACHE_TTL",
                    defaults::IP_REPUTATION_CACHE_TTL_MS,
                    60_000,
                ),
                daily_limit: env_parse_min(
                    "IP_REPUTATION_DAILY_LIMIT",
                    defaults::IP_REPUTATION_DAILY_LIMIT,
                    1,
                ),
                cache_file: env_string("IP_REPUTATION_CACHE_FILE", defaults::IP_REPUTATION_CACHE_FILE),
            },
            stealth_mode: env_bool("STEALTH_MODE", true),
            trust_proxy: env_bool("TRUST_PROXY", true),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: defaults::HOST.to_string(),
                port: defaults::PORT,
                tls_cert_file: String::new(),
                tls_key_file: String::new(),
                access_log: String::new(),
            },
            upstream: UpstreamConfig {
                hosts: Vec::new(),
                timeout_ms: defaults::UPSTREAM_TIMEOUT_MS,
                static_headers: Vec::new(),
            },
            discovery: DiscoveryConfig {
                enabled: defaults::AUTO_DISCOVER,
                interval_ms: defaults::AUTO_DISCOVER_INTERVAL_MS,
                network: defaults::DISCOVER_NETWORK.to_string(),
                self_name: defaults::SELF_CONTAINER_NAME.to_string(),
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                window_ms: defaults::RATE_LIMIT_WINDOW_MS,
                max_requests: defaults::RATE_LIMIT_MAX_REQUESTS,
                block_duration_ms: defaults::RATE_LIMIT_BLOCK_DURATION_MS,
                cleanup_interval_ms: defaults::RATE_LIMIT_CLEANUP_INTERVAL_MS,
                skip_paths: Vec::new(),
            },
            bot_detection: BotDetectionConfig {
                enabled: true,
                score_threshold: defaults::BOT_SCORE_THRESHOLD,
                allow_good_bots: true,
            },
            ip_reputation: IpReputationConfig {
                enabled: true,
                api_key: String::new(),
                block_threshold: defaults::IP_REPUTATION_BLOCK_THRESHOLD,
                warn_threshold: defaults::IP_REPUTATION_WARN_THRESHOLD,
                check_mode: CheckMode::Async,
                cache_ttl_ms: defaults::IP_REPUTATION_CACHE_TTL_MS,
                daily_limit: defaults::IP_REPUTATION_DAILY_LIMIT,
                cache_file: defaults::IP_REPUTATION_CACHE_FILE.to_string(),
            },
            stealth_mode: true,
            trust_proxy: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment parsing helpers
// ---------------------------------------------------------------------------

fn env_string(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_csv(name: &str) -> Vec<String> {
    match env::var(name) {
        Ok(v) => v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Parse `name=value` CSV pairs; entries without a name are dropped with a
/// warning.
fn env_kv_csv(name: &str) -> Vec<(String, String)> {
    env_csv(name)
        .into_iter()
        .filter_map(|entry| match entry.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Some((key.trim().to_string(), value.trim().to_string()))
            }
            _ => {
                warn!(var = name, entry = %entry, "Ignoring malformed header pair");
                None
            }
        })
        .collect()
}

fn env_bool(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            other => {
                warn!(var = name, value = other, "Unrecognised boolean, using default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or_else(|_| {
            warn!(var = name, value = %v, "Unparseable value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_parse_min<T>(name: &str, default: T, min: T) -> T
where
    T: std::str::FromStr + Copy + PartialOrd,
{
    let value = env_parse(name, default);
    if value < min {
        warn!(var = name, "Value below minimum, clamping");
        min
    } else {
        value
    }
}

/// Parse a 0-100 score, clamping overshoot down to 100.
fn env_parse_capped(name: &str, default: u8) -> u8 {
    let value: u16 = env_parse(name, default as u16);
    value.min(100) as u8
}

fn env_check_mode(name: &str) -> CheckMode {
    match env::var(name) {
        Ok(v) => match v.trim().to_lowercase().as_str() {
            "sync" => CheckMode::Sync,
            "async" => CheckMode::Async,
            other => {
                warn!(var = name, value = other, "Unknown check mode, using async");
                CheckMode::Async
            }
        },
        Err(_) => CheckMode::Async,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.rate_limit.window_ms, 60_000);
        assert_eq!(settings.rate_limit.max_requests, 100);
        assert_eq!(settings.rate_limit.block_duration_ms, 300_000);
        assert_eq!(settings.bot_detection.score_threshold, 70);
        assert_eq!(settings.ip_reputation.block_threshold, 80);
        assert_eq!(settings.ip_reputation.warn_threshold, 50);
        assert_eq!(settings.ip_reputation.cache_ttl_ms, 3_600_000);
        assert_eq!(settings.ip_reputation.check_mode, CheckMode::Async);
        assert!(settings.discovery.enabled);
        assert!(settings.trust_proxy);
        assert!(settings.stealth_mode);
    }

    #[test]
    fn static_header_pairs_parse_from_csv() {
        std::env::set_var(
            "RAMPART_TEST_STATIC_HEADERS",
            "x-env=prod, x-tenant=alpha ,broken,=novalue",
        );
        let pairs = env_kv_csv("RAMPART_TEST_STATIC_HEADERS");
        std::env::remove_var("RAMPART_TEST_STATIC_HEADERS");
        assert_eq!(
            pairs,
            vec![
                ("x-env".to_string(), "prod".to_string()),
                ("x-tenant".to_string(), "alpha".to_string()),
            ]
        );
    }

    #[test]
    fn tls_requires_both_paths() {
        let mut server = Settings::default().server;
        assert!(!server.tls_enabled());
        server.tls_cert_file = "/certs/fullchain.pem".into();
        assert!(!server.tls_enabled());
        server.tls_key_file = "/certs/privkey.pem".into();
        assert!(server.tls_enabled());
    }
}
