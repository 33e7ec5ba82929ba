//! Default values for every configurable knob. Each constant pairs with an
//! environment variable read in `settings.rs`.

pub const HOST: &str = "0.0.0.0";
pub const PORT: u16 = 3000;

pub const UPSTREAM_TIMEOUT_MS: u64 = 30_000;

pub const AUTO_DISCOVER: bool = true;
pub const AUTO_DISCOVER_INTERVAL_MS: u64 = 30_000;
pub const DISCOVER_NETWORK: &str = "rampart";
pub const SELF_CONTAINER_NAME: &str = "rampart";

pub const RATE_LIMIT_WINDOW_MS: u64 = 60_000;
pub const RATE_LIMIT_MAX_REQUESTS: usize = 100;
pub const RATE_LIMIT_BLOCK_DURATION_MS: u64 = 300_000;
pub const RATE_LIMIT_CLEANUP_INTERVAL_MS: u64 = 60_000;

pub const BOT_SCORE_THRESHOLD: u8 = 70;

pub const IP_REPUTATION_BLOCK_THRESHOLD: u8 = 80;
pub const IP_REPUTATION_WARN_THRESHOLD: u8 = 50;
pub const IP_REPUTATION_CACHE_TTL_MS: u64 = 3_600_000;
pub const IP_REPUTATION_DAILY_LIMIT: u32 = 1_000;
pub const IP_REPUTATION_CACHE_FILE: &str = "data/reputation.json";
