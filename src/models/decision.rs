use std::fmt;
use std::time::Duration;

use serde::Serialize;

// ---------------------------------------------------------------------------
// Rate limiter decisions
// ---------------------------------------------------------------------------

/// Why the rate-limit coordinator reached its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitReason {
    /// Within the sliding window.
    Ok,
    /// Key is serving an active block timer.
    Blocked,
    /// This request overflowed the window and triggered the block.
    RateLimitExceeded,
    /// Allow-list membership short-circuited admission.
    Whitelisted,
    /// Deny-list membership short-circuited refusal.
    Blacklisted,
    /// Path prefix bypassed the tracker.
    Skipped,
    /// The coordinator is disabled.
    Disabled,
}

impl fmt::Display for LimitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LimitReason::Ok => "ok",
            LimitReason::Blocked => "blocked",
            LimitReason::RateLimitExceeded => "rate_limit_exceeded",
            LimitReason::Whitelisted => "whitelisted",
            LimitReason::Blacklisted => "blacklisted",
            LimitReason::Skipped => "skipped",
            LimitReason::Disabled => "disabled",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub blocked: bool,
    /// Requests left in the window. `None` means unlimited (allow-listed,
    /// skipped or disabled).
    pub remaining: Option<usize>,
    /// Time until the window resets, or until the block lifts.
    pub reset: Duration,
    pub reason: LimitReason,
}

impl RateDecision {
    pub fn allow(remaining: usize, reset: Duration) -> Self {
        Self {
            allowed: true,
            blocked: false,
            remaining: Some(remaining),
            reset,
            reason: LimitReason::Ok,
        }
    }

    pub fn bypass(reason: LimitReason) -> Self {
        Self {
            allowed: true,
            blocked: false,
            remaining: None,
            reset: Duration::ZERO,
            reason,
        }
    }

    pub fn refuse(reason: LimitReason, reset: Duration) -> Self {
        Self {
            allowed: false,
            blocked: true,
            remaining: Some(0),
            reset,
            reason,
        }
    }

    /// Seconds until retry, rounded up for the Retry-After header.
    pub fn retry_after_secs(&self) -> u64 {
        let millis = self.reset.as_millis() as u64;
        millis.div_ceil(1_000)
    }
}

// ---------------------------------------------------------------------------
// Bot scorer verdicts
// ---------------------------------------------------------------------------

/// Outcome of scoring one request.
#[derive(Debug, Clone, Serialize)]
pub struct BotVerdict {
    pub is_bot: bool,
    /// Accumulated signal score, clamped to 100.
    pub score: u8,
    /// `signal:detail` tags for every triggered signal.
    pub reasons: Vec<String>,
    pub allowed: bool,
}

impl BotVerdict {
    pub fn human() -> Self {
        Self {
            is_bot: false,
            score: 0,
            reasons: Vec::new(),
            allowed: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Reputation verdicts
// ---------------------------------------------------------------------------

/// Why the reputation engine reached its verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationReason {
    PrivateIp,
    Whitelisted,
    NoApiKey,
    RateLimited,
    ApiError,
    Scored,
}

impl fmt::Display for ReputationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReputationReason::PrivateIp => "private_ip",
            ReputationReason::Whitelisted => "whitelisted",
            ReputationReason::NoApiKey => "no_api_key",
            ReputationReason::RateLimited => "rate_limited",
            ReputationReason::ApiError => "api_error",
            ReputationReason::Scored => "scored",
        };
        write!(f, "{}", s)
    }
}

/// Verdict produced for one IP.
#[derive(Debug, Clone, Serialize)]
pub struct ReputationVerdict {
    pub blocked: bool,
    pub score: u8,
    pub reason: ReputationReason,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reports: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub isp: Option<String>,
}

impl ReputationVerdict {
    /// Fail-open verdict carrying only a reason.
    pub fn pass(reason: ReputationReason) -> Self {
        Self {
            blocked: false,
            score: 0,
            reason,
            cached: false,
            reports: None,
            categories: None,
            country: None,
            isp: None,
        }
    }
}
