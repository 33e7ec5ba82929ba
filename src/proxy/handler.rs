use std::collections::HashMap;
use std::net::IpAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode};
use tracing::{debug, error, warn};

use crate::admin;
use crate::analytics::collector::MetricsCollector;
use crate::config::settings::{CheckMode, Settings};
use crate::models::decision::{LimitReason, RateDecision};
use crate::models::request::RequestContext;
use crate::protection::bot_scorer::BotScorer;
use crate::protection::ip_reputation::IpReputationManager;
use crate::protection::rate_limiter::RateLimiter;

use super::access_log::AccessLogger;
use super::discovery::DockerDiscovery;
use super::forwarder::UpstreamForwarder;
use super::health_check::HealthChecker;
use super::{full_body, ProxyBody};

/// Core request handler wiring the admission pipeline:
///
/// request-ID stamp → security headers → bot scorer → rate limiter →
/// reputation check → access log → built-in routes | upstream forwarder.
///
/// Built-in routes bypass the three policy stages but still get the
/// request-ID stamp and security headers.
pub struct GatewayHandler {
    pub settings: Arc<Settings>,
    pub rate_limiter: Arc<RateLimiter>,
    pub bot_scorer: Arc<BotScorer>,
    pub ip_reputation: Arc<IpReputationManager>,
    pub forwarder: Arc<UpstreamForwarder>,
    pub discovery: Arc<DockerDiscovery>,
    pub health: Arc<HealthChecker>,
    pub metrics: Arc<MetricsCollector>,
    pub access_log: Option<Arc<AccessLogger>>,
    pub start_time: Instant,
}

impl GatewayHandler {
    /// Entry point used by the connection service: never panics outward.
    pub async fn handle_safe(
        self: Arc<Self>,
        req: Request<Incoming>,
        peer: IpAddr,
        scheme: &'static str,
    ) -> Response<ProxyBody> {
        match AssertUnwindSafe(Arc::clone(&self).handle(req, peer, scheme))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(detail = %detail, "Pipeline stage panicked");
                let mut response = Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .header("content-type", "application/json")
                    .body(full_body(r#"{"error":"Internal Server Error"}"#))
                    .unwrap_or_else(|_| {
                        Response::new(full_body(r#"{"error":"Internal Server Error"}"#))
                    });
                apply_security_headers(response.headers_mut());
                response
            }
        }
    }

    async fn handle(
        self: Arc<Self>,
        mut req: Request<Incoming>,
        peer: IpAddr,
        scheme: &'static str,
    ) -> Response<ProxyBody> {
        let started = Instant::now();
        self.metrics.inc_requests();

        // ---- Stage 1: request-ID stamp --------------------------------
        let request_id = match req.headers().get("x-request-id").and_then(|v| v.to_str().ok()) {
            Some(existing) if !existing.is_empty() => existing.to_string(),
            _ => {
                let generated = format!("{:016x}", rand::random::<u64>());
                if let Ok(value) = HeaderValue::from_str(&generated) {
                    req.headers_mut()
                        .insert(HeaderName::from_static("x-request-id"), value);
                }
                generated
            }
        };

        let headers: HashMap<String, String> = req
            .headers()
            .iter()
            .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
            .collect();

        let ctx = RequestContext {
            client_key: self.rate_limiter.client_key(&headers, peer),
            peer_addr: peer,
            method: req.method().to_string(),
            path: req.uri().path().to_string(),
            host: headers.get("host").cloned().unwrap_or_default(),
            scheme,
            headers,
            request_id,
            received_at: started,
        };

        debug!(
            key = %ctx.masked_key(),
            method = %ctx.method,
            path = %ctx.path,
            rid = %ctx.request_id,
            "Incoming request"
        );

        // ---- Built-in routes bypass the policy stages -----------------
        let (mut response, outcome, decision) = if is_builtin_route(&ctx.path) {
            let response = admin::routes::handle(&self, req, &ctx).await;
            (response, "builtin", None)
        } else {
            self.run_policy_pipeline(req, &ctx).await
        };

        // ---- Response finalisation ------------------------------------
        apply_security_headers(response.headers_mut());
        if self.settings.stealth_mode {
            response.headers_mut().remove("server");
            response.headers_mut().remove("x-powered-by");
        } else {
            if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static("x-request-id"), value);
            }
            if let Some(decision) = &decision {
                self.apply_rate_limit_headers(response.headers_mut(), decision);
            }
        }

        // ---- Stage 6: access log --------------------------------------
        if let Some(logger) = &self.access_log {
            logger.log(
                &ctx,
                response.status().as_u16(),
                outcome,
                started.elapsed().as_micros() as u64,
            );
        }

        response
    }

    /// Stages 3-5 followed by the upstream forward.
    async fn run_policy_pipeline(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> (Response<ProxyBody>, &'static str, Option<RateDecision>) {
        let now = ctx.received_at;

        // ---- Stage 3: bot scorer --------------------------------------
        if self.settings.bot_detection.enabled {
            let verdict = self.bot_scorer.score(ctx, now);
            if verdict.is_bot {
                let good_bot = self.settings.bot_detection.allow_good_bots
                    && BotScorer::is_known_good_bot(ctx.user_agent());
                if good_bot {
                    debug!(
                        key = %ctx.masked_key(),
                        score = verdict.score,
                        "Reputable crawler passed despite bot score"
                    );
                } else {
                    warn!(
                        key = %ctx.masked_key(),
                        score = verdict.score,
                        reasons = ?verdict.reasons,
                        "Request blocked by bot scorer"
                    );
                    self.metrics.inc_blocked_bot();
                    return (self.forbidden("Automated traffic not allowed"), "bot", None);
                }
            }
        }

        // ---- Stage 4: rate limiter ------------------------------------
        let decision = self.rate_limiter.check(ctx, now);
        if !decision.allowed {
            return match decision.reason {
                LimitReason::Blacklisted => {
                    warn!(key = %ctx.masked_key(), "Request blocked by deny list");
                    self.metrics.inc_blocked_rate_limit();
                    (self.forbidden("Access denied"), "blacklist", Some(decision))
                }
                _ => {
                    warn!(
                        key = %ctx.masked_key(),
                        reason = %decision.reason,
                        retry_after = decision.retry_after_secs(),
                        "Request rate limited"
                    );
                    self.metrics.inc_blocked_rate_limit();
                    (too_many_requests(&decision), "rate_limit", Some(decision))
                }
            };
        }

        // ---- Stage 5: reputation check --------------------------------
        if self.settings.ip_reputation.enabled {
            let verdict = match self.settings.ip_reputation.check_mode {
                CheckMode::Sync => Some(self.ip_reputation.check(&ctx.client_key).await),
                CheckMode::Async => {
                    let cached = self.ip_reputation.check_cached(&ctx.client_key);
                    if cached.is_none() {
                        // Warm the cache without holding this request up.
                        let engine = Arc::clone(&self.ip_reputation);
                        let key = ctx.client_key.clone();
                        tokio::spawn(async move {
                            let _ = engine.check(&key).await;
                        });
                    }
                    cached
                }
            };

            if let Some(verdict) = verdict {
                if verdict.blocked {
                    warn!(
                        key = %ctx.masked_key(),
                        score = verdict.score,
                        cached = verdict.cached,
                        "Request blocked by IP reputation"
                    );
                    self.metrics.inc_blocked_reputation();
                    return (
                        self.forbidden("Source address has a poor reputation"),
                        "reputation",
                        Some(decision),
                    );
                }
            }
        }

        // ---- Stage 8: upstream forwarder ------------------------------
        match self.forwarder.forward(req, ctx).await {
            Ok(response) => {
                self.metrics.inc_forwarded();
                (response, "forwarded", Some(decision))
            }
            Err(err) => {
                self.metrics.inc_upstream_errors();
                (err.into_response(), "upstream_error", Some(decision))
            }
        }
    }

    /// 403 with a minimal body in stealth mode.
    fn forbidden(&self, message: &str) -> Response<ProxyBody> {
        let body = if self.settings.stealth_mode {
            r#"{"error":"Forbidden"}"#.to_string()
        } else {
            format!(r#"{{"error":"Forbidden","message":"{}"}}"#, message)
        };
        Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header("content-type", "application/json")
            .body(full_body(body.clone()))
            .unwrap_or_else(|_| Response::new(full_body(body)))
    }

    fn apply_rate_limit_headers(&self, headers: &mut HeaderMap, decision: &RateDecision) {
        let limit = self.rate_limiter.tracker().max_requests();
        let insert = |headers: &mut HeaderMap, name: &'static str, value: String| {
            if let Ok(v) = HeaderValue::from_str(&value) {
                headers.insert(HeaderName::from_static(name), v);
            }
        };
        insert(headers, "x-ratelimit-limit", limit.to_string());
        if let Some(remaining) = decision.remaining {
            insert(headers, "x-ratelimit-remaining", remaining.to_string());
        }
        insert(
            headers,
            "x-ratelimit-reset",
            decision.reset.as_secs().to_string(),
        );
    }
}

/// 429 with the retry hint both as header and body field.
fn too_many_requests(decision: &RateDecision) -> Response<ProxyBody> {
    let retry_after = decision.retry_after_secs();
    let body = format!(
        r#"{{"error":"Too Many Requests","retryAfter":{}}}"#,
        retry_after
    );
    Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("content-type", "application/json")
        .header("retry-after", retry_after.to_string())
        .body(full_body(body.clone()))
        .unwrap_or_else(|_| Response::new(full_body(body)))
}

fn is_builtin_route(path: &str) -> bool {
    path == "/health" || path == "/ready" || path == "/metrics" || path.starts_with("/api/")
}

/// Baseline hardening headers present on every response.
pub fn apply_security_headers(headers: &mut HeaderMap) {
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-xss-protection"),
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn builtin_routes_are_detected() {
        assert!(is_builtin_route("/health"));
        assert!(is_builtin_route("/ready"));
        assert!(is_builtin_route("/metrics"));
        assert!(is_builtin_route("/api/whitelist"));
        assert!(!is_builtin_route("/healthz"));
        assert!(!is_builtin_route("/app"));
        assert!(!is_builtin_route("/"));
    }

    #[test]
    fn security_headers_are_complete() {
        let mut headers = HeaderMap::new();
        apply_security_headers(&mut headers);
        assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
        assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
        assert_eq!(headers.get("x-xss-protection").unwrap(), "1; mode=block");
        assert_eq!(
            headers.get("referrer-policy").unwrap(),
            "strict-origin-when-cross-origin"
        );
    }

    #[test]
    fn rate_limited_response_carries_retry_hint() {
        let decision = RateDecision::refuse(LimitReason::RateLimitExceeded, Duration::from_secs(2));
        let response = too_many_requests(&decision);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "2");
    }
}
