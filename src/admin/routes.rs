use std::time::Instant;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::models::request::RequestContext;
use crate::proxy::handler::GatewayHandler;
use crate::proxy::{full_body, ProxyBody};

const API_ENDPOINTS: &[&str] = &[
    "GET /api/whitelist",
    "POST /api/whitelist",
    "DELETE /api/whitelist",
    "GET /api/blacklist",
    "POST /api/blacklist",
    "DELETE /api/blacklist",
    "POST /api/block",
    "POST /api/unblock",
    "GET /api/blocked",
    "GET /api/config",
    "GET /api/stats",
    "GET /api/ssl",
];

#[derive(Debug, Deserialize)]
struct IpBody {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct BlockBody {
    ip: String,
    #[serde(rename = "durationMs")]
    duration_ms: Option<u64>,
    reason: Option<String>,
}

/// Dispatch a built-in route. The caller has already stamped the request ID;
/// security headers are applied on the way out.
pub async fn handle(
    handler: &GatewayHandler,
    req: Request<Incoming>,
    ctx: &RequestContext,
) -> Response<ProxyBody> {
    match (ctx.method.as_str(), ctx.path.as_str()) {
        ("GET", "/health") => get_health(),
        ("GET", "/ready") => get_ready(handler),
        ("GET", "/metrics") => get_metrics(handler),

        ("GET", "/api/whitelist") => list_whitelist(handler),
        ("POST", "/api/whitelist") => with_valid_ip(req, |ip| add_whitelist(handler, &ip)).await,
        ("DELETE", "/api/whitelist") => {
            with_valid_ip(req, |ip| remove_whitelist(handler, &ip)).await
        }

        ("GET", "/api/blacklist") => list_blacklist(handler),
        ("POST", "/api/blacklist") => with_valid_ip(req, |ip| add_blacklist(handler, &ip)).await,
        ("DELETE", "/api/blacklist") => {
            with_valid_ip(req, |ip| remove_blacklist(handler, &ip)).await
        }

        ("POST", "/api/block") => post_block(handler, req).await,
        ("POST", "/api/unblock") => with_valid_ip(req, |ip| post_unblock(handler, &ip)).await,
        ("GET", "/api/blocked") => get_blocked(handler),
        ("GET", "/api/config") => get_config(handler),
        ("GET", "/api/stats") => get_metrics(handler),
        ("GET", "/api/ssl") => get_ssl(handler),

        (_, path) if path.starts_with("/api/") => not_found(),
        _ => not_found(),
    }
}

// ---------------------------------------------------------------------------
// Health / readiness / metrics
// ---------------------------------------------------------------------------

fn get_health() -> Response<ProxyBody> {
    json_response(
        StatusCode::OK,
        &json!({
            "status": "ok",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }),
    )
}

fn get_ready(handler: &GatewayHandler) -> Response<ProxyBody> {
    let upstreams = handler.forwarder.target_count();
    let ready = upstreams > 0;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &json!({ "ready": ready, "upstreams": upstreams }))
}

fn get_metrics(handler: &GatewayHandler) -> Response<ProxyBody> {
    let snapshot = handler.metrics.snapshot();
    json_response(
        StatusCode::OK,
        &json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_secs": handler.start_time.elapsed().as_secs(),
            "process": snapshot,
            "rate_limiter": handler.rate_limiter.stats(),
            "bot_scorer": handler.bot_scorer.stats(),
            "ip_reputation": handler.ip_reputation.stats(),
            "upstreams": handler.forwarder.stats(),
            "upstream_health": handler.health.snapshot(),
            "discovery": handler.discovery.stats(),
        }),
    )
}

// ---------------------------------------------------------------------------
// Allow / deny lists
// ---------------------------------------------------------------------------

fn list_whitelist(handler: &GatewayHandler) -> Response<ProxyBody> {
    let entries = handler.rate_limiter.whitelist_entries();
    let count = entries.len();
    json_response(
        StatusCode::OK,
        &json!({ "whitelist": entries, "count": count }),
    )
}

fn add_whitelist(handler: &GatewayHandler, ip: &str) -> Response<ProxyBody> {
    let added = handler.rate_limiter.add_to_whitelist(ip);
    // The reputation engine keeps its own allow-list in step so a trusted
    // IP is never refused by a stale provider verdict.
    handler.ip_reputation.add_to_whitelist(ip);
    info!(ip = %ip, added, "Whitelist updated");
    json_response(StatusCode::OK, &json!({ "ip": ip, "added": added }))
}

fn remove_whitelist(handler: &GatewayHandler, ip: &str) -> Response<ProxyBody> {
    let removed = handler.rate_limiter.remove_from_whitelist(ip);
    handler.ip_reputation.remove_from_whitelist(ip);
    info!(ip = %ip, removed, "Whitelist entry removed");
    json_response(StatusCode::OK, &json!({ "ip": ip, "removed": removed }))
}

fn list_blacklist(handler: &GatewayHandler) -> Response<ProxyBody> {
    let entries = handler.rate_limiter.blacklist_entries();
    let count = entries.len();
    json_response(
        StatusCode::OK,
        &json!({ "blacklist": entries, "count": count }),
    )
}

fn add_blacklist(handler: &GatewayHandler, ip: &str) -> Response<ProxyBody> {
    let added = handler.rate_limiter.add_to_blacklist(ip);
    info!(ip = %ip, added, "Blacklist updated");
    json_response(StatusCode::OK, &json!({ "ip": ip, "added": added }))
}

fn remove_blacklist(handler: &GatewayHandler, ip: &str) -> Response<ProxyBody> {
    let removed = handler.rate_limiter.remove_from_blacklist(ip);
    info!(ip = %ip, removed, "Blacklist entry removed");
    json_response(StatusCode::OK, &json!({ "ip": ip, "removed": removed }))
}

// ---------------------------------------------------------------------------
// Manual block / unblock
// ---------------------------------------------------------------------------

async fn post_block(handler: &GatewayHandler, req: Request<Incoming>) -> Response<ProxyBody> {
    let body: BlockBody = match read_json(req).await {
        Ok(b) => b,
        Err(response) => return response,
    };
    if !is_valid_ip_input(&body.ip) {
        return bad_request("Invalid IP address");
    }

    let duration = body
        .duration_ms
        .map(std::time::Duration::from_millis)
        .unwrap_or_else(|| handler.settings.rate_limit.block_duration());
    handler
        .rate_limiter
        .tracker()
        .block(&body.ip, duration, body.reason.as_deref().unwrap_or("manual"));

    info!(
        ip = %body.ip,
        duration_ms = duration.as_millis() as u64,
        reason = body.reason.as_deref().unwrap_or("manual"),
        "Manual block applied"
    );
    json_response(
        StatusCode::OK,
        &json!({
            "ip": body.ip,
            "blocked": true,
            "durationMs": duration.as_millis() as u64,
        }),
    )
}

fn post_unblock(handler: &GatewayHandler, ip: &str) -> Response<ProxyBody> {
    handler.rate_limiter.tracker().unblock(ip);
    info!(ip = %ip, "Manual unblock applied");
    json_response(StatusCode::OK, &json!({ "ip": ip, "blocked": false }))
}

fn get_blocked(handler: &GatewayHandler) -> Response<ProxyBody> {
    let blocked: Vec<Value> = handler
        .rate_limiter
        .tracker()
        .blocked_keys(Instant::now())
        .into_iter()
        .map(|(key, remaining_secs)| json!({ "ip": key, "remainingSecs": remaining_secs }))
        .collect();
    let count = blocked.len();
    json_response(StatusCode::OK, &json!({ "blocked": blocked, "count": count }))
}

// ---------------------------------------------------------------------------
// Config / TLS status
// ---------------------------------------------------------------------------

fn get_config(handler: &GatewayHandler) -> Response<ProxyBody> {
    // Settings serialisation already skips the provider API key.
    json_response(StatusCode::OK, &json!({ "config": &*handler.settings }))
}

fn get_ssl(handler: &GatewayHandler) -> Response<ProxyBody> {
    let server = &handler.settings.server;
    json_response(
        StatusCode::OK,
        &json!({
            "enabled": server.tls_enabled(),
            "certFile": server.tls_cert_file,
        }),
    )
}

// ---------------------------------------------------------------------------
// Plumbing
// ---------------------------------------------------------------------------

/// Collect the body, extract and validate the `ip` field, then run `op`.
async fn with_valid_ip<F>(req: Request<Incoming>, op: F) -> Response<ProxyBody>
where
    F: FnOnce(String) -> Response<ProxyBody>,
{
    let body: IpBody = match read_json(req).await {
        Ok(b) => b,
        Err(response) => return response,
    };
    if !is_valid_ip_input(&body.ip) {
        warn!(input = %body.ip, "Rejected malformed IP input");
        return bad_request("Invalid IP address");
    }
    op(body.ip)
}

async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<T, Response<ProxyBody>> {
    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Err(bad_request("Unreadable request body")),
    };
    serde_json::from_slice(&bytes).map_err(|_| bad_request("Expected JSON body with an \"ip\" field"))
}

/// IPv4 dotted quad with each octet 0-255, or simplified IPv6: between 2 and
/// 7 colons with hex groups of length 0-4.
pub fn is_valid_ip_input(input: &str) -> bool {
    if input.is_empty() {
        return false;
    }

    if input.contains(':') {
        let colons = input.chars().filter(|c| *c == ':').count();
        if !(2..=7).contains(&colons) {
            return false;
        }
        return input
            .split(':')
            .all(|group| group.len() <= 4 && group.chars().all(|c| c.is_ascii_hexdigit()));
    }

    let octets: Vec<&str> = input.split('.').collect();
    if octets.len() != 4 {
        return false;
    }
    octets
        .iter()
        .all(|octet| !octet.is_empty() && octet.parse::<u16>().is_ok_and(|v| v <= 255))
}

fn json_response(status: StatusCode, body: &Value) -> Response<ProxyBody> {
    let serialized = body.to_string();
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(serialized.clone()))
        .unwrap_or_else(|_| Response::new(full_body(serialized)))
}

fn bad_request(message: &str) -> Response<ProxyBody> {
    json_response(
        StatusCode::BAD_REQUEST,
        &json!({ "error": "Bad Request", "message": message }),
    )
}

fn not_found() -> Response<ProxyBody> {
    json_response(
        StatusCode::NOT_FOUND,
        &json!({ "error": "Not Found", "availableEndpoints": API_ENDPOINTS }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dotted_quads() {
        assert!(is_valid_ip_input("1.2.3.4"));
        assert!(is_valid_ip_input("255.255.255.255"));
        assert!(is_valid_ip_input("0.0.0.0"));
    }

    #[test]
    fn rejects_bad_ipv4() {
        assert!(!is_valid_ip_input("256.1.1.1"));
        assert!(!is_valid_ip_input("1.2.3"));
        assert!(!is_valid_ip_input("1.2.3.4.5"));
        assert!(!is_valid_ip_input("1.2.3."));
        assert!(!is_valid_ip_input("a.b.c.d"));
        assert!(!is_valid_ip_input(""));
    }

    #[test]
    fn accepts_simplified_ipv6() {
        assert!(is_valid_ip_input("2001:db8::1"));
        assert!(is_valid_ip_input("::1"));
        assert!(is_valid_ip_input("fe80:0:0:0:0:0:0:1"));
    }

    #[test]
    fn rejects_bad_ipv6() {
        assert!(!is_valid_ip_input("2001"));          // no colons
        assert!(!is_valid_ip_input("a:b"));            // one colon
        assert!(!is_valid_ip_input("1:2:3:4:5:6:7:8:9")); // eight colons
        assert!(!is_valid_ip_input("2001:db8::zzzz"));
        assert!(!is_valid_ip_input("2001:db8::12345"));
    }
}
