use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::models::request::RequestContext;

use super::{full_body, ProxyBody};

/// Connection-severing headers that must not cross the proxy boundary.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// One parsed upstream URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub original: String,
}

impl UpstreamTarget {
    /// Parse an upstream URL; scheme defaults to http, port to the scheme
    /// default.
    pub fn parse(url: &str) -> Option<Self> {
        let normalized = if url.contains("://") {
            url.to_string()
        } else {
            format!("http://{}", url)
        };
        let uri: Uri = normalized.parse().ok()?;
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let host = uri.host()?.to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });
        Some(Self {
            scheme,
            host,
            port,
            original: url.to_string(),
        })
    }

    /// `host` or `host:port` for the upstream Host header; the port is
    /// elided when it is the scheme default.
    pub fn host_header(&self) -> String {
        let default_port = if self.scheme == "https" { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Ordered target list plus the round-robin cursor. Pick-and-advance happens
/// under one short lock so readers never observe a torn pool/cursor pair.
struct TargetPool {
    targets: Vec<UpstreamTarget>,
    cursor: usize,
}

/// Snapshot for `/metrics` and `/ready`.
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStats {
    pub upstream_count: usize,
    pub upstreams: Vec<String>,
}

// ---------------------------------------------------------------------------
// Forwarder
// ---------------------------------------------------------------------------

/// Streams admitted requests to the next upstream in round-robin order,
/// rewriting headers on both legs and mapping failures to gateway responses.
pub struct UpstreamForwarder {
    pool: Mutex<TargetPool>,
    client: HyperClient<HttpConnector, ProxyBody>,
    timeout: Duration,
    stealth: bool,
    /// Parsed once at startup; applied last so they override inbound values.
    static_headers: Vec<(HeaderName, HeaderValue)>,
}

impl UpstreamForwarder {
    pub fn new(
        initial_targets: &[String],
        timeout: Duration,
        stealth: bool,
        static_headers: &[(String, String)],
    ) -> Self {
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(128)
            .build_http();

        let static_headers = static_headers
            .iter()
            .filter_map(|(name, value)| {
                match (name.parse::<HeaderName>(), HeaderValue::from_str(value)) {
                    (Ok(parsed_name), Ok(parsed_value)) => Some((parsed_name, parsed_value)),
                    _ => {
                        warn!(header = %name, "Ignoring invalid static upstream header");
                        None
                    }
                }
            })
            .collect();

        let forwarder = Self {
            pool: Mutex::new(TargetPool {
                targets: Vec::new(),
                cursor: 0,
            }),
            client,
            timeout,
            stealth,
            static_headers,
        };
        forwarder.update_targets(initial_targets);
        forwarder
    }

    /// Atomically replace the pool and reset the cursor.
    pub fn update_targets(&self, urls: &[String]) {
        let targets: Vec<UpstreamTarget> = urls
            .iter()
            .filter_map(|url| match UpstreamTarget::parse(url) {
                Some(target) => Some(target),
                None => {
                    warn!(url = %url, "Ignoring unparseable upstream URL");
                    None
                }
            })
            .collect();

        let mut pool = self.pool.lock();
        pool.targets = targets;
        pool.cursor = 0;
    }

    pub fn target_count(&self) -> usize {
        self.pool.lock().targets.len()
    }

    pub fn stats(&self) -> ForwarderStats {
        let pool = self.pool.lock();
        ForwarderStats {
            upstream_count: pool.targets.len(),
            upstreams: pool.targets.iter().map(|t| t.original.clone()).collect(),
        }
    }

    /// Pick the next target and advance the cursor.
    fn next_target(&self) -> Option<UpstreamTarget> {
        let mut pool = self.pool.lock();
        if pool.targets.is_empty() {
            return None;
        }
        let target = pool.targets[pool.cursor % pool.targets.len()].clone();
        pool.cursor = (pool.cursor + 1) % pool.targets.len();
        Some(target)
    }

    /// Forward one admitted request, streaming both bodies.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        ctx: &RequestContext,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        let target = match self.next_target() {
            Some(t) => t,
            None => {
                warn!(key = %ctx.masked_key(), "No upstream configured");
                return Err(ForwardError::NoUpstream);
            }
        };

        let started = Instant::now();
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("{}://{}{}", target.scheme, target.authority(), path_and_query);

        let mut builder = Request::builder().method(parts.method.clone()).uri(&uri);

        // Inbound headers minus the hop-by-hop set; Host and the forwarding
        // headers are set explicitly below.
        for (name, value) in parts.headers.iter() {
            if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if matches!(
                name.as_str(),
                "x-forwarded-for" | "x-forwarded-proto" | "x-forwarded-host"
            ) {
                continue;
            }
            builder = builder.header(name, value);
        }

        builder = builder.header("host", target.host_header());
        // The chosen client key, not the inbound chain: an untrusted chain
        // must not be amplified downstream.
        builder = builder.header("x-forwarded-for", &ctx.client_key);
        builder = builder.header("x-forwarded-proto", ctx.scheme);
        if !ctx.host.is_empty() {
            builder = builder.header("x-forwarded-host", &ctx.host);
        }

        let mut upstream_req = match builder.body(body.boxed()) {
            Ok(r) => r,
            Err(err) => {
                error!(upstream = %target.original, error = %err, "Failed to build upstream request");
                return Err(ForwardError::Transport);
            }
        };
        self.apply_static_headers(upstream_req.headers_mut());

        let result = tokio::time::timeout(self.timeout, self.client.request(upstream_req)).await;

        let upstream_resp = match result {
            Ok(Ok(resp)) => resp,
            Ok(Err(err)) => {
                error!(
                    upstream = %target.original,
                    key = %ctx.masked_key(),
                    error = %err,
                    "Upstream connection failed"
                );
                return Err(ForwardError::Transport);
            }
            Err(_) => {
                // The in-flight request is dropped with the future.
                error!(
                    upstream = %target.original,
                    key = %ctx.masked_key(),
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Upstream deadline exceeded"
                );
                return Err(ForwardError::Timeout);
            }
        };

        debug!(
            upstream = %target.original,
            status = upstream_resp.status().as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Upstream response"
        );

        let mut response = upstream_resp.map(|b| b.boxed());
        self.rewrite_response_headers(&mut response, started.elapsed());
        Ok(response)
    }

    /// Configured headers win over anything the client sent.
    fn apply_static_headers(&self, headers: &mut HeaderMap) {
        for (name, value) in &self.static_headers {
            headers.insert(name.clone(), value.clone());
        }
    }

    /// Response-leg header hygiene: hop-by-hop strip plus fingerprint
    /// shaping.
    fn rewrite_response_headers(&self, response: &mut Response<ProxyBody>, elapsed: Duration) {
        let headers = response.headers_mut();
        for name in HOP_BY_HOP_HEADERS {
            if *name == "host" {
                continue;
            }
            headers.remove(*name);
        }

        if self.stealth {
            headers.remove("server");
            headers.remove("x-powered-by");
        } else {
            if let Ok(value) = HeaderValue::from_str(&format!("{}ms", elapsed.as_millis())) {
                headers.insert(HeaderName::from_static("x-response-time"), value);
            }
            headers.insert(
                HeaderName::from_static("x-proxied-by"),
                HeaderValue::from_static("rampart"),
            );
        }
    }

    /// Probe one target's `/health` endpoint; healthy on any 2xx/3xx.
    pub async fn probe(&self, target: &UpstreamTarget) -> bool {
        let uri = format!("{}://{}/health", target.scheme, target.authority());
        let req = match Request::builder()
            .method(hyper::Method::GET)
            .uri(&uri)
            .body(super::empty_body())
        {
            Ok(r) => r,
            Err(_) => return false,
        };

        match tokio::time::timeout(HEALTH_PROBE_TIMEOUT, self.client.request(req)).await {
            Ok(Ok(resp)) => {
                let code = resp.status().as_u16();
                (200..400).contains(&code)
            }
            _ => false,
        }
    }

    /// Probe every pooled target, returning (original URL, healthy).
    pub async fn probe_all(&self) -> Vec<(String, bool)> {
        let targets: Vec<UpstreamTarget> = {
            let pool = self.pool.lock();
            pool.targets.clone()
        };
        let mut results = Vec::with_capacity(targets.len());
        for target in &targets {
            let healthy = self.probe(target).await;
            results.push((target.original.clone(), healthy));
        }
        results
    }
}

// ---------------------------------------------------------------------------
// Failure classification
// ---------------------------------------------------------------------------

/// Why a forward produced no upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardError {
    /// The target pool is empty.
    NoUpstream,
    /// Connection or protocol failure before response headers arrived.
    Transport,
    /// The total forward deadline expired.
    Timeout,
}

impl ForwardError {
    /// The client-facing gateway response for this failure.
    pub fn into_response(self) -> Response<ProxyBody> {
        match self {
            ForwardError::NoUpstream => json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                r#"{"error":"Service Unavailable","message":"No upstream configured"}"#,
            ),
            ForwardError::Transport => json_response(
                StatusCode::BAD_GATEWAY,
                r#"{"error":"Bad Gateway","message":"Upstream connection failed"}"#,
            ),
            ForwardError::Timeout => json_response(
                StatusCode::GATEWAY_TIMEOUT,
                r#"{"error":"Gateway Timeout","message":"Upstream did not respond in time"}"#,
            ),
        }
    }
}

fn json_response(status: StatusCode, body: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap_or_else(|_| Response::new(full_body(body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_urls() {
        let t = UpstreamTarget::parse("http://app:3000").expect("parses");
        assert_eq!(t.scheme, "http");
        assert_eq!(t.host, "app");
        assert_eq!(t.port, 3000);
        assert_eq!(t.original, "http://app:3000");
    }

    #[test]
    fn defaults_scheme_and_port() {
        let t = UpstreamTarget::parse("backend.internal").expect("parses");
        assert_eq!(t.scheme, "http");
        assert_eq!(t.port, 80);

        let t = UpstreamTarget::parse("https://secure.internal").expect("parses");
        assert_eq!(t.port, 443);
    }

    #[test]
    fn host_header_elides_default_port() {
        let t = UpstreamTarget::parse("http://app").expect("parses");
        assert_eq!(t.host_header(), "app");
        let t = UpstreamTarget::parse("http://app:8080").expect("parses");
        assert_eq!(t.host_header(), "app:8080");
        let t = UpstreamTarget::parse("https://app:443").expect("parses");
        assert_eq!(t.host_header(), "app");
    }

    #[test]
    fn rejects_garbage_urls() {
        assert!(UpstreamTarget::parse("http://").is_none());
        assert!(UpstreamTarget::parse("").is_none());
    }

    #[tokio::test]
    async fn round_robin_cycles_in_order() {
        let f = UpstreamForwarder::new(
            &[
                "http://a:1".to_string(),
                "http://b:2".to_string(),
                "http://c:3".to_string(),
            ],
            Duration::from_secs(30),
            true,
            &[],
        );

        let picks: Vec<String> = (0..6)
            .filter_map(|_| f.next_target())
            .map(|t| t.host)
            .collect();
        assert_eq!(picks, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn update_targets_resets_cursor() {
        let f = UpstreamForwarder::new(
            &["http://a:1".to_string(), "http://b:2".to_string()],
            Duration::from_secs(30),
            true,
            &[],
        );
        let _ = f.next_target(); // cursor -> 1

        f.update_targets(&["http://x:1".to_string(), "http://y:2".to_string()]);
        let first = f.next_target().expect("non-empty pool");
        assert_eq!(first.host, "x");
        assert_eq!(f.target_count(), 2);
    }

    #[tokio::test]
    async fn empty_pool_yields_no_target() {
        let f = UpstreamForwarder::new(&[], Duration::from_secs(30), true, &[]);
        assert!(f.next_target().is_none());
        assert_eq!(f.target_count(), 0);
    }

    #[tokio::test]
    async fn invalid_urls_are_skipped() {
        let f = UpstreamForwarder::new(
            &["http://".to_string(), "http://ok:9000".to_string()],
            Duration::from_secs(30),
            true,
            &[],
        );
        assert_eq!(f.target_count(), 1);
    }

    fn upstream_response() -> Response<ProxyBody> {
        Response::builder()
            .header("connection", "keep-alive")
            .header("transfer-encoding", "chunked")
            .header("server", "nginx/1.25")
            .header("x-powered-by", "Express")
            .header("content-type", "text/plain")
            .body(full_body("ok"))
            .expect("static response builds")
    }

    #[tokio::test]
    async fn response_rewrite_strips_hop_by_hop() {
        let f = UpstreamForwarder::new(&[], Duration::from_secs(30), false, &[]);
        let mut resp = upstream_response();
        f.rewrite_response_headers(&mut resp, Duration::from_millis(5));

        assert!(resp.headers().get("connection").is_none());
        assert!(resp.headers().get("transfer-encoding").is_none());
        assert_eq!(resp.headers().get("content-type").unwrap(), "text/plain");
        assert_eq!(resp.headers().get("x-proxied-by").unwrap(), "rampart");
        assert!(resp.headers().get("x-response-time").is_some());
        // Fingerprint headers survive outside stealth mode.
        assert!(resp.headers().get("server").is_some());
    }

    #[tokio::test]
    async fn stealth_removes_fingerprint_headers() {
        let f = UpstreamForwarder::new(&[], Duration::from_secs(30), true, &[]);
        let mut resp = upstream_response();
        f.rewrite_response_headers(&mut resp, Duration::from_millis(5));

        assert!(resp.headers().get("server").is_none());
        assert!(resp.headers().get("x-powered-by").is_none());
        assert!(resp.headers().get("x-proxied-by").is_none());
        assert!(resp.headers().get("x-response-time").is_none());
    }

    #[tokio::test]
    async fn static_headers_override_inbound() {
        let f = UpstreamForwarder::new(
            &[],
            Duration::from_secs(30),
            true,
            &[
                ("x-env".to_string(), "prod".to_string()),
                ("bad name".to_string(), "dropped".to_string()),
            ],
        );
        assert_eq!(f.static_headers.len(), 1);

        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static("x-env"),
            HeaderValue::from_static("spoofed"),
        );
        headers.insert(
            HeaderName::from_static("accept"),
            HeaderValue::from_static("*/*"),
        );
        f.apply_static_headers(&mut headers);

        assert_eq!(headers.get("x-env").unwrap(), "prod");
        assert_eq!(headers.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn failures_map_to_gateway_statuses() {
        assert_eq!(
            ForwardError::NoUpstream.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ForwardError::Transport.into_response().status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ForwardError::Timeout.into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }
}
