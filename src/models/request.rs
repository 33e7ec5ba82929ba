use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

/// Context for an incoming request, assembled once by the handler and
/// threaded through every pipeline stage.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The key every per-client policy is indexed by. Usually the client IP
    /// as a string; "unknown" when nothing could be derived.
    pub client_key: String,

    /// The directly-connected socket peer.
    pub peer_addr: IpAddr,

    /// HTTP method (GET, POST, ...).
    pub method: String,

    /// Request path, query string excluded.
    pub path: String,

    /// Host header value.
    pub host: String,

    /// Scheme the listener terminated ("http" or "https").
    pub scheme: &'static str,

    /// All request headers, names lowercased.
    pub headers: HashMap<String, String>,

    /// Request ID stamped by the first pipeline stage.
    pub request_id: String,

    /// Instant the request was accepted.
    pub received_at: Instant,
}

impl RequestContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    /// Masked form of the client key for log lines.
    pub fn masked_key(&self) -> String {
        mask_client_key(&self.client_key)
    }
}

/// Mask a client key for logging: IPv4 keeps the first two octets, IPv6 the
/// first two groups. Non-address keys pass through unchanged.
pub fn mask_client_key(key: &str) -> String {
    if key.contains(':') {
        let mut groups = key.splitn(3, ':');
        match (groups.next(), groups.next()) {
            (Some(a), Some(b)) if !a.is_empty() => format!("{}:{}:xx", a, b),
            _ => key.to_string(),
        }
    } else if key.split('.').count() == 4 {
        let mut octets = key.splitn(3, '.');
        match (octets.next(), octets.next()) {
            (Some(a), Some(b)) => format!("{}.{}.x.x", a, b),
            _ => key.to_string(),
        }
    } else {
        key.to_string()
    }
}
