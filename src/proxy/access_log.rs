use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::SecondsFormat;
use parking_lot::Mutex;
use serde::Serialize;

use crate::models::request::RequestContext;

/// One access-log line. Serialised with serde_json so field escaping follows
/// the same rules as every other JSON surface in the gateway.
#[derive(Debug, Serialize)]
struct AccessEntry<'a> {
    ts: String,
    /// Masked client key; raw addresses never reach the log file.
    key: String,
    method: &'a str,
    host: &'a str,
    path: &'a str,
    status: u16,
    outcome: &'a str,
    us: u64,
    ua: &'a str,
    rid: &'a str,
}

impl<'a> AccessEntry<'a> {
    fn from_request(ctx: &'a RequestContext, status: u16, outcome: &'a str, elapsed_us: u64) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            key: ctx.masked_key(),
            method: &ctx.method,
            host: &ctx.host,
            path: &ctx.path,
            status,
            outcome,
            us: elapsed_us,
            ua: ctx.user_agent().unwrap_or(""),
            rid: &ctx.request_id,
        }
    }
}

/// Append-only JSON-lines request log. Writes go straight to the `File`
/// handle so entries are visible immediately.
pub struct AccessLogger {
    writer: Mutex<File>,
}

impl AccessLogger {
    /// Open the log file in append mode, creating parent directories as
    /// needed.
    pub fn new(path: &str) -> std::io::Result<Self> {
        match Path::new(path).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)?;
            }
            _ => {}
        }

        let writer = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map(Mutex::new)?;

        Ok(Self { writer })
    }

    /// Record one finished request.
    pub fn log(&self, ctx: &RequestContext, status: u16, outcome: &str, elapsed_us: u64) {
        let entry = AccessEntry::from_request(ctx, status, outcome, elapsed_us);
        if let Ok(line) = serde_json::to_string(&entry) {
            let mut file = self.writer.lock();
            let _ = writeln!(file, "{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;

    fn ctx() -> RequestContext {
        RequestContext {
            client_key: "203.0.113.77".to_string(),
            peer_addr: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 77)),
            method: "GET".to_string(),
            path: "/search?q=\"quoted\"".to_string(),
            host: "example.test".to_string(),
            scheme: "http",
            headers: HashMap::new(),
            request_id: "00000000deadbeef".to_string(),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn entries_mask_the_key_and_escape_via_serde() {
        let ctx = ctx();
        let entry = AccessEntry::from_request(&ctx, 200, "forwarded", 1_200);
        let line = serde_json::to_string(&entry).expect("entry serialises");

        assert!(line.contains(r#""key":"203.0.x.x""#));
        assert!(line.contains(r#"\"quoted\""#));
        assert!(line.contains(r#""status":200"#));
        assert!(line.contains(r#""outcome":"forwarded""#));
        assert!(line.contains(r#""rid":"00000000deadbeef""#));
    }
}
