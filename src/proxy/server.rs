use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::analytics::collector::MetricsCollector;

use super::handler::GatewayHandler;

/// The gateway's single listener: accepts connections, optionally
/// terminates TLS, and hands every request to the pipeline handler.
pub struct ProxyServer {
    handler: Arc<GatewayHandler>,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl ProxyServer {
    pub fn new(handler: Arc<GatewayHandler>, tls: Option<Arc<rustls::ServerConfig>>) -> Self {
        Self { handler, tls }
    }

    /// Accept loop; returns when the shutdown signal fires. Spawned
    /// connection tasks keep draining after return.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr = self.handler.settings.server.bind_addr();
        let listener = bind_tcp_listener(&addr)?;
        let listener = TcpListener::from_std(listener).context("Failed to register listener")?;

        let scheme: &'static str = if self.tls.is_some() { "https" } else { "http" };
        info!(addr = %addr, scheme, "Gateway listener started");

        let acceptor = self.tls.as_ref().map(|config| TlsAcceptor::from(Arc::clone(config)));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(err) => {
                            warn!(error = %err, "Failed to accept connection");
                            continue;
                        }
                    };

                    let handler = Arc::clone(&self.handler);
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        let peer_ip = peer_addr.ip();
                        if let Err(err) =
                            handle_connection(stream, peer_ip, handler, acceptor, scheme).await
                        {
                            debug!(peer = %peer_ip, error = %err, "Connection ended with error");
                        }
                    });
                }
                _ = shutdown.changed() => {
                    info!("Listener stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer_ip: IpAddr,
    handler: Arc<GatewayHandler>,
    acceptor: Option<TlsAcceptor>,
    scheme: &'static str,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    handler.metrics.connection_opened();
    let _guard = ConnectionGuard {
        metrics: Arc::clone(&handler.metrics),
    };

    let service_handler = Arc::clone(&handler);
    let service = service_fn(move |req: Request<Incoming>| {
        let h = Arc::clone(&service_handler);
        async move { Ok::<_, hyper::Error>(h.handle_safe(req, peer_ip, scheme).await) }
    });

    match acceptor {
        Some(acceptor) => {
            // Bound the handshake so half-open clients cannot pin the task.
            let tls_stream = match tokio::time::timeout(
                Duration::from_secs(10),
                acceptor.accept(stream),
            )
            .await
            {
                Ok(Ok(s)) => s,
                Ok(Err(err)) => {
                    debug!(peer = %peer_ip, error = %err, "TLS handshake failed");
                    return Err(err.into());
                }
                Err(_) => {
                    debug!(peer = %peer_ip, "TLS handshake timeout");
                    return Err("TLS handshake timeout".into());
                }
            };
            http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(tls_stream), service)
                .await?;
        }
        None => {
            http1::Builder::new()
                .keep_alive(true)
                .serve_connection(TokioIo::new(stream), service)
                .await?;
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// TCP listener with SO_REUSEPORT / SO_REUSEADDR
// ---------------------------------------------------------------------------

fn bind_tcp_listener(addr: &str) -> Result<std::net::TcpListener> {
    let sock_addr: std::net::SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid bind address {}", addr))?;

    let domain = if sock_addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create listener socket")?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    {
        socket.set_reuse_port(true)?;
    }

    socket.set_nonblocking(true)?;
    socket
        .bind(&sock_addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(8192)?;

    Ok(socket.into())
}

/// Decrements the active-connection gauge when the task ends, however it
/// ends.
struct ConnectionGuard {
    metrics: Arc<MetricsCollector>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.metrics.connection_closed();
    }
}
