mod admin;
mod analytics;
mod config;
mod models;
mod protection;
mod proxy;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::analytics::collector::MetricsCollector;
use crate::config::settings::Settings;
use crate::protection::bot_scorer::BotScorer;
use crate::protection::ip_reputation::IpReputationManager;
use crate::protection::rate_limiter::RateLimiter;
use crate::proxy::access_log::AccessLogger;
use crate::proxy::discovery::DockerDiscovery;
use crate::proxy::forwarder::UpstreamForwarder;
use crate::proxy::handler::GatewayHandler;
use crate::proxy::health_check::HealthChecker;
use crate::proxy::server::ProxyServer;
use crate::proxy::tls::build_tls_config;

/// How long in-flight requests may drain after the listener stops.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Idle-record eviction cadence for the bot scorer and reputation flusher.
const ENGINE_JANITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Initialise the `tracing` subscriber with stdout output.
fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rampart=debug"));

    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls CryptoProvider");

    init_tracing();

    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let settings = Arc::new(Settings::from_env());
    info!(
        bind = %settings.server.bind_addr(),
        upstreams = settings.upstream.hosts.len(),
        discovery = settings.discovery.enabled,
        "Starting Rampart gateway"
    );

    // ---------------------------------------------------------------
    // 2. Engines
    // ---------------------------------------------------------------
    let rate_limiter = Arc::new(RateLimiter::new(&settings.rate_limit, settings.trust_proxy));
    let bot_scorer = Arc::new(BotScorer::new(&settings.bot_detection));
    let ip_reputation = Arc::new(IpReputationManager::new(&settings.ip_reputation));

    let forwarder = Arc::new(UpstreamForwarder::new(
        &settings.upstream.hosts,
        settings.upstream.timeout(),
        settings.stealth_mode,
        &settings.upstream.static_headers,
    ));

    // ---------------------------------------------------------------
    // 3. Discovery
    // ---------------------------------------------------------------
    let discovery = Arc::new(DockerDiscovery::new(&settings.discovery, Arc::clone(&forwarder)));
    let discovery_active =
        settings.discovery.enabled && settings.upstream.hosts.is_empty() && discovery.available();
    if settings.discovery.enabled && !settings.upstream.hosts.is_empty() {
        info!("Manual upstreams configured; discovery loop not started");
    }

    // ---------------------------------------------------------------
    // 4. Proxy infrastructure
    // ---------------------------------------------------------------
    let metrics = Arc::new(MetricsCollector::new());
    let health = Arc::new(HealthChecker::new(
        Arc::clone(&forwarder),
        Duration::from_secs(30),
    ));

    let access_log = if settings.server.access_log.is_empty() {
        None
    } else {
        match AccessLogger::new(&settings.server.access_log) {
            Ok(logger) => {
                info!(path = %settings.server.access_log, "Access log enabled");
                Some(Arc::new(logger))
            }
            Err(err) => {
                error!(path = %settings.server.access_log, error = %err, "Failed to open access log");
                None
            }
        }
    };

    let tls_config = if settings.server.tls_enabled() {
        match build_tls_config(&settings.server.tls_cert_file, &settings.server.tls_key_file) {
            Ok(config) => Some(Arc::new(config)),
            Err(err) => {
                warn!(error = %err, "TLS configuration failed; serving plain HTTP");
                None
            }
        }
    } else {
        None
    };

    let handler = Arc::new(GatewayHandler {
        settings: Arc::clone(&settings),
        rate_limiter: Arc::clone(&rate_limiter),
        bot_scorer: Arc::clone(&bot_scorer),
        ip_reputation: Arc::clone(&ip_reputation),
        forwarder: Arc::clone(&forwarder),
        discovery: Arc::clone(&discovery),
        health: Arc::clone(&health),
        metrics: Arc::clone(&metrics),
        access_log,
        start_time: Instant::now(),
    });

    let server = ProxyServer::new(Arc::clone(&handler), tls_config);

    // ---------------------------------------------------------------
    // 5. Background tasks
    // ---------------------------------------------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Rate limiter janitor.
    {
        let rate_limiter = Arc::clone(&rate_limiter);
        let mut shutdown = shutdown_rx.clone();
        let tick = settings.rate_limit.cleanup_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => rate_limiter.cleanup(Instant::now()),
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Bot pattern janitor.
    {
        let bot_scorer = Arc::clone(&bot_scorer);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ENGINE_JANITOR_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => bot_scorer.cleanup(Instant::now()),
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Reputation flusher: quota rollover + cache persistence.
    {
        let ip_reputation = Arc::clone(&ip_reputation);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ENGINE_JANITOR_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => ip_reputation.flush(),
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    // Upstream health checker.
    {
        let health = Arc::clone(&health);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            health.run(shutdown).await;
        });
    }

    // Discovery loop.
    if discovery_active {
        let discovery = Arc::clone(&discovery);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            info!("Container discovery loop started");
            discovery.run(shutdown).await;
        });
    }

    // ---------------------------------------------------------------
    // 6. Serve until shutdown
    // ---------------------------------------------------------------
    let server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(err) = server.run(server_shutdown).await {
            error!(error = %err, "Gateway listener failed");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Stop accepting, then drain in-flight requests.
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;

    let drain_started = Instant::now();
    while metrics.active_connections() > 0 && drain_started.elapsed() < SHUTDOWN_DRAIN {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let remaining = metrics.active_connections();
    if remaining > 0 {
        warn!(connections = remaining, "Drain window expired with open connections");
    }

    ip_reputation.flush();
    info!("Rampart shut down gracefully");
    Ok(())
}
