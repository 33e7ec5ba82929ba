use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bollard::container::ListContainersOptions;
use bollard::models::PortTypeEnum;
use bollard::network::ConnectNetworkOptions;
use bollard::Docker;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::settings::DiscoveryConfig;

use super::forwarder::UpstreamForwarder;

/// Deadline for each individual runtime API call.
const RUNTIME_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One upstream found on a running container.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DiscoveredUpstream {
    pub container: String,
    pub internal_port: u16,
    pub published_port: Option<u16>,
    pub url: String,
}

/// Snapshot for `/metrics` and `/api/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryStats {
    pub available: bool,
    pub network: String,
    pub connected_containers: Vec<String>,
    pub discovered_ports: Vec<u16>,
    pub upstream_count: usize,
}

#[derive(Default)]
struct DiscoveryState {
    last_published: Vec<String>,
    connected: HashSet<String>,
    /// Published port → every upstream reachable behind it.
    by_public_port: BTreeMap<u16, Vec<DiscoveredUpstream>>,
}

/// Periodic container-runtime scanner feeding the forwarder's target pool.
///
/// Fails open throughout: a bad container is skipped, a failed tick keeps
/// the previously published pool.
pub struct DockerDiscovery {
    docker: Option<Docker>,
    forwarder: Arc<UpstreamForwarder>,
    config: DiscoveryConfig,
    state: Mutex<DiscoveryState>,
}

impl DockerDiscovery {
    pub fn new(config: &DiscoveryConfig, forwarder: Arc<UpstreamForwarder>) -> Self {
        let docker = match Docker::connect_with_local_defaults() {
            Ok(client) => Some(client),
            Err(err) => {
                warn!(error = %err, "Container runtime unreachable; discovery disabled");
                None
            }
        };

        Self {
            docker,
            forwarder,
            config: config.clone(),
            state: Mutex::new(DiscoveryState::default()),
        }
    }

    pub fn available(&self) -> bool {
        self.docker.is_some()
    }

    pub fn stats(&self) -> DiscoveryStats {
        let state = self.state.lock();
        DiscoveryStats {
            available: self.docker.is_some(),
            network: self.config.network.clone(),
            connected_containers: {
                let mut names: Vec<String> = state.connected.iter().cloned().collect();
                names.sort();
                names
            },
            discovered_ports: state.by_public_port.keys().copied().collect(),
            upstream_count: state.last_published.len(),
        }
    }

    /// Long-running scan loop; one tick per interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if self.docker.is_none() {
            return;
        }

        let mut interval = tokio::time::interval(self.config.interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    debug!("Discovery loop stopping");
                    return;
                }
            }
        }
    }

    /// One scan pass over the runtime.
    pub async fn tick(&self) {
        let docker = match &self.docker {
            Some(d) => d,
            None => return,
        };

        let options = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = match tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            docker.list_containers(Some(options)),
        )
        .await
        {
            Ok(Ok(list)) => list,
            Ok(Err(err)) => {
                error!(error = %err, "Container scan failed; keeping previous upstreams");
                return;
            }
            Err(_) => {
                error!("Container scan timed out; keeping previous upstreams");
                return;
            }
        };

        let mut connected: HashSet<String> = HashSet::new();
        let mut by_public_port: BTreeMap<u16, Vec<DiscoveredUpstream>> = BTreeMap::new();
        let mut urls: Vec<String> = Vec::new();

        for container in &containers {
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            if name.contains(&self.config.self_name) {
                continue;
            }
            let id = container.id.clone().unwrap_or_else(|| name.clone());

            if self.join_network(docker, &id, &name).await {
                connected.insert(name.clone());
            }

            let Some(ports) = container.ports.as_ref() else {
                continue;
            };
            for port in ports {
                if !matches!(port.typ, Some(PortTypeEnum::TCP) | None) {
                    continue;
                }
                let internal_port = port.private_port;
                let url = format!("http://{}:{}", name, internal_port);
                if !urls.contains(&url) {
                    urls.push(url.clone());
                }
                let discovered = DiscoveredUpstream {
                    container: name.clone(),
                    internal_port,
                    published_port: port.public_port,
                    url,
                };
                let bucket = by_public_port
                    .entry(port.public_port.unwrap_or(internal_port))
                    .or_default();
                if !bucket.contains(&discovered) {
                    bucket.push(discovered);
                }
            }
        }

        urls.sort();

        let changed = {
            let mut state = self.state.lock();
            let changed = state.last_published != urls;
            state.connected = connected;
            state.by_public_port = by_public_port;
            if changed {
                state.last_published = urls.clone();
            }
            changed
        };

        if changed {
            info!(
                upstreams = urls.len(),
                containers = containers.len(),
                "Discovered upstream set changed"
            );
            self.forwarder.update_targets(&urls);
        }
    }

    /// Idempotently join a container to the gateway network. "Already
    /// joined" responses count as success.
    async fn join_network(&self, docker: &Docker, id: &str, name: &str) -> bool {
        let options = ConnectNetworkOptions {
            container: id.to_string(),
            endpoint_config: Default::default(),
        };

        let result = tokio::time::timeout(
            RUNTIME_CALL_TIMEOUT,
            docker.connect_network(&self.config.network, options),
        )
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(container = %name, network = %self.config.network, "Container joined network");
                true
            }
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            })) if status_code == 304
                || status_code == 409
                || message.contains("already exists") =>
            {
                true
            }
            Ok(Err(err)) => {
                warn!(container = %name, error = %err, "Failed to join container to network");
                false
            }
            Err(_) => {
                warn!(container = %name, "Network join timed out");
                false
            }
        }
    }
}
