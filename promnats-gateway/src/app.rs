//! Wiring of the gateway components for one configuration.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use promnats_common::SharedBroker;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{ConfigError, GatewaySettings, Mode};
use crate::discovery::{DiscoveryPublisher, Routing};
use crate::fanout::FanoutRequester;
use crate::http::{AppState, Proxy, discovery_router, port_router};
use crate::metrics::{GatewayMetrics, SharedMetrics};
use crate::ports::PortAssigner;
use crate::portmap::PortMapError;
use crate::router::PathRouter;
use crate::servers::{FatalReceiver, ReconcileReport, RouterFactory, ServerSetManager};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot load port map: {0}")]
    PortMap(#[from] PortMapError),
}

/// All gateway components built from one [`GatewaySettings`].
pub struct Gateway {
    metrics: SharedMetrics,
    publisher: Arc<DiscoveryPublisher>,
    proxy: Proxy,
    servers: Arc<ServerSetManager>,
    ports: Option<Arc<PortAssigner>>,
    discovery_interval: Option<Duration>,
}

impl Gateway {
    /// Build the gateway. The returned receiver yields listeners that died
    /// outside of a planned shutdown.
    pub fn new(
        settings: &GatewaySettings,
        broker: SharedBroker,
    ) -> Result<(Self, FatalReceiver), GatewayError> {
        let listen = settings.listen_addr()?;
        let metrics: SharedMetrics = Arc::new(GatewayMetrics::new());

        let requester = FanoutRequester::new(broker, settings.timeout(), settings.idle_window())
            .with_metrics(metrics.clone());
        let proxy = Proxy::new(requester.clone()).with_metrics(metrics.clone());

        let factory_proxy = proxy.clone();
        let factory_metrics = metrics.clone();
        let make_router: RouterFactory = Arc::new(move |_port: u16, identity: &str| {
            port_router(factory_proxy.clone(), identity, Some(factory_metrics.clone()))
        });
        let (servers, fatal_rx) = ServerSetManager::new(make_router, settings.shutdown_timeout());
        let servers = Arc::new(
            servers
                .with_bind_ip(listen.ip())
                .with_metrics(metrics.clone()),
        );

        let (routing, ports) = match settings.mode {
            Mode::Paths => (Routing::Paths(Arc::new(PathRouter::default())), None),
            Mode::Ports => {
                let assigner = Arc::new(
                    PortAssigner::load(&settings.mapping_file, settings.first_port()?, servers.clone())?
                        .with_reserved([listen.port()]),
                );
                (Routing::Ports(assigner.clone()), Some(assigner))
            }
        };

        let publisher = DiscoveryPublisher::new(requester, routing, settings.sd_host(), listen.port())
            .with_meter_self(settings.meter_self)
            .with_metrics(metrics.clone());

        let gateway = Self {
            metrics,
            publisher: Arc::new(publisher),
            proxy,
            servers,
            ports,
            discovery_interval: settings.discovery_interval(),
        };
        Ok((gateway, fatal_rx))
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn publisher(&self) -> &Arc<DiscoveryPublisher> {
        &self.publisher
    }

    pub fn servers(&self) -> &Arc<ServerSetManager> {
        &self.servers
    }

    /// Router for the discovery listener.
    pub fn router(&self) -> Router {
        discovery_router(AppState {
            publisher: self.publisher.clone(),
            proxy: self.proxy.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Start the listeners of the persisted port map (ports mode only).
    pub async fn start_listeners(&self) -> Option<ReconcileReport> {
        let ports = self.ports.as_ref()?;
        Some(ports.start().await)
    }

    /// Run discovery periodically until `shutdown` flips, if configured.
    pub fn spawn_periodic_discovery(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let period = self.discovery_interval?;
        let publisher = self.publisher.clone();
        info!(?period, "Periodic discovery enabled");

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = publisher.publish().await {
                            warn!(error = %e, "Periodic discovery failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Stop every per-port listener.
    pub async fn stop(&self) {
        self.servers.stop().await;
    }
}
