//! Gateway between bus metric responders and Prometheus.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use promnats_common::{BusMode, LogFormat, SharedBroker, ZenohBroker, init_tracing};
use tokio::sync::watch;
use tracing::{error, info, warn};

use promnats_gateway::{Gateway, GatewayConfig, Mode};

/// Expose bus metric responders to Prometheus.
#[derive(Parser, Debug)]
#[command(name = "promnats-gateway")]
#[command(about = "Discover bus metric responders and serve them to Prometheus")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, env = "PN_CONFIG")]
    config: Option<PathBuf>,

    /// Operating mode: "paths" or "ports" (overrides config).
    #[arg(long, env = "PN_MODE")]
    mode: Option<Mode>,

    /// Discovery listen address (overrides config).
    #[arg(long, env = "PN_LISTEN")]
    listen: Option<String>,

    /// Host name written into discovery targets (overrides config).
    #[arg(long, env = "PN_HOST")]
    host: Option<String>,

    /// Bus request timeout in milliseconds (overrides config).
    #[arg(long, env = "PN_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// First port handed out in ports mode (overrides config).
    #[arg(long, env = "PN_START_PORT")]
    start_port: Option<u16>,

    /// Port map file used in ports mode (overrides config).
    #[arg(long, env = "PN_MAPPING_FILE")]
    mapping_file: Option<PathBuf>,

    /// Zenoh endpoints to connect to (overrides config).
    #[arg(long, env = "PN_CONNECT", value_delimiter = ',')]
    connect: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "PN_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log JSON lines instead of text.
    #[arg(long, env = "PN_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn apply(self, config: &mut GatewayConfig) {
        let gw = &mut config.gateway;
        if let Some(mode) = self.mode {
            gw.mode = mode;
        }
        if let Some(listen) = self.listen {
            gw.listen = listen;
        }
        if self.host.is_some() {
            gw.host = self.host;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            gw.timeout_ms = timeout_ms;
        }
        if self.start_port.is_some() {
            gw.start_port = self.start_port;
        }
        if let Some(mapping_file) = self.mapping_file {
            gw.mapping_file = mapping_file;
        }
        if !self.connect.is_empty() {
            config.bus.mode = BusMode::Client;
            config.bus.connect = self.connect;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_json {
            config.logging.format = LogFormat::Json;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load_from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    init_tracing(&config.logging)?;
    info!(mode = ?config.gateway.mode, "Starting promnats gateway");

    let zenoh = ZenohBroker::connect(&config.bus)
        .await
        .context("connecting to the bus")?;
    let broker: SharedBroker = Arc::new(zenoh.clone());

    let (gateway, mut fatal_rx) = Gateway::new(&config.gateway, broker)?;
    let listen_addr = config.gateway.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", listen_addr, e))?;
    info!(addr = %listen_addr, "Discovery server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    if let Some(report) = gateway.start_listeners().await {
        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            "Started listeners from port map"
        );
    }
    let periodic = gateway.spawn_periodic_discovery(shutdown_rx.clone());

    let router = gateway.router();
    let mut http_shutdown = shutdown_rx.clone();
    let mut http_task = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while http_shutdown.changed().await.is_ok() {
                    if *http_shutdown.borrow() {
                        break;
                    }
                }
            })
            .await
    });

    let mut http_finished = false;
    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        Some(e) = fatal_rx.recv() => Err(anyhow::Error::new(e)),
        res = &mut http_task => {
            http_finished = true;
            Err(match res {
                Ok(Ok(())) => anyhow::anyhow!("discovery server stopped unexpectedly"),
                Ok(Err(e)) => anyhow::anyhow!("discovery server died: {}", e),
                Err(e) => anyhow::anyhow!("discovery server task failed: {}", e),
            })
        }
    };

    shutdown_tx.send(true)?;
    gateway.stop().await;

    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        if !http_finished {
            let _ = http_task.await;
        }
        if let Some(task) = periodic {
            let _ = task.await;
        }
    })
    .await;

    if let Err(e) = zenoh.close().await {
        warn!(error = %e, "Failed to close the bus session");
    }

    match outcome {
        Ok(()) => {
            info!("Gateway stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Gateway failed");
            Err(e)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down...");
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, shutting down...");
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
