//! The set of per-port listeners used in ports mode.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::metrics::SharedMetrics;
use crate::portmap::PortMap;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("listener on port {port} died: {reason}")]
    Died { port: u16, reason: String },
}

/// Builds the router served on a port for the identity mapped to it.
pub type RouterFactory = Arc<dyn Fn(u16, &str) -> Router + Send + Sync>;

/// Receives unexpected listener deaths.
pub type FatalReceiver = mpsc::UnboundedReceiver<ServerError>;

/// What one [`ServerSetManager::reconcile`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<u16>,
    pub stopped: Vec<u16>,
    pub failed: Vec<u16>,
}

impl ReconcileReport {
    /// Nothing was started or stopped.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.stopped.is_empty() && self.failed.is_empty()
    }
}

/// Live listeners, plus ports that failed to start and the identity they
/// were meant to serve.
#[derive(Default)]
struct ListenerSet {
    live: BTreeMap<u16, Listener>,
    failed: BTreeMap<u16, String>,
}

struct Listener {
    identity: String,
    stopping: Arc<AtomicBool>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the live per-port listeners and keeps them in line with a port map.
pub struct ServerSetManager {
    bind_ip: IpAddr,
    make_router: RouterFactory,
    shutdown_timeout: Duration,
    set: Mutex<ListenerSet>,
    closing: Arc<AtomicBool>,
    fatal: mpsc::UnboundedSender<ServerError>,
    metrics: Option<SharedMetrics>,
}

impl ServerSetManager {
    pub fn new(make_router: RouterFactory, shutdown_timeout: Duration) -> (Self, FatalReceiver) {
        let (fatal, fatal_rx) = mpsc::unbounded_channel();
        let manager = Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            make_router,
            shutdown_timeout,
            set: Mutex::new(ListenerSet::default()),
            closing: Arc::new(AtomicBool::new(false)),
            fatal,
            metrics: None,
        };
        (manager, fatal_rx)
    }

    pub fn with_bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Ports with a running listener.
    pub async fn live_ports(&self) -> Vec<u16> {
        self.set.lock().await.live.keys().copied().collect()
    }

    /// Ports whose listener could not be started for their current identity.
    pub async fn failed_ports(&self) -> Vec<u16> {
        self.set.lock().await.failed.keys().copied().collect()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Start listeners for ports in `desired` that have none and stop the
    /// ones whose port left the map or now serves another identity.
    ///
    /// A port that failed to start is not retried until the identity mapped
    /// to it changes, so calling this again with the same map does nothing.
    pub async fn reconcile(&self, desired: &PortMap) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut guard = self.set.lock().await;
        let set = &mut *guard;

        set.failed
            .retain(|port, identity| desired.get(*port) == Some(identity.as_str()));

        let outdated: Vec<u16> = set
            .live
            .iter()
            .filter(|(port, l)| desired.get(**port) != Some(l.identity.as_str()))
            .map(|(port, _)| *port)
            .collect();

        let mut removed = Vec::with_capacity(outdated.len());
        for port in outdated {
            if let Some(listener) = set.live.remove(&port) {
                removed.push((port, listener));
            }
        }
        for (port, listener) in removed {
            self.shutdown_listener(port, listener).await;
            report.stopped.push(port);
        }

        for (port, identity) in desired.iter() {
            if set.live.contains_key(&port) || set.failed.contains_key(&port) {
                continue;
            }
            match self.start_listener(port, identity).await {
                Ok(listener) => {
                    set.live.insert(port, listener);
                    report.started.push(port);
                }
                Err(e) => {
                    error!(error = %e, port, identity = %identity, "Failed to start listener");
                    set.failed.insert(port, identity.to_string());
                    report.failed.push(port);
                }
            }
        }

        if let Some(m) = &self.metrics {
            m.set_listeners(set.live.len());
        }
        if !report.is_noop() {
            info!(
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                live = set.live.len(),
                "Listeners reconciled"
            );
        }
        report
    }

    /// Shut every listener down and wait until all of them have exited.
    ///
    /// All listeners share one shutdown deadline; stragglers are aborted.
    pub async fn stop(&self) {
        self.closing.store(true, Ordering::Release);

        let listeners = {
            let mut set = self.set.lock().await;
            set.failed.clear();
            std::mem::take(&mut set.live)
        };
        let count = listeners.len();
        let deadline = Instant::now() + self.shutdown_timeout;

        let mut pending = Vec::with_capacity(count);
        for (port, listener) in listeners {
            listener.stopping.store(true, Ordering::Release);
            let _ = listener.shutdown.send(());
            pending.push((port, listener.identity, listener.task));
        }
        for (port, identity, task) in pending {
            wait_or_abort(port, &identity, task, deadline).await;
        }

        if let Some(m) = &self.metrics {
            m.set_listeners(0);
        }
        info!(stopped = count, "All listeners stopped");
        self.closing.store(false, Ordering::Release);
    }

    async fn start_listener(&self, port: u16, identity: &str) -> Result<Listener, ServerError> {
        let addr = SocketAddr::new(self.bind_ip, port);
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        let router = (self.make_router)(port, identity);
        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let stopping = Arc::new(AtomicBool::new(false));

        let task_stopping = stopping.clone();
        let closing = self.closing.clone();
        let fatal = self.fatal.clone();
        let task_identity = identity.to_string();
        let task = tokio::spawn(async move {
            let outcome = axum::serve(tcp, router)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;

            let planned = task_stopping.load(Ordering::Acquire) || closing.load(Ordering::Acquire);
            if planned {
                debug!(port, identity = %task_identity, "Listener exited");
                return;
            }

            let reason = match outcome {
                Ok(()) => "server returned".to_string(),
                Err(e) => e.to_string(),
            };
            error!(port, identity = %task_identity, reason = %reason, "Listener died");
            let _ = fatal.send(ServerError::Died { port, reason });
        });

        info!(%addr, identity = %identity, "Listener started");
        Ok(Listener {
            identity: identity.to_string(),
            stopping,
            shutdown,
            task,
        })
    }

    async fn shutdown_listener(&self, port: u16, listener: Listener) {
        listener.stopping.store(true, Ordering::Release);
        let _ = listener.shutdown.send(());
        let deadline = Instant::now() + self.shutdown_timeout;
        wait_or_abort(port, &listener.identity, listener.task, deadline).await;
    }
}

async fn wait_or_abort(port: u16, identity: &str, mut task: JoinHandle<()>, deadline: Instant) {
    match tokio::time::timeout_at(deadline, &mut task).await {
        Ok(_) => info!(port, identity = %identity, "Listener stopped"),
        Err(_) => {
            warn!(port, identity = %identity, "Listener did not stop in time, aborting");
            task.abort();
            let _ = task.await;
        }
    }
}
