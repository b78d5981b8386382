//! Ports mode: persisted port assignments backed by live listeners.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::allocator::allocate_avoiding;
use crate::portmap::{PortMap, PortMapError};
use crate::servers::{ReconcileReport, ServerSetManager};

/// Keeps the port map, its file and the listener set in step.
pub struct PortAssigner {
    mapping_file: PathBuf,
    start_port: u16,
    reserved: Vec<u16>,
    map: Mutex<PortMap>,
    servers: Arc<ServerSetManager>,
}

impl PortAssigner {
    /// Load the persisted map, creating the file if needed.
    pub fn load(
        mapping_file: impl Into<PathBuf>,
        start_port: u16,
        servers: Arc<ServerSetManager>,
    ) -> Result<Self, PortMapError> {
        let mapping_file = mapping_file.into();
        let map = PortMap::load(&mapping_file)?;
        info!(
            path = %mapping_file.display(),
            entries = map.len(),
            "Loaded port map"
        );

        Ok(Self {
            mapping_file,
            start_port,
            reserved: Vec::new(),
            map: Mutex::new(map),
            servers,
        })
    }

    /// Keep `ports` (the discovery listener's, typically) out of the map.
    ///
    /// Persisted entries on a reserved port are dropped so that their
    /// identity gets a new port on the next round.
    pub fn with_reserved(mut self, ports: impl IntoIterator<Item = u16>) -> Self {
        self.reserved.extend(ports);
        let map = self.map.get_mut();
        for port in &self.reserved {
            if let Some(identity) = map.remove(*port) {
                warn!(port, identity = %identity, "Mapped port is reserved, dropping it");
            }
        }
        self
    }

    pub fn mapping_file(&self) -> &Path {
        &self.mapping_file
    }

    pub fn current(&self) -> PortMap {
        self.map.lock().clone()
    }

    pub fn servers(&self) -> &Arc<ServerSetManager> {
        &self.servers
    }

    /// Start listeners for the persisted map before any discovery ran.
    pub async fn start(&self) -> ReconcileReport {
        let map = self.current();
        self.servers.reconcile(&map).await
    }

    /// Give every identity a port, persist the map and reconcile listeners.
    ///
    /// A failure to write the file is logged; the new map is used anyway.
    pub async fn assign<'a, I>(&self, identities: I) -> PortMap
    where
        I: IntoIterator<Item = &'a str>,
    {
        let current = self.current();
        let updated = allocate_avoiding(&current, identities, self.start_port, &self.reserved);

        if updated != current {
            if let Err(e) = updated.save(&self.mapping_file) {
                warn!(
                    error = %e,
                    path = %self.mapping_file.display(),
                    "Failed to persist port map"
                );
            }
            *self.map.lock() = updated.clone();
        }

        self.servers.reconcile(&updated).await;
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use axum::Router;

    use crate::servers::RouterFactory;

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn servers() -> Arc<ServerSetManager> {
        let make_router: RouterFactory = Arc::new(|_port: u16, _identity: &str| Router::new());
        let (servers, _fatal) = ServerSetManager::new(make_router, Duration::from_secs(1));
        Arc::new(servers.with_bind_ip(IpAddr::V4(Ipv4Addr::LOCALHOST)))
    }

    #[tokio::test]
    async fn test_assign_survives_unwritable_map_file() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let mapping_file = state_dir.join("ports.txt");

        let start_port = free_port();
        let assigner = PortAssigner::load(&mapping_file, start_port, servers()).unwrap();
        std::fs::remove_dir_all(&state_dir).unwrap();

        let map = assigner.assign(["x.y.z"]).await;

        assert_eq!(map.port_of("x.y.z"), Some(start_port));
        assert_eq!(assigner.current(), map);
        assert_eq!(assigner.servers().live_ports().await, vec![start_port]);
        assert!(!mapping_file.exists());

        // The next round still works from the in-memory map.
        let again = assigner.assign(["x.y.z"]).await;
        assert_eq!(again, map);

        assigner.servers().stop().await;
    }

    #[tokio::test]
    async fn test_reserved_port_never_assigned() {
        let dir = tempfile::tempdir().unwrap();
        let mapping_file = dir.path().join("ports.txt");
        let listen = free_port();
        std::fs::write(&mapping_file, format!("{}:old.a.1\n", listen)).unwrap();

        let assigner = PortAssigner::load(&mapping_file, listen, servers())
            .unwrap()
            .with_reserved([listen]);
        assert!(assigner.current().is_empty());

        let map = assigner.assign(["old.a.1"]).await;

        let port = map.port_of("old.a.1").unwrap();
        assert_ne!(port, listen);
        assert!(port > listen);
        assert_eq!(PortMap::load(&mapping_file).unwrap(), map);

        assigner.servers().stop().await;
    }
}
