//! Persistent port to identity map.
//!
//! File format: one `<port>:<identity>` record per line, sorted by port.
//! Lines starting with `#` and blank lines are ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PortMapError {
    #[error("port map I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("{0} is a directory")]
    IsDirectory(String),
}

/// Ports mapped to instance identities. One identity per port and one
/// port per identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap(BTreeMap<u16, String>);

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, port: u16) -> Option<&str> {
        self.0.get(&port).map(String::as_str)
    }

    /// Port assigned to `identity`, if any.
    pub fn port_of(&self, identity: &str) -> Option<u16> {
        self.0
            .iter()
            .find_map(|(port, id)| (id == identity).then_some(*port))
    }

    /// Map `port` to `identity`.
    ///
    /// Rejected (returns `false`) when the identity already owns another
    /// port. A port that was taken is reassigned.
    pub fn insert(&mut self, port: u16, identity: impl Into<String>) -> bool {
        let identity = identity.into();
        match self.port_of(&identity) {
            Some(existing) if existing != port => false,
            _ => {
                self.0.insert(port, identity);
                true
            }
        }
    }

    /// Drop the mapping of `port`, returning its identity.
    pub fn remove(&mut self, port: u16) -> Option<String> {
        self.0.remove(&port)
    }

    pub fn contains_port(&self, port: u16) -> bool {
        self.0.contains_key(&port)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn max_port(&self) -> Option<u16> {
        self.0.keys().next_back().copied()
    }

    pub fn ports(&self) -> BTreeSet<u16> {
        self.0.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &str)> {
        self.0.iter().map(|(p, id)| (*p, id.as_str()))
    }

    /// Parse the text format.
    pub fn parse(content: &str) -> Result<Self, PortMapError> {
        let mut map = PortMap::new();

        for (idx, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (port, identity) = parse_record(line).map_err(|message| PortMapError::Parse {
                line: idx + 1,
                message,
            })?;

            if !map.insert(port, identity.clone()) {
                warn!(
                    port,
                    identity = %identity,
                    "Identity already mapped to another port, keeping the first"
                );
            }
        }

        Ok(map)
    }

    /// Render the text format.
    pub fn to_text(&self) -> String {
        let mut out = String::from("# <port>:<identity>\n");
        for (port, id) in &self.0 {
            out.push_str(&format!("{}:{}\n", port, id));
        }
        out
    }

    /// Read a map file, creating it empty if it does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PortMapError> {
        let path = path.as_ref();
        match std::fs::metadata(path) {
            Ok(meta) if meta.is_dir() => {
                return Err(PortMapError::IsDirectory(path.display().to_string()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Creating empty port map");
                std::fs::File::create(path)?;
                return Ok(PortMap::new());
            }
            Err(e) => return Err(e.into()),
        }

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Write the map through a temporary file in the same directory, then
    /// rename it over `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PortMapError> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_text().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| PortMapError::Io(e.error))?;

        debug!(path = %path.display(), entries = self.len(), "Port map saved");
        Ok(())
    }
}

impl FromIterator<(u16, String)> for PortMap {
    fn from_iter<I: IntoIterator<Item = (u16, String)>>(iter: I) -> Self {
        let mut map = PortMap::new();
        for (port, id) in iter {
            map.insert(port, id);
        }
        map
    }
}

fn parse_record(line: &str) -> Result<(u16, String), String> {
    let Some((port, identity)) = line.split_once(':') else {
        return Err(format!("each mapping must contain 2 parts: '{}'", line));
    };

    let port = port.trim();
    let port: u16 = port
        .parse()
        .map_err(|_| format!("'{}' is not a valid port number", port))?;
    if port == 0 {
        return Err("port 0 cannot be served".to_string());
    }

    let identity = identity.trim().to_lowercase();
    if identity.is_empty() {
        return Err(format!("missing identity for port {}", port));
    }
    Ok((port, identity))
}
