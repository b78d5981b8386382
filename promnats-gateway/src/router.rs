//! URL path to bus subject routing for the paths mode.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use promnats_common::ROOT_SUBJECT;
use tracing::{debug, warn};

use crate::discovery::Discovered;

/// Path keys of one discovery round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTable(BTreeMap<String, Discovered>);

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table keyed by each instance's path key.
    ///
    /// Two instances deriving the same key overwrite each other; the later
    /// one stays.
    pub fn from_discovered<'a, I>(instances: I) -> Self
    where
        I: IntoIterator<Item = &'a Discovered>,
    {
        let mut table = BTreeMap::new();
        for d in instances {
            let key = d.identity.path_key();
            if let Some(previous) = table.insert(key.clone(), d.clone()) {
                warn!(
                    path = %key,
                    previous = %previous.identity,
                    current = %d.identity,
                    "Path key collision, keeping the later instance"
                );
            }
        }
        Self(table)
    }

    pub fn get(&self, key: &str) -> Option<&Discovered> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// Resolves request paths against the latest path table.
///
/// Readers always see a whole table: a refresh swaps the table in one step.
#[derive(Debug)]
pub struct PathRouter {
    root_subject: String,
    table: RwLock<Arc<PathTable>>,
}

impl Default for PathRouter {
    fn default() -> Self {
        Self::new(ROOT_SUBJECT)
    }
}

impl PathRouter {
    pub fn new(root_subject: impl Into<String>) -> Self {
        Self {
            root_subject: root_subject.into(),
            table: RwLock::new(Arc::new(PathTable::new())),
        }
    }

    /// Subject serving `path`, if it is known.
    pub fn lookup(&self, path: &str) -> Option<String> {
        let key = normalize(path);
        let table = self.snapshot();
        let found = table.get(&key).map(|d| d.identity.subject(&self.root_subject));
        if found.is_none() {
            debug!(path = %path, key = %key, known = table.len(), "Path not found");
        }
        found
    }

    /// Replace the whole table.
    pub fn refresh(&self, table: PathTable) {
        debug!(paths = table.len(), "Refreshing path table");
        *self.table.write() = Arc::new(table);
    }

    pub fn snapshot(&self) -> Arc<PathTable> {
        self.table.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_lowercase()
}
