//! Discovery rounds and the Prometheus HTTP service discovery document.
//!
//! A round broadcasts one request on the root subject, turns every reply
//! carrying a valid identity into a [`Discovered`] instance, hands the
//! result to the active [`Routing`] and renders the document Prometheus
//! polls on `/discover`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use promnats_common::{Identity, Message, ROOT_SUBJECT};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::fanout::{FanoutError, FanoutRequester};
use crate::metrics::SharedMetrics;
use crate::ports::PortAssigner;
use crate::router::{PathRouter, PathTable};

const SELF_JOB: &str = "promnats";
const SELF_PATH: &str = "promnats";

/// One responding instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discovered {
    pub identity: Identity,
    /// Port Prometheus should scrape: the discovery listener in paths mode,
    /// the dedicated listener in ports mode.
    pub port: u16,
}

impl Discovered {
    pub fn new(identity: Identity, port: u16) -> Self {
        Self { identity, port }
    }

    /// Target labels. Every instance gets its group; cluster and task
    /// labels are added when the identity has those parts.
    pub fn labels(&self) -> BTreeMap<String, String> {
        let parts = self.identity.parts();
        let group = self.identity.group().to_string();

        let mut labels = BTreeMap::new();
        labels.insert("__meta_prometheus_job".to_string(), group.clone());
        labels.insert("subject_group".to_string(), group.clone());
        labels.insert("app".to_string(), group);

        if parts.len() >= 2 {
            labels.insert("cluster".to_string(), parts[1].clone());
            labels.insert("app_cluster".to_string(), parts[..2].join("."));
        }
        if parts.len() >= 3 {
            labels.insert("task".to_string(), parts[2].clone());
            labels.insert("app_cluster_task".to_string(), parts[..3].join("."));
        }
        labels
    }
}

/// Outcome of one discovery round.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    /// Instances in reply order, one per identity.
    pub instances: Vec<Discovered>,
    /// Replies without a usable identity.
    pub skipped: usize,
}

impl DiscoveryResult {
    /// Collect instances from broadcast replies, all scraped on `port` until
    /// a port assignment says otherwise.
    pub fn from_replies(replies: &[Message], port: u16) -> Self {
        let mut result = DiscoveryResult::default();

        for reply in replies {
            let Some(raw) = reply.headers.identity() else {
                debug!("Skipping reply without identity");
                result.skipped += 1;
                continue;
            };

            let identity = match Identity::parse(raw) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(error = %e, "Skipping reply with malformed identity");
                    result.skipped += 1;
                    continue;
                }
            };

            info!(identity = %identity, path = %identity.path_key(), "Discovered instance");
            let instance = Discovered::new(identity, port);
            match result
                .instances
                .iter_mut()
                .find(|d| d.identity == instance.identity)
            {
                Some(existing) => *existing = instance,
                None => result.instances.push(instance),
            }
        }

        result
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|d| d.identity.as_str())
    }
}

/// One entry of a Prometheus HTTP SD document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpEntry {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Serialize a document, indented when `pretty` is set.
pub fn render_document(document: &[HttpEntry], pretty: bool) -> serde_json::Result<String> {
    if pretty {
        serde_json::to_string_pretty(document)
    } else {
        serde_json::to_string(document)
    }
}

/// Where a round's result goes.
#[derive(Clone)]
pub enum Routing {
    /// Refresh the path table; targets point at the discovery listener.
    Paths(Arc<PathRouter>),
    /// Assign ports and reconcile listeners; targets point at those ports.
    Ports(Arc<PortAssigner>),
}

/// Runs discovery rounds and publishes their result.
pub struct DiscoveryPublisher {
    requester: FanoutRequester,
    routing: Routing,
    root_subject: String,
    host: String,
    listen_port: u16,
    meter_self: bool,
    metrics: Option<SharedMetrics>,
    round: Mutex<()>,
    pending: AtomicBool,
}

impl DiscoveryPublisher {
    pub fn new(requester: FanoutRequester, routing: Routing, host: impl Into<String>, listen_port: u16) -> Self {
        Self {
            requester,
            routing,
            root_subject: ROOT_SUBJECT.to_string(),
            host: host.into(),
            listen_port,
            meter_self: true,
            metrics: None,
            round: Mutex::new(()),
            pending: AtomicBool::new(false),
        }
    }

    pub fn with_meter_self(mut self, meter_self: bool) -> Self {
        self.meter_self = meter_self;
        self
    }

    pub fn with_root_subject(mut self, root: impl Into<String>) -> Self {
        self.root_subject = root.into();
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn routing(&self) -> &Routing {
        &self.routing
    }

    /// Broadcast and collect the responding instances.
    pub async fn discover(&self) -> Result<DiscoveryResult, FanoutError> {
        debug!(subject = %self.root_subject, "Discovering instances");
        let replies = self.requester.request(&self.root_subject, 0).await?;
        let result = DiscoveryResult::from_replies(&replies, self.listen_port);

        if let Some(m) = &self.metrics {
            m.set_discovered(result.instances.len());
            for _ in 0..result.skipped {
                m.discovery_skipped();
            }
        }
        Ok(result)
    }

    /// Run a full round: discover, refresh the routing and build the
    /// service discovery document.
    ///
    /// Rounds are serialized; a request served meanwhile sees either the
    /// previous or the new routing state.
    pub async fn publish(&self) -> Result<Vec<HttpEntry>, FanoutError> {
        let _round = self.round.lock().await;
        let mut result = self.discover().await?;

        match &self.routing {
            Routing::Paths(router) => {
                router.refresh(PathTable::from_discovered(&result.instances));
            }
            Routing::Ports(assigner) => {
                let map = assigner.assign(result.identities()).await;
                result.instances.retain_mut(|d| match map.port_of(d.identity.as_str()) {
                    Some(port) => {
                        d.port = port;
                        true
                    }
                    None => false,
                });
            }
        }

        info!(
            instances = result.instances.len(),
            skipped = result.skipped,
            "Discovery round complete"
        );
        Ok(self.document(&result))
    }

    /// Start a background round unless one is already queued.
    pub fn trigger(self: &Arc<Self>) {
        if self.pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let publisher = self.clone();
        tokio::spawn(async move {
            let outcome = publisher.publish().await;
            publisher.pending.store(false, Ordering::Release);
            if let Err(e) = outcome {
                warn!(error = %e, "Background discovery failed");
            }
        });
    }

    /// Build the service discovery document for a result.
    pub fn document(&self, result: &DiscoveryResult) -> Vec<HttpEntry> {
        let mut document = Vec::with_capacity(result.instances.len() + 1);

        if self.meter_self {
            document.push(HttpEntry {
                targets: vec![format!("{}:{}", self.host, self.listen_port)],
                labels: BTreeMap::from([
                    ("__meta_prometheus_job".to_string(), SELF_JOB.to_string()),
                    ("__metrics_path__".to_string(), SELF_PATH.to_string()),
                ]),
            });
        }

        for instance in &result.instances {
            let mut labels = instance.labels();
            if let Routing::Paths(_) = self.routing {
                labels.insert(
                    "__metrics_path__".to_string(),
                    format!("metrics/{}", instance.identity.path_key()),
                );
            }
            document.push(HttpEntry {
                targets: vec![format!("{}:{}", self.host, instance.port)],
                labels,
            });
        }

        document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promnats_common::{HEADER_ID, MemoryBroker, SharedBroker};
    use std::time::Duration;

    fn reply(id: Option<&str>) -> Message {
        let msg = Message::new("_INBOX.test", b"up 1\n".to_vec());
        match id {
            Some(id) => msg.with_header(HEADER_ID, id),
            None => msg,
        }
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn publisher(routing: Routing) -> DiscoveryPublisher {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let requester =
            FanoutRequester::new(broker, Duration::from_secs(1), Duration::from_millis(50));
        DiscoveryPublisher::new(requester, routing, "gw", 8083)
    }

    #[test]
    fn test_labels_full_identity() {
        let d = Discovered::new(Identity::parse("Shop.EU1.Web7.extra").unwrap(), 9000);

        assert_eq!(
            d.labels(),
            labels(&[
                ("__meta_prometheus_job", "shop"),
                ("subject_group", "shop"),
                ("app", "shop"),
                ("cluster", "eu1"),
                ("app_cluster", "shop.eu1"),
                ("task", "web7"),
                ("app_cluster_task", "shop.eu1.web7"),
            ])
        );
    }

    #[test]
    fn test_labels_short_identities() {
        let one = Discovered::new(Identity::parse("solo").unwrap(), 1);
        assert_eq!(one.labels().len(), 3);
        assert!(!one.labels().contains_key("cluster"));

        let two = Discovered::new(Identity::parse("svc.east").unwrap(), 1);
        let labels = two.labels();
        assert_eq!(labels.get("app_cluster").map(String::as_str), Some("svc.east"));
        assert!(!labels.contains_key("task"));
    }

    #[test]
    fn test_from_replies_skips_and_dedupes() {
        let replies = vec![
            reply(Some("a.x.1")),
            reply(None),
            reply(Some("bad id.x")),
            reply(Some("A.X.1")),
            reply(Some("b.y.1")),
            reply(Some("b.y/1")),
        ];

        let result = DiscoveryResult::from_replies(&replies, 8083);

        assert_eq!(result.skipped, 3);
        assert_eq!(result.identities().collect::<Vec<_>>(), vec!["a.x.1", "b.y.1"]);
    }

    #[test]
    fn test_document_paths_mode() {
        let publisher = publisher(Routing::Paths(Arc::new(PathRouter::default())));
        let result = DiscoveryResult::from_replies(&[reply(Some("a.b.c"))], 8083);

        let doc = publisher.document(&result);

        assert_eq!(doc.len(), 2);
        assert_eq!(doc[0].targets, vec!["gw:8083"]);
        assert_eq!(doc[0].labels.get("__metrics_path__").unwrap(), "promnats");
        assert_eq!(doc[1].targets, vec!["gw:8083"]);
        assert_eq!(doc[1].labels.get("__metrics_path__").unwrap(), "metrics/a/b/c");
        assert_eq!(doc[1].labels.get("__meta_prometheus_job").unwrap(), "a");
    }

    #[test]
    fn test_document_without_self() {
        let publisher =
            publisher(Routing::Paths(Arc::new(PathRouter::default()))).with_meter_self(false);
        assert!(publisher.document(&DiscoveryResult::default()).is_empty());
    }

    #[test]
    fn test_render_pretty_and_compact() {
        let doc = vec![HttpEntry {
            targets: vec!["gw:8083".to_string()],
            labels: labels(&[("app", "a")]),
        }];

        let compact = render_document(&doc, false).unwrap();
        let pretty = render_document(&doc, true).unwrap();

        assert_eq!(compact, r#"[{"targets":["gw:8083"],"labels":{"app":"a"}}]"#);
        assert!(pretty.contains('\n'));
        let parsed: Vec<HttpEntry> = serde_json::from_str(&pretty).unwrap();
        assert_eq!(parsed, doc);
    }

    #[tokio::test]
    async fn test_publish_without_responders() {
        let router = Arc::new(PathRouter::default());
        let publisher = publisher(Routing::Paths(router.clone()));

        let doc = publisher.publish().await.unwrap();

        // Only the self entry.
        assert_eq!(doc.len(), 1);
        assert!(router.is_empty());
    }
}
