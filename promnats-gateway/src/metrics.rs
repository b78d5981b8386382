//! The gateway's own metrics, served on `/promnats`.

use std::sync::Arc;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use promnats::{ExpositionFormat, encode_registry};

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SubjectLabels {
    pub subject: String,
}

/// Counters and gauges describing discovery and proxy activity.
#[derive(Debug)]
pub struct GatewayMetrics {
    registry: Registry,
    http_requests: Counter,
    subs: Gauge,
    pubs: Counter,
    discovered: Gauge,
    paths: Family<SubjectLabels, Counter>,
    path_fails: Counter,
    discovery_skipped: Counter,
    listeners: Gauge,
}

pub type SharedMetrics = Arc<GatewayMetrics>;

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("promnats");

        let http_requests = Counter::default();
        registry.register(
            "http_requests",
            "Number of HTTP requests served",
            http_requests.clone(),
        );
        let subs = Gauge::default();
        registry.register("subs", "Live bus subscriptions", subs.clone());
        let pubs = Counter::default();
        registry.register("pubs", "Bus requests published", pubs.clone());
        let discovered = Gauge::default();
        registry.register(
            "discovered",
            "Instances found by the last discovery round",
            discovered.clone(),
        );
        let paths = Family::<SubjectLabels, Counter>::default();
        registry.register("paths", "Proxied requests per subject", paths.clone());
        let path_fails = Counter::default();
        registry.register(
            "path_fails",
            "Proxied requests that failed",
            path_fails.clone(),
        );
        let discovery_skipped = Counter::default();
        registry.register(
            "discovery_skipped",
            "Discovery replies skipped for a missing or malformed identity",
            discovery_skipped.clone(),
        );
        let listeners = Gauge::default();
        registry.register("listeners", "Live per-port listeners", listeners.clone());

        Self {
            registry,
            http_requests,
            subs,
            pubs,
            discovered,
            paths,
            path_fails,
            discovery_skipped,
            listeners,
        }
    }

    pub fn http_request(&self) {
        self.http_requests.inc();
    }

    pub fn subscribed(&self) {
        self.subs.inc();
    }

    pub fn unsubscribed(&self) {
        self.subs.dec();
    }

    pub fn published(&self) {
        self.pubs.inc();
    }

    pub fn set_discovered(&self, count: usize) {
        self.discovered.set(count as i64);
    }

    pub fn path_request(&self, subject: &str) {
        self.paths
            .get_or_create(&SubjectLabels {
                subject: subject.to_string(),
            })
            .inc();
    }

    pub fn path_failed(&self) {
        self.path_fails.inc();
    }

    pub fn discovery_skipped(&self) {
        self.discovery_skipped.inc();
    }

    pub fn set_listeners(&self, count: usize) {
        self.listeners.set(count as i64);
    }

    /// Encode in the Prometheus text format.
    pub fn render(&self) -> promnats::Result<Vec<u8>> {
        encode_registry(&self.registry, ExpositionFormat::Text)
    }
}
