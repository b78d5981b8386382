//! Metric gathering and exposition format negotiation.

use std::sync::Arc;

use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

use crate::error::Result;

const OPENMETRICS_MIME: &str = "application/openmetrics-text";
const OPENMETRICS_EOF: &str = "# EOF\n";

/// Exposition formats a responder can produce.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExpositionFormat {
    /// Prometheus text format 0.0.4.
    #[default]
    Text,
    /// OpenMetrics text format 1.0.0.
    OpenMetrics,
}

impl ExpositionFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExpositionFormat::Text => "text/plain; version=0.0.4; charset=utf-8",
            ExpositionFormat::OpenMetrics => {
                "application/openmetrics-text; version=1.0.0; charset=utf-8"
            }
        }
    }
}

/// Pick a format from a request's `Accept` header.
///
/// Anything that does not ask for OpenMetrics, including a missing header
/// or `text/html`, gets the plain text format.
pub fn negotiate(accept: Option<&str>) -> ExpositionFormat {
    match accept {
        Some(accept) if accept.contains(OPENMETRICS_MIME) => ExpositionFormat::OpenMetrics,
        _ => ExpositionFormat::Text,
    }
}

/// Source of the metrics a responder serves.
pub trait Gatherer: Send + Sync {
    /// Collect and encode the current metrics.
    fn gather(&self, format: ExpositionFormat) -> Result<Vec<u8>>;
}

impl<F> Gatherer for F
where
    F: Fn(ExpositionFormat) -> Result<Vec<u8>> + Send + Sync,
{
    fn gather(&self, format: ExpositionFormat) -> Result<Vec<u8>> {
        self(format)
    }
}

/// Gatherer backed by a `prometheus_client` registry.
#[derive(Debug, Clone)]
pub struct RegistryGatherer {
    registry: Arc<Registry>,
}

impl RegistryGatherer {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

impl Gatherer for RegistryGatherer {
    fn gather(&self, format: ExpositionFormat) -> Result<Vec<u8>> {
        encode_registry(&self.registry, format)
    }
}

/// Encode a registry in the requested format.
pub fn encode_registry(registry: &Registry, format: ExpositionFormat) -> Result<Vec<u8>> {
    let mut buf = String::new();
    encode(&mut buf, registry)?;

    if format == ExpositionFormat::Text
        && let Some(stripped) = buf.strip_suffix(OPENMETRICS_EOF)
    {
        buf.truncate(stripped.len());
    }

    Ok(buf.into_bytes())
}
