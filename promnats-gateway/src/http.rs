//! HTTP surface: discovery listener and per-port proxies.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use promnats_common::{HEADER_ID, ROOT_SUBJECT, targeted_subject};
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

use crate::discovery::{DiscoveryPublisher, Routing, render_document};
use crate::fanout::{FanoutError, FanoutRequester};
use crate::metrics::SharedMetrics;

/// Header mirroring the responder identity on proxied responses.
pub const PROXY_ID_HEADER: &str = "x-promnats-id";

const DEFAULT_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Why a proxied request produced no metrics.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("{0} not found")]
    UnknownPath(String),

    #[error("{0} not found")]
    Silent(String),

    #[error(transparent)]
    Fanout(#[from] FanoutError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UnknownPath(_) | ProxyError::Silent(_) => StatusCode::NOT_FOUND,
            ProxyError::Fanout(e) if e.is_no_responders() => StatusCode::NOT_FOUND,
            ProxyError::Fanout(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        (self.status(), format!("{}\n", self)).into_response()
    }
}

/// Forwards one scrape to a single responder.
#[derive(Clone)]
pub struct Proxy {
    requester: FanoutRequester,
    root_subject: String,
    metrics: Option<SharedMetrics>,
}

impl Proxy {
    pub fn new(requester: FanoutRequester) -> Self {
        Self {
            requester,
            root_subject: ROOT_SUBJECT.to_string(),
            metrics: None,
        }
    }

    pub fn with_root_subject(mut self, root: impl Into<String>) -> Self {
        self.root_subject = root.into();
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Subject addressing `identity`.
    pub fn subject_for(&self, identity: &str) -> String {
        targeted_subject(&self.root_subject, identity)
    }

    /// Request `subject` and turn the first reply into a response.
    pub async fn forward(&self, subject: &str) -> Result<Response, ProxyError> {
        let start = Instant::now();
        if let Some(m) = &self.metrics {
            m.path_request(subject);
        }

        let outcome = self.requester.request(subject, 1).await;
        let reply = match outcome {
            Ok(replies) => replies.into_iter().next(),
            Err(e) => {
                self.failed();
                error!(error = %e, subject = %subject, "Request failed");
                return Err(e.into());
            }
        };
        let Some(reply) = reply else {
            self.failed();
            warn!(subject = %subject, "No reply");
            return Err(ProxyError::Silent(subject.to_string()));
        };

        let mut response = reply.payload.into_response();
        let headers = response.headers_mut();
        let content_type = reply
            .headers
            .content_type()
            .and_then(|ct| HeaderValue::from_str(ct).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));
        headers.insert(header::CONTENT_TYPE, content_type);
        if let Some(id) = reply.headers.get(HEADER_ID)
            && let Ok(value) = HeaderValue::from_str(id)
        {
            headers.insert(HeaderName::from_static(PROXY_ID_HEADER), value);
        }

        debug!(subject = %subject, elapsed = ?start.elapsed(), "Responding");
        Ok(response)
    }

    fn failed(&self) {
        if let Some(m) = &self.metrics {
            m.path_failed();
        }
    }
}

/// State of the discovery listener.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<DiscoveryPublisher>,
    pub proxy: Proxy,
    pub metrics: SharedMetrics,
}

/// Router of the discovery listener.
pub fn discovery_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/discover", get(discover_handler))
        .route("/promnats", get(self_metrics_handler))
        .route("/health", get(health_handler));

    if let Routing::Paths(_) = state.publisher.routing() {
        router = router.route("/metrics/*path", get(path_handler));
    }

    router
        .layer(middleware::from_fn_with_state(state.clone(), log_requests))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Router of a per-port listener serving `identity`.
pub fn port_router(proxy: Proxy, identity: &str, metrics: Option<SharedMetrics>) -> Router {
    let subject = Arc::new(proxy.subject_for(identity));
    let router = Router::new()
        .route(
            "/metrics",
            get(move || {
                let proxy = proxy.clone();
                let subject = subject.clone();
                async move { proxy.forward(&subject).await }
            }),
        )
        .route("/health", get(health_handler));

    match metrics {
        Some(metrics) => router.layer(middleware::from_fn_with_state(metrics, count_requests)),
        None => router,
    }
    .layer(middleware::from_fn(log_only))
}

async fn discover_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let pretty = params.get("pretty").is_some_and(|v| !v.is_empty());

    let document = match state.publisher.publish().await {
        Ok(document) => document,
        Err(e) => {
            warn!(error = %e, "Error discovering instances");
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response();
        }
    };

    match render_document(&document, pretty) {
        Ok(body) => ([(header::CONTENT_TYPE, "application/json")], body).into_response(),
        Err(e) => {
            error!(error = %e, "Error encoding discovery document");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response()
        }
    }
}

async fn path_handler(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Result<Response, ProxyError> {
    let Routing::Paths(router) = state.publisher.routing() else {
        return Err(ProxyError::UnknownPath(path));
    };

    if router.is_empty() {
        debug!("Path table empty, starting discovery");
        state.publisher.trigger();
    }

    let Some(subject) = router.lookup(&path) else {
        warn!(path = %path, "Unknown path");
        return Err(ProxyError::UnknownPath(path));
    };
    state.proxy.forward(&subject).await
}

async fn self_metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => ([(header::CONTENT_TYPE, DEFAULT_CONTENT_TYPE)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{}\n", e)).into_response(),
    }
}

async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

async fn log_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    state.metrics.http_request();
    log_only(request, next).await
}

async fn count_requests(State(metrics): State<SharedMetrics>, request: Request, next: Next) -> Response {
    metrics.http_request();
    next.run(request).await
}

async fn log_only(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    let status = response.status();
    let elapsed = start.elapsed();
    if status.as_u16() >= 400 {
        warn!(%method, path = %uri.path(), status = status.as_u16(), ?elapsed, "HTTP request");
    } else {
        debug!(%method, path = %uri.path(), status = status.as_u16(), ?elapsed, "HTTP request");
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use prometheus_client::metrics::gauge::Gauge;
    use prometheus_client::registry::Registry;
    use promnats::{RegistryGatherer, Responder, ResponderOptions};
    use promnats_common::{MemoryBroker, SharedBroker};
    use tower::ServiceExt;

    use crate::metrics::GatewayMetrics;
    use crate::router::PathRouter;

    fn make_state(broker: SharedBroker) -> AppState {
        let metrics = Arc::new(GatewayMetrics::new());
        let requester =
            FanoutRequester::new(broker, Duration::from_secs(1), Duration::from_millis(50))
                .with_metrics(metrics.clone());
        let publisher = DiscoveryPublisher::new(
            requester.clone(),
            Routing::Paths(Arc::new(PathRouter::default())),
            "gw",
            8083,
        )
        .with_metrics(metrics.clone());

        AppState {
            publisher: Arc::new(publisher),
            proxy: Proxy::new(requester).with_metrics(metrics.clone()),
            metrics,
        }
    }

    async fn start_responder(broker: &SharedBroker, id: &str) -> Responder {
        let mut registry = Registry::default();
        let gauge: Gauge = Gauge::default();
        gauge.set(7);
        registry.register("queue_depth", "Items waiting", gauge);

        Responder::start(
            broker.clone(),
            Arc::new(RegistryGatherer::new(Arc::new(registry))),
            ResponderOptions::new().with_id(id).unwrap(),
        )
        .await
        .unwrap()
    }

    async fn get(router: &Router, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let response = router
            .clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let router = discovery_router(make_state(Arc::new(MemoryBroker::new())));

        let (status, _, body) = get(&router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "healthy\n");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let router = discovery_router(make_state(Arc::new(MemoryBroker::new())));

        let (status, _, body) = get(&router, "/metrics/x/y/z").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("not found"));
    }

    #[tokio::test]
    async fn test_discover_then_scrape_path() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let _responder = start_responder(&broker, "Shop.EU1.Web7").await;
        let router = discovery_router(make_state(broker));

        let (status, headers, body) = get(&router, "/discover").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        let doc: Vec<crate::discovery::HttpEntry> = serde_json::from_str(&body).unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(
            doc[1].labels.get("__metrics_path__").unwrap(),
            "metrics/shop/eu1/web7"
        );

        let (status, headers, body) = get(&router, "/metrics/shop/eu1/web7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(PROXY_ID_HEADER).unwrap(), "shop.eu1.web7");
        assert!(
            headers
                .get("content-type")
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        assert!(body.contains("queue_depth 7"));
    }

    #[tokio::test]
    async fn test_discover_pretty() {
        let router = discovery_router(make_state(Arc::new(MemoryBroker::new())));

        let (_, _, compact) = get(&router, "/discover").await;
        let (_, _, pretty) = get(&router, "/discover?pretty=1").await;

        assert!(!compact.contains('\n'));
        assert!(pretty.contains("\n  "));
    }

    #[tokio::test]
    async fn test_silent_target_is_404() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let responder = start_responder(&broker, "a.b.c").await;
        let state = make_state(broker);
        let router = discovery_router(state.clone());

        get(&router, "/discover").await;
        responder.shutdown();

        // Still in the table, but nobody answers any more.
        let (status, _, body) = get(&router, "/metrics/a/b/c").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("no responders"));
    }

    #[tokio::test]
    async fn test_self_metrics_endpoint() {
        let router = discovery_router(make_state(Arc::new(MemoryBroker::new())));
        get(&router, "/health").await;

        let (status, _, body) = get(&router, "/promnats").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("promnats_http_requests_total 2"));
    }

    #[tokio::test]
    async fn test_port_router_proxies_identity() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let _responder = start_responder(&broker, "a.x.1").await;
        let proxy = Proxy::new(FanoutRequester::new(
            broker,
            Duration::from_secs(1),
            Duration::from_millis(50),
        ));
        let router = port_router(proxy, "a.x.1", None);

        let (status, headers, body) = get(&router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers.get(PROXY_ID_HEADER).unwrap(), "a.x.1");
        assert!(body.contains("queue_depth 7"));
    }

    #[test]
    fn test_proxy_error_status() {
        assert_eq!(
            ProxyError::UnknownPath("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::Fanout(FanoutError::NoResponders {
                subject: "metrics.x".into()
            })
            .status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyError::Fanout(FanoutError::Bus(promnats_common::Error::Publish {
                subject: "metrics.x".into(),
                message: "closed".into()
            }))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
