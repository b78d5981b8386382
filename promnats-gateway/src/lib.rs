//! promnats gateway
//!
//! Makes processes that answer metric requests on the bus scrapable by
//! Prometheus.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  metrics   ┌──────────────────┐  /discover   ┌────────────┐
//! │  Responders  │<───────────│ DiscoveryPublisher│<─────────────│ Prometheus │
//! │  (promnats)  │───replies─>│  FanoutRequester  │              │  (http_sd) │
//! └──────────────┘            └────────┬─────────┘              └─────┬──────┘
//!        ^                             │ refresh                       │ scrape
//!        │ metrics.<id>       ┌────────┴─────────┐                     │
//!        └────────────────────│ PathRouter  (paths)│<───────────────────┘
//!                             │ PortAssigner (ports)│
//!                             └──────────────────┘
//! ```
//!
//! In **paths** mode a single listener serves `/metrics/<group>/<cluster>/<task>`
//! and the discovery document sets `__metrics_path__` for each target. In
//! **ports** mode every identity gets a stable port, persisted in a mapping
//! file, with its own listener serving `/metrics`.
//!
//! # Usage
//!
//! ```bash
//! promnats-gateway --config gateway.json5
//! PN_MODE=ports PN_LISTEN=0.0.0.0:9000 promnats-gateway
//! ```
//!
//! See [`config::GatewayConfig`] for configuration options.

pub mod allocator;
pub mod app;
pub mod config;
pub mod discovery;
pub mod fanout;
pub mod http;
pub mod metrics;
pub mod portmap;
pub mod ports;
pub mod router;
pub mod servers;

pub use allocator::{allocate, allocate_avoiding};
pub use app::{Gateway, GatewayError};
pub use config::{GatewayConfig, GatewaySettings, Mode};
pub use discovery::{Discovered, DiscoveryPublisher, DiscoveryResult, HttpEntry, Routing};
pub use fanout::{FanoutError, FanoutRequester};
pub use metrics::{GatewayMetrics, SharedMetrics};
pub use portmap::{PortMap, PortMapError};
pub use ports::PortAssigner;
pub use router::{PathRouter, PathTable};
pub use servers::{ReconcileReport, ServerError, ServerSetManager};
