//! Configuration for the gateway.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use promnats_common::config::{BusConfig, LoggingConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] json5::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bus connection and envelope encoding.
    #[serde(default)]
    pub bus: BusConfig,

    /// Discovery and HTTP settings.
    #[serde(default)]
    pub gateway: GatewaySettings,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How discovered instances are exposed to Prometheus.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One listener; instances are reached under `/metrics/<path-key>`.
    #[default]
    Paths,
    /// One dedicated listener per instance, on a stable port.
    Ports,
}

impl std::str::FromStr for Mode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "paths" => Ok(Mode::Paths),
            "ports" => Ok(Mode::Ports),
            other => Err(ConfigError::Validation(format!(
                "Unknown mode '{}', expected 'paths' or 'ports'",
                other
            ))),
        }
    }
}

/// Gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    #[serde(default)]
    pub mode: Mode,

    /// Address of the discovery listener (default: "0.0.0.0:8083").
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Host name used in service discovery targets (default: machine hostname).
    #[serde(default)]
    pub host: Option<String>,

    /// Hard deadline of every bus request, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Quiet window that ends a broadcast collection early, in milliseconds.
    #[serde(default = "default_idle_window_ms")]
    pub idle_window_ms: u64,

    /// First port handed out in ports mode (default: listen port + 1).
    #[serde(default)]
    pub start_port: Option<u16>,

    /// Persisted port map used in ports mode.
    #[serde(default = "default_mapping_file")]
    pub mapping_file: PathBuf,

    /// Add the gateway itself to the discovery document.
    #[serde(default = "default_true")]
    pub meter_self: bool,

    /// Run discovery in the background every N seconds (0 = on demand only).
    #[serde(default)]
    pub discovery_interval_secs: u64,

    /// Upper bound on a graceful listener shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8083".to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_idle_window_ms() -> u64 {
    300
}

fn default_mapping_file() -> PathBuf {
    PathBuf::from("promnats-ports.txt")
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            listen: default_listen(),
            host: None,
            timeout_ms: default_timeout_ms(),
            idle_window_ms: default_idle_window_ms(),
            start_port: None,
            mapping_file: default_mapping_file(),
            meter_self: true,
            discovery_interval_secs: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl GatewaySettings {
    /// Parsed listen address. Only valid after [`GatewayConfig::validate`].
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::Validation(format!("Invalid listen address: {}", self.listen)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_millis(self.idle_window_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Interval of background discovery, if enabled.
    pub fn discovery_interval(&self) -> Option<Duration> {
        (self.discovery_interval_secs > 0).then(|| Duration::from_secs(self.discovery_interval_secs))
    }

    /// Host written into discovery targets.
    pub fn sd_host(&self) -> String {
        match &self.host {
            Some(host) if !host.is_empty() => host.clone(),
            _ => hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    /// First allocatable port: the configured one, or the port after `listen`.
    pub fn first_port(&self) -> Result<u16, ConfigError> {
        match self.start_port {
            Some(port) => Ok(port),
            None => self.listen_addr()?.port().checked_add(1).ok_or_else(|| {
                ConfigError::Validation("No port left after the listen port".to_string())
            }),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a JSON5 string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = json5::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bus
            .validate()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;

        let gw = &self.gateway;
        gw.listen_addr()?;

        if gw.timeout_ms == 0 {
            return Err(ConfigError::Validation("timeout_ms must be > 0".to_string()));
        }

        if gw.idle_window_ms == 0 {
            return Err(ConfigError::Validation(
                "idle_window_ms must be > 0".to_string(),
            ));
        }

        if gw.idle_window_ms > gw.timeout_ms {
            return Err(ConfigError::Validation(
                "idle_window_ms must not exceed timeout_ms".to_string(),
            ));
        }

        if gw.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "shutdown_timeout_secs must be > 0".to_string(),
            ));
        }

        if gw.start_port == Some(0) {
            return Err(ConfigError::Validation(
                "start_port must be > 0".to_string(),
            ));
        }

        if gw.mode == Mode::Ports {
            if gw.mapping_file.as_os_str().is_empty() {
                return Err(ConfigError::Validation(
                    "mapping_file is required in ports mode".to_string(),
                ));
            }
            gw.first_port()?;
        }

        Ok(())
    }
}
