//! Configuration sections shared by every promnats service: how to reach
//! the bus and how to log.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::serialization::Format;

/// Role of this process in the Zenoh network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusMode {
    /// Connect to routers listed in `connect`.
    Client,
    /// Talk to other peers directly (scouting on the local network).
    #[default]
    Peer,
    Router,
}

impl BusMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusMode::Client => "client",
            BusMode::Peer => "peer",
            BusMode::Router => "router",
        }
    }
}

impl std::str::FromStr for BusMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(BusMode::Client),
            "peer" => Ok(BusMode::Peer),
            "router" => Ok(BusMode::Router),
            other => Err(Error::Config(format!(
                "Invalid bus mode: '{}'. Expected 'client', 'peer', or 'router'",
                other
            ))),
        }
    }
}

/// Where the bus is and how messages are framed on it.
///
/// Receivers detect JSON or CBOR per message, so processes on one bus may
/// use different `encoding`s.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default)]
    pub mode: BusMode,

    /// Router endpoints, e.g. `tcp/10.0.0.1:7447`. Required in client mode.
    #[serde(default)]
    pub connect: Vec<String>,

    /// Endpoints to accept connections on (peer or router mode).
    #[serde(default)]
    pub listen: Vec<String>,

    /// Encoding of outgoing envelopes.
    #[serde(default)]
    pub encoding: Format,
}

impl BusConfig {
    /// Client of the given routers.
    pub fn client<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: BusMode::Client,
            connect: endpoints.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == BusMode::Client && self.connect.is_empty() {
            return Err(Error::Config(
                "bus.connect needs at least one endpoint in client mode".to_string(),
            ));
        }
        if let Some(bad) = self
            .connect
            .iter()
            .chain(&self.listen)
            .find(|e| !e.contains('/'))
        {
            return Err(Error::Config(format!(
                "Endpoint '{}' is not of the form <proto>/<address>",
                bad
            )));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level or filter directive for promnats itself.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Level applied to the bus library; it is chatty at `info`.
    #[serde(default = "default_transport_level")]
    pub transport_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_transport_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            transport_level: default_transport_level(),
        }
    }
}

impl LoggingConfig {
    /// `EnvFilter` directive built from both levels.
    pub fn filter_directive(&self) -> String {
        if self.transport_level.is_empty() {
            self.level.clone()
        } else {
            format!("{},zenoh={}", self.level, self.transport_level)
        }
    }
}
