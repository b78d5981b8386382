//! promnats common library
//!
//! Shared pieces for the promnats responder and gateway:
//!
//! - [`message`] - bus [`Message`] and its [`Headers`] (identity, accept, content type, status)
//! - [`broker`] - the [`Broker`] capability: publish, subscribe, reply inboxes
//! - [`transport`] - [`ZenohBroker`], the production bus
//! - [`memory`] - [`MemoryBroker`], an in-process bus
//! - [`subject`] - subjects, instance identities and HTTP path keys
//! - [`serialization`] - JSON/CBOR envelope encoding
//! - [`config`] - bus and logging configuration sections
//! - [`error`] - Error types

pub mod broker;
pub mod config;
pub mod error;
pub mod memory;
pub mod message;
pub mod serialization;
pub mod subject;
pub mod transport;

// Re-export commonly used types at the crate root
pub use broker::{Broker, MessageHandler, SharedBroker, Subscription, new_inbox};
pub use config::{BusConfig, BusMode, LogFormat, LoggingConfig};
pub use error::{Error, Result};
pub use memory::MemoryBroker;
pub use message::{
    HEADER_ACCEPT, HEADER_CONTENT_TYPE, HEADER_ID, HEADER_STATUS, Headers, Message,
    STATUS_NO_RESPONDERS,
};
pub use serialization::{Format, decode, decode_auto, encode};
pub use subject::{Identity, ROOT_SUBJECT, SYSTEM_PREFIX, path_key, targeted_subject};
pub use transport::ZenohBroker;

/// Initialize tracing with the given configuration.
///
/// `RUST_LOG` takes precedence over [`LoggingConfig::filter_directive`].
/// Supports two output formats:
/// - `LogFormat::Text` (default): Human-readable text format
/// - `LogFormat::Json`: Structured JSON format for log aggregation systems
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.filter_directive()));

    match config.format {
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .try_init()
                .map_err(|e| Error::Config(format!("Failed to initialize tracing: {}", e)))?;
        }
    }

    Ok(())
}
