//! promnats responder
//!
//! Makes a process' metrics reachable over the bus. A [`Responder`]
//! subscribes to `metrics` and to every prefix of its identity
//! (`metrics.app`, `metrics.app.cluster`, ...), and answers each request
//! with the output of a [`Gatherer`] in the format negotiated from the
//! request's `Accept` header. Replies carry the identity in the
//! `Promnats-ID` header so a gateway can tell instances apart.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use promnats::{RegistryGatherer, Responder, ResponderOptions};
//!
//! let broker = Arc::new(promnats_common::ZenohBroker::connect(&zenoh_config).await?);
//! let gatherer = Arc::new(RegistryGatherer::new(Arc::new(registry)));
//! let options = ResponderOptions::new().with_id("billing.eu1.worker3")?;
//!
//! let responder = Responder::start(broker, gatherer, options).await?;
//! ```

mod error;
mod gather;
mod options;
mod responder;

pub use error::{ResponderError, Result};
pub use gather::{
    ExpositionFormat, Gatherer, RegistryGatherer, encode_registry, negotiate,
};
pub use options::ResponderOptions;
pub use responder::Responder;

pub use promnats_common::subject::default_identity;
