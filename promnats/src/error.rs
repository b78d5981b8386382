//! Error types for the responder.

use thiserror::Error;

/// Result type alias using [`ResponderError`].
pub type Result<T> = std::result::Result<T, ResponderError>;

/// Errors that can occur while configuring or running a responder.
#[derive(Error, Debug)]
pub enum ResponderError {
    /// No identity parts were supplied.
    #[error("must be at least 1 part")]
    NoParts,

    /// An identity part is not usable as a subject token.
    #[error("Invalid subject part: {0}")]
    InvalidPart(String),

    /// Subscribing or publishing on the bus failed.
    #[error("Bus error: {0}")]
    Bus(#[from] promnats_common::Error),

    /// Collecting or encoding metrics failed.
    #[error("Failed to gather metrics: {0}")]
    Gather(String),

    /// The responder must be started from within a tokio runtime.
    #[error("No async runtime available: {0}")]
    Runtime(String),
}

impl From<std::fmt::Error> for ResponderError {
    fn from(err: std::fmt::Error) -> Self {
        Self::Gather(err.to_string())
    }
}
