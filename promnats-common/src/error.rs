use thiserror::Error;

/// Common error type for promnats components.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Zenoh error: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CBOR serialization error: {0}")]
    Cbor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid subject '{subject}': {reason}")]
    InvalidSubject { subject: String, reason: String },

    #[error("Invalid identity '{identity}': {reason}")]
    InvalidIdentity { identity: String, reason: String },

    #[error("Failed to publish to {subject}: {message}")]
    Publish { subject: String, message: String },

    #[error("Failed to subscribe to {subject}: {message}")]
    Subscribe { subject: String, message: String },
}

impl Error {
    pub(crate) fn invalid_subject(subject: &str, reason: impl Into<String>) -> Self {
        Self::InvalidSubject {
            subject: subject.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_identity(identity: &str, reason: impl Into<String>) -> Self {
        Self::InvalidIdentity {
            identity: identity.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::Cbor(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Error::Cbor(e.to_string())
    }
}

/// Result type alias using promnats' Error.
pub type Result<T> = std::result::Result<T, Error>;
