//! Bus messages and their out-of-band metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Header carrying the responder's instance identity.
pub const HEADER_ID: &str = "Promnats-ID";

/// Content-negotiation hint sent with every request.
pub const HEADER_ACCEPT: &str = "Accept";

/// Exposition format of a reply payload.
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";

/// Broker status code; `503` means nobody is subscribed to the subject.
pub const HEADER_STATUS: &str = "Status";

/// Value of [`HEADER_STATUS`] signalling "no responders".
pub const STATUS_NO_RESPONDERS: &str = "503";

/// Key/value metadata attached to a message.
///
/// Keys are matched case-insensitively and stored lowercased, so a
/// `promnats-id` header set by one peer is read back by `Promnats-ID`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_ascii_lowercase(), value.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    /// The responder identity, if present and non-empty.
    pub fn identity(&self) -> Option<&str> {
        self.get(HEADER_ID).filter(|v| !v.trim().is_empty())
    }

    pub fn accept(&self) -> Option<&str> {
        self.get(HEADER_ACCEPT)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(HEADER_CONTENT_TYPE).filter(|v| !v.is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.get(HEADER_STATUS)
    }

    /// Whether this is a broker-generated "no responders" status reply.
    pub fn is_no_responders(&self) -> bool {
        self.status() == Some(STATUS_NO_RESPONDERS)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A message travelling over the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,
    /// Where replies should be sent, for requests.
    pub reply: Option<String>,
    /// Protocol metadata.
    pub headers: Headers,
    /// Opaque body.
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: payload.into(),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    /// Build the empty status reply a broker sends when a request found no
    /// subscriber.
    pub fn no_responders(reply_subject: impl Into<String>) -> Self {
        Self::new(reply_subject, Vec::new()).with_header(HEADER_STATUS, STATUS_NO_RESPONDERS)
    }
}
