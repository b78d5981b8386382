//! Zenoh-backed [`Broker`].
//!
//! Subjects are mapped onto key expressions (`metrics.a.b` becomes
//! `metrics/a/b`) and every message travels as a serialized [`Envelope`]
//! so that reply subjects and headers survive the hop.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zenoh::Session;

use crate::broker::{Broker, MessageHandler, Subscription};
use crate::config::BusConfig;
use crate::error::{Error, Result};
use crate::message::{Headers, Message};
use crate::serialization::{Format, decode_auto, encode};
use crate::subject::subject_to_key;

/// What actually goes over the wire for one bus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn from_message(message: Message) -> Self {
        Self {
            reply: message.reply,
            headers: message.headers,
            payload: message.payload,
        }
    }

    pub fn into_message(self, subject: impl Into<String>) -> Message {
        Message {
            subject: subject.into(),
            reply: self.reply,
            headers: self.headers,
            payload: self.payload,
        }
    }
}

/// Broker running over a Zenoh session.
///
/// Zenoh has no notion of "no responders", so this broker never produces
/// `Status: 503` replies; silent subjects simply time out.
#[derive(Clone, Debug)]
pub struct ZenohBroker {
    session: Arc<Session>,
    format: Format,
}

impl ZenohBroker {
    /// Wrap an open session; outgoing envelopes use `format`.
    pub fn new(session: Arc<Session>, format: Format) -> Self {
        Self { session, format }
    }

    /// Open a Zenoh session from the bus section and wrap it.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let session = open_session(config).await?;
        Ok(Self::new(Arc::new(session), config.encoding))
    }

    /// Close the underlying session. Subscriptions still held become inert.
    pub async fn close(&self) -> Result<()> {
        self.session.close().await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for ZenohBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        let subject = message.subject.clone();
        let key = subject_to_key(&subject)?;
        let payload = encode(&Envelope::from_message(message), self.format)?;

        self.session
            .put(&key, payload)
            .await
            .map_err(|e| Error::Publish {
                subject,
                message: e.to_string(),
            })
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Subscription> {
        let key = subject_to_key(subject)?;
        let owned_subject = subject.to_string();

        let subscriber = self
            .session
            .declare_subscriber(&key)
            .callback(move |sample| {
                let bytes = sample.payload().to_bytes();
                match decode_auto::<Envelope>(&bytes) {
                    Ok(envelope) => handler(envelope.into_message(owned_subject.clone())),
                    Err(e) => {
                        tracing::debug!(
                            key = %sample.key_expr(),
                            payload_len = bytes.len(),
                            error = %e,
                            "Dropping undecodable envelope"
                        );
                    }
                }
            })
            .await
            .map_err(|e| Error::Subscribe {
                subject: subject.to_string(),
                message: e.to_string(),
            })?;

        tracing::trace!(subject = %subject, key = %key, "Declared subscriber");
        Ok(Subscription::new(subject, subscriber))
    }
}

/// Open a Zenoh session for the given bus section.
pub async fn open_session(config: &BusConfig) -> Result<Session> {
    config.validate()?;

    let mut zenoh_config = zenoh::Config::default();
    zenoh_config
        .insert_json5("mode", &format!("\"{}\"", config.mode.as_str()))
        .map_err(|e| Error::Config(format!("Failed to set mode: {}", e)))?;

    if !config.connect.is_empty() {
        let endpoints_json = serde_json::to_string(&config.connect)?;
        zenoh_config
            .insert_json5("connect/endpoints", &endpoints_json)
            .map_err(|e| Error::Config(format!("Failed to set connect endpoints: {}", e)))?;
    }

    if !config.listen.is_empty() {
        let endpoints_json = serde_json::to_string(&config.listen)?;
        zenoh_config
            .insert_json5("listen/endpoints", &endpoints_json)
            .map_err(|e| Error::Config(format!("Failed to set listen endpoints: {}", e)))?;
    }

    tracing::info!(
        mode = config.mode.as_str(),
        encoding = ?config.encoding,
        connect = ?config.connect,
        listen = ?config.listen,
        "Connecting to Zenoh"
    );

    let session = zenoh::open(zenoh_config).await?;

    tracing::info!(zid = %session.zid(), "Connected to Zenoh");

    Ok(session)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HEADER_ID;
    use crate::serialization::decode;

    #[test]
    fn test_envelope_keeps_reply_and_headers() {
        let msg = Message::new("metrics.a", b"payload".to_vec())
            .with_reply("_INBOX.1")
            .with_header(HEADER_ID, "a.b.c");

        let bytes = encode(&Envelope::from_message(msg.clone()), Format::Cbor).unwrap();
        let back: Envelope = decode(&bytes, Format::Cbor).unwrap();

        assert_eq!(back.into_message("metrics.a"), msg);
    }

    #[test]
    fn test_envelope_json_defaults() {
        let env: Envelope = decode_auto(br#"{"headers":{"promnats-id":"x.y.z"}}"#).unwrap();

        assert_eq!(env.reply, None);
        assert!(env.payload.is_empty());
        assert_eq!(env.headers.identity(), Some("x.y.z"));
    }

    #[tokio::test]
    async fn test_client_without_endpoints_rejected() {
        let config = BusConfig {
            mode: crate::config::BusMode::Client,
            ..BusConfig::default()
        };
        let result = ZenohBroker::connect(&config).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
