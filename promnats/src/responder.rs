//! Bus responder answering metric requests.

use std::sync::Arc;
use std::time::Instant;

use promnats_common::{
    HEADER_CONTENT_TYPE, HEADER_ID, Headers, Message, MessageHandler, SharedBroker, Subscription,
};
use tokio::runtime::Handle;

use crate::error::{ResponderError, Result};
use crate::gather::{Gatherer, negotiate};
use crate::options::ResponderOptions;

/// State shared by every subscription of one responder.
struct ReplyContext {
    broker: SharedBroker,
    gatherer: Arc<dyn Gatherer>,
    headers: Headers,
    debug: bool,
}

impl ReplyContext {
    async fn respond(&self, request: &Message, reply_to: String) -> Result<()> {
        let start = Instant::now();
        let format = negotiate(request.headers.accept());
        let payload = self.gatherer.gather(format)?;

        let mut headers = self.headers.clone();
        headers.insert(HEADER_CONTENT_TYPE, format.content_type());

        let reply = Message {
            subject: reply_to,
            reply: None,
            headers,
            payload,
        };

        if let Err(e) = self.broker.publish(reply).await {
            tracing::error!(error = %e, subject = %request.subject, "Error sending reply");
        }

        if self.debug {
            tracing::debug!(
                subject = %request.subject,
                elapsed = ?start.elapsed(),
                "Responded to metrics request"
            );
        }
        Ok(())
    }
}

/// Answers `metrics` requests on the bus for the current process.
///
/// Subscriptions are released when the responder is dropped or
/// [`shutdown`](Self::shutdown) is called.
#[derive(Debug)]
pub struct Responder {
    identity: String,
    subjects: Vec<String>,
    subscriptions: Vec<Subscription>,
}

impl Responder {
    /// Subscribe to every configured subject and start answering.
    ///
    /// Must be called from within a tokio runtime; replies are produced on
    /// that runtime regardless of which thread the broker delivers on.
    pub async fn start(
        broker: SharedBroker,
        gatherer: Arc<dyn Gatherer>,
        options: ResponderOptions,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| ResponderError::Runtime(e.to_string()))?;
        let identity = options.identity();
        let subjects = options.subjects();

        let context = Arc::new(ReplyContext {
            broker: broker.clone(),
            gatherer,
            headers: Headers::new().with(HEADER_ID, identity.clone()),
            debug: options.debug(),
        });

        let handler: MessageHandler = Arc::new(move |msg: Message| {
            let Some(reply_to) = msg.reply.clone() else {
                tracing::trace!(subject = %msg.subject, "Ignoring message without reply subject");
                return;
            };
            let context = context.clone();
            runtime.spawn(async move {
                if let Err(e) = context.respond(&msg, reply_to).await {
                    tracing::warn!(error = %e, subject = %msg.subject, "Error handling metrics request");
                }
            });
        });

        if options.debug() {
            tracing::debug!(subjects = ?subjects, "Configured subjects");
        }

        let mut subscriptions = Vec::with_capacity(subjects.len());
        for subject in &subjects {
            match broker.subscribe(subject, handler.clone()).await {
                Ok(sub) => {
                    if options.debug() {
                        tracing::debug!(subject = %subject, "Subscribing to");
                    }
                    subscriptions.push(sub);
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        subject = %subject,
                        released = subscriptions.len(),
                        "Subscription failed, releasing earlier subscriptions"
                    );
                    drop(subscriptions);
                    return Err(e.into());
                }
            }
        }

        tracing::info!(identity = %identity, subjects = subjects.len(), "Metrics responder started");

        Ok(Self {
            identity,
            subjects,
            subscriptions,
        })
    }

    /// Identity sent in the `Promnats-ID` header.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    /// Stop answering by releasing every subscription.
    pub fn shutdown(self) {
        let count = self.subscriptions.len();
        for sub in self.subscriptions {
            sub.unsubscribe();
        }
        tracing::info!(identity = %self.identity, released = count, "Metrics responder stopped");
    }
}
