//! The bus capability used by responders and the gateway.
//!
//! A [`Broker`] can publish a message, subscribe a callback to a subject and
//! mint anonymous reply inboxes. Delivery is best effort: callers must
//! tolerate partial or missing replies.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::Message;
use crate::subject::INBOX_PREFIX;

/// Callback invoked for every message delivered to a subscription.
///
/// It may run concurrently on the broker's own threads and must not block.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Shared handle to a broker implementation.
pub type SharedBroker = Arc<dyn Broker>;

/// Publish/subscribe bus with request/reply support.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a message to its subject.
    async fn publish(&self, message: Message) -> Result<()>;

    /// Subscribe `handler` to `subject`. Dropping the returned
    /// [`Subscription`] unsubscribes.
    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Subscription>;

    /// Create a fresh, unique reply subject.
    fn new_inbox(&self) -> String {
        new_inbox()
    }
}

/// Generate a unique `_INBOX.<id>` subject.
pub fn new_inbox() -> String {
    format!("{}.{}", INBOX_PREFIX, uuid::Uuid::new_v4().simple())
}

/// A live subscription. The underlying registration is released on drop.
pub struct Subscription {
    subject: String,
    _guard: Box<dyn Any + Send>,
}

impl Subscription {
    /// Wrap a transport-specific guard whose drop undeclares the subscription.
    pub fn new(subject: impl Into<String>, guard: impl Any + Send) -> Self {
        Self {
            subject: subject.into(),
            _guard: Box::new(guard),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Explicitly release the subscription.
    pub fn unsubscribe(self) {
        tracing::trace!(subject = %self.subject, "Unsubscribing");
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("subject", &self.subject)
            .finish_non_exhaustive()
    }
}
