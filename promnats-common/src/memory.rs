//! In-process broker.
//!
//! Subjects match exactly (no wildcards). A request published to a subject
//! without subscribers is answered by the broker itself with a
//! `Status: 503` reply, the way a NATS server reports "no responders".

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::broker::{Broker, MessageHandler, Subscription};
use crate::error::{Error, Result};
use crate::message::Message;

#[derive(Default)]
struct Inner {
    subscriptions: Mutex<HashMap<String, Vec<(u64, MessageHandler)>>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl Inner {
    fn handlers(&self, subject: &str) -> Vec<MessageHandler> {
        self.subscriptions
            .lock()
            .get(subject)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default()
    }
}

/// Broker living entirely inside the current process.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `subject`.
    pub fn subscription_count(&self, subject: &str) -> usize {
        self.inner
            .subscriptions
            .lock()
            .get(subject)
            .map_or(0, Vec::len)
    }

    /// Number of live subscriptions across all subjects.
    pub fn total_subscriptions(&self) -> usize {
        self.inner.subscriptions.lock().values().map(Vec::len).sum()
    }

    /// Messages accepted by [`Broker::publish`] so far.
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        if message.subject.is_empty() || message.subject.chars().any(char::is_whitespace) {
            return Err(Error::Publish {
                subject: message.subject.clone(),
                message: "invalid subject".to_string(),
            });
        }
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        // Handlers run without the lock held so they may publish or subscribe.
        let handlers = self.inner.handlers(&message.subject);
        if handlers.is_empty() {
            if let Some(reply) = &message.reply {
                let status = Message::no_responders(reply.clone());
                for handler in self.inner.handlers(reply) {
                    handler(status.clone());
                }
            }
            return Ok(());
        }

        for handler in handlers {
            handler(message.clone());
        }
        Ok(())
    }

    async fn subscribe(&self, subject: &str, handler: MessageHandler) -> Result<Subscription> {
        if subject.is_empty() {
            return Err(Error::Subscribe {
                subject: subject.to_string(),
                message: "empty subject".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscriptions
            .lock()
            .entry(subject.to_string())
            .or_default()
            .push((id, handler));

        Ok(Subscription::new(
            subject,
            MemoryGuard {
                inner: Arc::downgrade(&self.inner),
                subject: subject.to_string(),
                id,
            },
        ))
    }
}

struct MemoryGuard {
    inner: Weak<Inner>,
    subject: String,
    id: u64,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut subs = inner.subscriptions.lock();
        if let Some(list) = subs.get_mut(&self.subject) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                subs.remove(&self.subject);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::HEADER_ID;
    use tokio::sync::mpsc;

    fn channel_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |m: Message| {
            let _ = tx.send(m);
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let broker = MemoryBroker::new();
        let (h1, mut rx1) = channel_handler();
        let (h2, mut rx2) = channel_handler();
        let _s1 = broker.subscribe("metrics", h1).await.unwrap();
        let _s2 = broker.subscribe("metrics", h2).await.unwrap();

        broker
            .publish(Message::new("metrics", b"{}".to_vec()).with_header(HEADER_ID, "x"))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().headers.identity(), Some("x"));
        assert_eq!(rx2.recv().await.unwrap().subject, "metrics");
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let broker = MemoryBroker::new();
        let (h, _rx) = channel_handler();
        let sub = broker.subscribe("metrics.a", h).await.unwrap();
        assert_eq!(broker.subscription_count("metrics.a"), 1);

        drop(sub);
        assert_eq!(broker.subscription_count("metrics.a"), 0);
        assert_eq!(broker.total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_no_responders_status() {
        let broker = MemoryBroker::new();
        let inbox = broker.new_inbox();
        let (h, mut rx) = channel_handler();
        let _sub = broker.subscribe(&inbox, h).await.unwrap();

        broker
            .publish(Message::new("metrics.nobody", Vec::new()).with_reply(inbox.clone()))
            .await
            .unwrap();

        let status = rx.recv().await.unwrap();
        assert_eq!(status.subject, inbox);
        assert!(status.headers.is_no_responders());
    }

    #[tokio::test]
    async fn test_publish_without_reply_to_nobody_is_silent() {
        let broker = MemoryBroker::new();
        broker
            .publish(Message::new("metrics.nobody", Vec::new()))
            .await
            .unwrap();
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn test_invalid_subject_rejected() {
        let broker = MemoryBroker::new();
        assert!(broker.publish(Message::new("", Vec::new())).await.is_err());

        let (h, _rx) = channel_handler();
        assert!(broker.subscribe("", h).await.is_err());
    }
}
