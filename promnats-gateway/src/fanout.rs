//! Broadcast request with time-boxed reply collection.
//!
//! One request goes out with a private inbox as its reply subject. Replies
//! are pushed by the broker callback into a channel and drained by a single
//! loop, so the counter and the idle timer are only ever touched from one
//! place.

use std::sync::Arc;
use std::time::Duration;

use promnats_common::{HEADER_ACCEPT, Message, SYSTEM_PREFIX, SharedBroker, Subscription};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, trace, warn};

use crate::metrics::SharedMetrics;

/// Body of every request; responders ignore it.
const REQUEST_BODY: &[u8] = b"{}";

/// Accept hint sent with every request.
const REQUEST_ACCEPT: &str = "text/html";

/// Replies buffered between the broker callback and the collection loop.
/// Replies arriving while the buffer is full are dropped.
pub const REPLY_BUFFER: usize = 1024;

/// Errors surfaced by [`FanoutRequester::request`].
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("no responders available for {subject}")]
    NoResponders { subject: String },

    #[error(
        "no responders for {subject}: server requests need an account with system privileges and appropriate permissions"
    )]
    SystemPermission { subject: String },

    #[error("bus error: {0}")]
    Bus(#[from] promnats_common::Error),
}

impl FanoutError {
    /// Whether the target is simply not there, as opposed to a transport failure.
    pub fn is_no_responders(&self) -> bool {
        matches!(
            self,
            FanoutError::NoResponders { .. } | FanoutError::SystemPermission { .. }
        )
    }
}

/// Releases the reply inbox and keeps the subscription gauge honest.
struct Inbox {
    _subscription: Subscription,
    metrics: Option<SharedMetrics>,
}

impl Inbox {
    fn new(subscription: Subscription, metrics: Option<SharedMetrics>) -> Self {
        if let Some(m) = &metrics {
            m.subscribed();
        }
        Self {
            _subscription: subscription,
            metrics,
        }
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        if let Some(m) = &self.metrics {
            m.unsubscribed();
        }
    }
}

/// Sends one request and gathers its replies.
#[derive(Clone)]
pub struct FanoutRequester {
    broker: SharedBroker,
    timeout: Duration,
    idle_window: Duration,
    metrics: Option<SharedMetrics>,
}

impl FanoutRequester {
    pub fn new(broker: SharedBroker, timeout: Duration, idle_window: Duration) -> Self {
        Self {
            broker,
            timeout,
            idle_window,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Request `subject` and collect replies until `wait_for` of them
    /// arrived or the configured timeout elapsed.
    ///
    /// With `wait_for == 0` the number of responders is unknown: collection
    /// also ends once no reply arrived for the idle window. The idle window
    /// never extends the hard deadline.
    ///
    /// Dropping the returned future abandons the wait and releases the inbox.
    pub async fn request(&self, subject: &str, wait_for: usize) -> Result<Vec<Message>, FanoutError> {
        self.request_with_timeout(subject, wait_for, self.timeout).await
    }

    /// [`request`](Self::request) with an explicit hard deadline.
    pub async fn request_with_timeout(
        &self,
        subject: &str,
        wait_for: usize,
        timeout: Duration,
    ) -> Result<Vec<Message>, FanoutError> {
        let deadline = Instant::now() + timeout;
        let inbox = self.broker.new_inbox();

        let (tx, mut rx) = mpsc::channel(REPLY_BUFFER);
        let overflow_subject = subject.to_string();
        let subscription = self
            .broker
            .subscribe(
                &inbox,
                Arc::new(move |msg: Message| {
                    if let Err(TrySendError::Full(_)) = tx.try_send(msg) {
                        warn!(subject = %overflow_subject, "Reply buffer full, dropping reply");
                    }
                }),
            )
            .await?;
        let _inbox = Inbox::new(subscription, self.metrics.clone());

        let request = Message::new(subject, REQUEST_BODY)
            .with_reply(inbox.clone())
            .with_header(HEADER_ACCEPT, REQUEST_ACCEPT);
        debug!(subject = %subject, wait_for, "Sending request");
        self.broker.publish(request).await?;
        if let Some(m) = &self.metrics {
            m.published();
        }

        let hard = sleep_until(deadline);
        tokio::pin!(hard);
        let idle = sleep(self.idle_window);
        tokio::pin!(idle);

        let mut replies = Vec::new();
        loop {
            tokio::select! {
                biased;

                _ = &mut hard => {
                    trace!(subject = %subject, "Request deadline reached");
                    break;
                }
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    trace!(subject = %subject, headers = ?msg.headers, "Inbound reply");

                    if msg.headers.is_no_responders() {
                        if wait_for == 0 {
                            // Nobody listens on the broadcast subject.
                            break;
                        }
                        return Err(no_responders(subject));
                    }

                    replies.push(msg);
                    if wait_for > 0 && replies.len() >= wait_for {
                        break;
                    }
                    idle.as_mut().reset(Instant::now() + self.idle_window);
                }
                _ = &mut idle, if wait_for == 0 => {
                    trace!(subject = %subject, "Idle window elapsed");
                    break;
                }
            }
        }

        debug!(subject = %subject, responses = replies.len(), "Receive complete");
        Ok(replies)
    }
}

fn no_responders(subject: &str) -> FanoutError {
    if subject.starts_with(SYSTEM_PREFIX) {
        FanoutError::SystemPermission {
            subject: subject.to_string(),
        }
    } else {
        FanoutError::NoResponders {
            subject: subject.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use promnats_common::{HEADER_ID, MemoryBroker, MessageHandler};

    /// Subscribe a fake responder that replies `count` times with `delay` in between.
    async fn responder(
        broker: &SharedBroker,
        subject: &str,
        id: &'static str,
        delay: Duration,
        count: usize,
    ) -> Subscription {
        let reply_broker = broker.clone();
        let handler: MessageHandler = Arc::new(move |msg: Message| {
            let Some(reply) = msg.reply.clone() else {
                return;
            };
            let broker = reply_broker.clone();
            tokio::spawn(async move {
                for _ in 0..count {
                    tokio::time::sleep(delay).await;
                    let _ = broker
                        .publish(Message::new(reply.clone(), b"up 1\n".to_vec()).with_header(HEADER_ID, id))
                        .await;
                }
            });
        });
        broker.subscribe(subject, handler).await.unwrap()
    }

    fn requester(broker: &SharedBroker) -> FanoutRequester {
        FanoutRequester::new(
            broker.clone(),
            Duration::from_secs(2),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_wait_for_one_stops_early() {
        let memory = MemoryBroker::new();
        let broker: SharedBroker = Arc::new(memory.clone());
        let _r = responder(&broker, "metrics.a.b.c", "a.b.c", Duration::ZERO, 3).await;

        let start = std::time::Instant::now();
        let replies = requester(&broker).request("metrics.a.b.c", 1).await.unwrap();

        assert_eq!(replies.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        // Only the responder's own subscription is left.
        assert_eq!(memory.total_subscriptions(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_collects_all() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let _a = responder(&broker, "metrics", "a.x.1", Duration::from_millis(10), 1).await;
        let _b = responder(&broker, "metrics", "b.y.1", Duration::from_millis(40), 1).await;

        let replies = requester(&broker).request("metrics", 0).await.unwrap();

        let mut ids: Vec<_> = replies
            .iter()
            .filter_map(|m| m.headers.identity())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a.x.1", "b.y.1"]);
    }

    #[tokio::test]
    async fn test_broadcast_without_responders_is_empty() {
        let memory = MemoryBroker::new();
        let broker: SharedBroker = Arc::new(memory.clone());

        let start = std::time::Instant::now();
        let replies = requester(&broker).request("metrics", 0).await.unwrap();

        assert!(replies.is_empty());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(memory.total_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_idle_window_ends_silent_broadcast() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        // Subscribed but never answering.
        let _silent = broker
            .subscribe("metrics", Arc::new(|_m: Message| {}))
            .await
            .unwrap();

        let start = std::time::Instant::now();
        let replies = requester(&broker).request("metrics", 0).await.unwrap();

        assert!(replies.is_empty());
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_idle_window_never_extends_deadline() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        // Keeps replying every 50ms, well inside the idle window.
        let _chatty = responder(&broker, "metrics", "c.c.c", Duration::from_millis(50), 100).await;

        let requester = FanoutRequester::new(
            broker.clone(),
            Duration::from_millis(400),
            Duration::from_millis(200),
        );
        let start = std::time::Instant::now();
        let replies = requester.request("metrics", 0).await.unwrap();

        assert!(!replies.is_empty());
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn test_reply_flood_respects_deadline() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let reply_broker = broker.clone();
        let handler: MessageHandler = Arc::new(move |msg: Message| {
            let Some(reply) = msg.reply.clone() else {
                return;
            };
            let broker = reply_broker.clone();
            tokio::spawn(async move {
                // Far more replies than fit in the buffer, without pause.
                for _ in 0..(REPLY_BUFFER * 1000) {
                    let flood = Message::new(reply.clone(), b"up 1\n".to_vec())
                        .with_header(HEADER_ID, "f.f.f");
                    let _ = broker.publish(flood).await;
                    tokio::task::yield_now().await;
                }
            });
        });
        let _flood = broker.subscribe("metrics", handler).await.unwrap();

        let requester = FanoutRequester::new(
            broker.clone(),
            Duration::from_millis(200),
            Duration::from_millis(150),
        );
        let start = std::time::Instant::now();
        let replies = requester.request("metrics", 0).await.unwrap();

        assert!(!replies.is_empty());
        assert!(start.elapsed() < Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_targeted_no_responders() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let err = requester(&broker)
            .request("metrics.nobody", 1)
            .await
            .unwrap_err();

        assert!(matches!(err, FanoutError::NoResponders { .. }));
        assert!(err.is_no_responders());
    }

    #[test]
    fn test_system_subject_hint() {
        let err = no_responders("$SYS.REQ.SERVER.PING");
        assert!(matches!(err, FanoutError::SystemPermission { .. }));
        assert!(err.to_string().contains("system privileges"));
    }

    #[tokio::test]
    async fn test_timeout_on_silent_target() {
        let broker: SharedBroker = Arc::new(MemoryBroker::new());
        let _silent = broker
            .subscribe("metrics.a.b.c", Arc::new(|_m: Message| {}))
            .await
            .unwrap();

        let replies = requester(&broker)
            .request_with_timeout("metrics.a.b.c", 1, Duration::from_millis(100))
            .await
            .unwrap();
        assert!(replies.is_empty());
    }
}
