//! Integration tests for promnats-common.

use std::sync::Arc;
use std::time::Duration;

use promnats_common::{
    Broker, HEADER_CONTENT_TYPE, HEADER_ID, Identity, MemoryBroker, Message, MessageHandler,
    ROOT_SUBJECT, SharedBroker, path_key,
};
use tokio::sync::mpsc;

/// A responder-like subscriber answering every request on its reply subject.
async fn echo_responder(broker: SharedBroker, subject: &str, id: &str) -> promnats_common::Subscription {
    let reply_broker = broker.clone();
    let id = id.to_string();
    let handler: MessageHandler = Arc::new(move |msg: Message| {
        let Some(reply) = msg.reply.clone() else {
            return;
        };
        let broker = reply_broker.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let resp = Message::new(reply, b"up 1\n".to_vec())
                .with_header(HEADER_ID, id)
                .with_header(HEADER_CONTENT_TYPE, "text/plain");
            broker.publish(resp).await.unwrap();
        });
    });
    broker.subscribe(subject, handler).await.unwrap()
}

#[tokio::test]
async fn test_request_reply_over_memory_broker() {
    let broker: SharedBroker = Arc::new(MemoryBroker::new());
    let identity = Identity::parse("App.East.1").unwrap();
    let _responder = echo_responder(
        broker.clone(),
        &identity.subject(ROOT_SUBJECT),
        identity.as_str(),
    )
    .await;

    let inbox = broker.new_inbox();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = broker
        .subscribe(
            &inbox,
            Arc::new(move |m: Message| {
                let _ = tx.send(m);
            }),
        )
        .await
        .unwrap();

    broker
        .publish(Message::new("metrics.app.east.1", b"{}".to_vec()).with_reply(inbox))
        .await
        .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("Timeout waiting for reply")
        .expect("Channel closed");

    assert_eq!(reply.headers.identity(), Some("app.east.1"));
    assert_eq!(reply.headers.content_type(), Some("text/plain"));
    assert_eq!(reply.payload, b"up 1\n");
    assert_eq!(path_key(reply.headers.identity().unwrap()), "app/east/1");
}

#[tokio::test]
async fn test_broadcast_reaches_every_instance() {
    let broker: SharedBroker = Arc::new(MemoryBroker::new());
    let _a = echo_responder(broker.clone(), ROOT_SUBJECT, "a.x.1").await;
    let _b = echo_responder(broker.clone(), ROOT_SUBJECT, "b.y.1").await;

    let inbox = broker.new_inbox();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = broker
        .subscribe(
            &inbox,
            Arc::new(move |m: Message| {
                let _ = tx.send(m);
            }),
        )
        .await
        .unwrap();

    broker
        .publish(Message::new(ROOT_SUBJECT, Vec::new()).with_reply(inbox))
        .await
        .unwrap();

    let mut ids = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        ids.push(msg.headers.identity().unwrap().to_string());
    }
    ids.sort();
    assert_eq!(ids, vec!["a.x.1", "b.y.1"]);
}
