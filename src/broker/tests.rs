use std::time::Duration;

use futures::StreamExt;

use super::memory::InMemoryBroker;
use super::{Destination, Publish, Subscribe};
use crate::config::QueueSettings;
use crate::envelope::{Envelope, header};
use crate::utils::error::Error;

const WAIT: Duration = Duration::from_secs(1);

fn reply_settings() -> QueueSettings {
    QueueSettings {
        queue: "reply_queue".to_string(),
        exchange: "default_exchange".to_string(),
        routing_key: "interceptor.reply".to_string(),
    }
}

/// Gives spawned tasks (drop-requeue) a chance to run.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

#[test]
fn test_destination_from_settings() {
    let dest = Destination::from_settings(&reply_settings());
    assert_eq!(dest, Destination::exchange("default_exchange", "interceptor.reply"));
    assert_eq!(dest.to_string(), "exchange 'default_exchange' (interceptor.reply)");

    let direct = QueueSettings {
        queue: "onward_queue".to_string(),
        exchange: String::new(),
        routing_key: "ignored".to_string(),
    };
    let dest = Destination::from_settings(&direct);
    assert_eq!(dest, Destination::queue("onward_queue"));
    assert_eq!(dest.to_string(), "queue 'onward_queue'");
}

#[tokio::test]
async fn test_publish_then_consume_through_exchange() {
    let broker = InMemoryBroker::new();
    broker.declare(&reply_settings());
    let publisher = broker.publisher(Destination::from_settings(&reply_settings()));
    let subscriber = broker.subscriber("reply_queue");

    let mut stream = subscriber.start_consuming().await.unwrap();
    assert_eq!(broker.consumer_count("reply_queue"), 1);

    let envelope = Envelope::new("hello").with_header(header::CORRELATION_ID, "id-1");
    publisher.publish(&envelope).await.unwrap();

    let delivery = tokio::time::timeout(WAIT, stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(delivery.exchange, "default_exchange");
    assert_eq!(delivery.routing_key, "interceptor.reply");
    assert_eq!(delivery.correlation_id.as_deref(), Some("id-1"));
    assert!(!delivery.redelivered);

    let decoded = delivery.decode().unwrap();
    assert_eq!(decoded.body, "hello");
    assert_eq!(decoded.correlation_id(), Some("id-1"));

    assert_eq!(broker.unacked_count("reply_queue"), 1);
    delivery.ack().await.unwrap();
    assert_eq!(broker.unacked_count("reply_queue"), 0);
    assert_eq!(broker.ready_count("reply_queue"), 0);

    drop(stream);
    assert_eq!(broker.consumer_count("reply_queue"), 0);
}

#[tokio::test]
async fn test_default_exchange_routes_by_queue_name() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("onward_queue");

    broker
        .publisher(Destination::queue("onward_queue"))
        .publish(&Envelope::new("x"))
        .await
        .unwrap();

    assert_eq!(broker.ready_count("onward_queue"), 1);
}

#[tokio::test]
async fn test_unroutable_message_is_dropped() {
    let broker = InMemoryBroker::new();
    broker.declare(&reply_settings());

    broker
        .publisher(Destination::exchange("default_exchange", "nobody.listens"))
        .publish(&Envelope::new("lost"))
        .await
        .unwrap();
    broker
        .publisher(Destination::queue("missing_queue"))
        .publish(&Envelope::new("lost"))
        .await
        .unwrap();

    assert_eq!(broker.ready_count("reply_queue"), 0);
    assert_eq!(broker.ready_count("missing_queue"), 0);
}

#[tokio::test]
async fn test_competing_consumers_each_get_a_message_once() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("work");
    let subscriber = broker.subscriber("work");
    let mut first = subscriber.start_consuming().await.unwrap();
    let mut second = subscriber.start_consuming().await.unwrap();
    assert_eq!(broker.consumer_count("work"), 2);

    let publisher = broker.publisher(Destination::queue("work"));
    publisher.publish(&Envelope::new("a")).await.unwrap();
    publisher.publish(&Envelope::new("b")).await.unwrap();

    let a = tokio::time::timeout(WAIT, first.next()).await.unwrap().unwrap().unwrap();
    let b = tokio::time::timeout(WAIT, second.next()).await.unwrap().unwrap().unwrap();

    let mut bodies = vec![a.decode().unwrap().body, b.decode().unwrap().body];
    bodies.sort();
    assert_eq!(bodies, vec!["a", "b"]);

    a.ack().await.unwrap();
    b.ack().await.unwrap();
    assert_eq!(broker.ready_count("work"), 0);
    assert_eq!(broker.unacked_count("work"), 0);
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("work");
    let mut stream = broker.subscriber("work").start_consuming().await.unwrap();
    broker
        .publisher(Destination::queue("work"))
        .publish(&Envelope::new("retry me"))
        .await
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    delivery.nack(true).await.unwrap();

    let again = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(again.decode().unwrap().body, "retry me");
    again.ack().await.unwrap();

    assert_eq!(broker.rejected_count("work"), 0);
    assert_eq!(broker.unacked_count("work"), 0);
}

#[tokio::test]
async fn test_nack_without_requeue_rejects() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("work");
    let mut stream = broker.subscriber("work").start_consuming().await.unwrap();
    broker
        .publish_raw(&Destination::queue("work"), b"garbage".to_vec(), None)
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    assert!(delivery.decode().unwrap_err().is_decode_failure());
    delivery.nack(false).await.unwrap();

    assert_eq!(broker.rejected_count("work"), 1);
    assert_eq!(broker.unacked_count("work"), 0);
    assert_eq!(broker.ready_count("work"), 0);
}

#[tokio::test]
async fn test_dropped_delivery_returns_to_queue() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("work");
    let mut stream = broker.subscriber("work").start_consuming().await.unwrap();
    broker
        .publisher(Destination::queue("work"))
        .publish(&Envelope::new("forgotten"))
        .await
        .unwrap();

    let delivery = stream.next().await.unwrap().unwrap();
    drop(delivery);
    settle().await;

    assert_eq!(broker.unacked_count("work"), 0);
    let again = tokio::time::timeout(WAIT, stream.next()).await.unwrap().unwrap().unwrap();
    assert!(again.redelivered);
    again.ack().await.unwrap();
}

#[tokio::test]
async fn test_publish_failure_injection() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("work");
    let publisher = broker.publisher(Destination::queue("work"));

    broker.set_publish_failure(true);
    let err = publisher.publish(&Envelope::new("x")).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(broker.ready_count("work"), 0);

    broker.set_publish_failure(false);
    publisher.publish(&Envelope::new("x")).await.unwrap();
    assert_eq!(broker.ready_count("work"), 1);
}

#[tokio::test]
async fn test_close_ends_streams() {
    let broker = InMemoryBroker::new();
    broker.declare_queue("work");
    let subscriber = broker.subscriber("work");
    let mut stream = subscriber.start_consuming().await.unwrap();

    let waiter = tokio::spawn(async move { stream.next().await.is_none() });
    settle().await;
    broker.close();

    assert!(tokio::time::timeout(WAIT, waiter).await.unwrap().unwrap());
    assert!(subscriber.start_consuming().await.is_err());
}

#[tokio::test]
async fn test_consuming_undeclared_queue_fails() {
    let broker = InMemoryBroker::new();
    let Err(err) = broker.subscriber("nope").start_consuming().await else {
        panic!("consuming an undeclared queue must fail");
    };
    assert!(matches!(err, Error::Transport(_)));
}
