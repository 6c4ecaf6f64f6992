use super::helper::{self, parcel};
use anyhow::Result;
use catalogmq_client::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

async fn receive_one(broker: &MemoryBroker, queue: &str) -> Result<Option<Message>> {
    let mut connection = broker.connect().await?;
    let mut session = connection.create_session().await?;
    let queue = session.create_queue(queue).await?;
    let mut subscription = session.create_subscription(&queue).await?;

    let message = subscription.receive(Duration::from_millis(100)).await?;

    subscription.close().await?;
    session.close().await?;
    connection.close().await?;

    Ok(message)
}

#[tokio::test]
async fn send_publishes_one_text_message() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);

    producer.send(&parcel(7)).await?;

    assert_eq!(broker.queue_depth(&queue).await, 1);
    assert_eq!(broker.open_handles(), 0);

    let message = receive_one(&broker, &queue).await?;

    assert_eq!(message, Some(Message::Text(r#"{"id":7,"label":"parcel-7"}"#.to_owned())));

    Ok(())
}

#[tokio::test]
async fn pretty_codec_sends_indented_text() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer: Producer<helper::Parcel> =
        Producer::new(Arc::new(broker.clone()), Arc::new(JsonCodec::pretty()), &queue);

    producer.send(&parcel(1)).await?;

    let message = receive_one(&broker, &queue).await?.unwrap();

    assert!(message.as_text().unwrap().contains("\n  \"id\": 1"));

    Ok(())
}

#[tokio::test]
async fn refused_credentials_fail_the_send() -> Result<()> {
    let broker = MemoryBroker::start_with_credentials("catalog", "s3cret");
    let queue = helper::queue_name();
    let producer: Producer<helper::Parcel> =
        Producer::new(Arc::new(broker.connector("catalog", "wrong")), helper::codec(), &queue);

    let result = producer.send(&parcel(1)).await;

    assert!(matches!(
        result,
        Err(SendFailure::Connection(ConnectionError::AccessRefused { ref username })) if username == "catalog"
    ));
    assert_eq!(broker.open_handles(), 0);
    assert_eq!(broker.queue_depth(&queue).await, 0);

    Ok(())
}

#[tokio::test]
async fn good_credentials_are_let_in() -> Result<()> {
    let broker = MemoryBroker::start_with_credentials("catalog", "s3cret");
    let queue = helper::queue_name();
    let producer: Producer<helper::Parcel> =
        Producer::new(Arc::new(broker.connector("catalog", "s3cret")), helper::codec(), &queue);

    producer.send(&parcel(1)).await?;

    assert_eq!(broker.queue_depth(&queue).await, 1);

    Ok(())
}

#[tokio::test]
async fn failing_publish_releases_every_handle() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);

    broker.fail_on(FailurePoint::Publish);

    let result = producer.send(&parcel(1)).await;

    assert!(matches!(
        result,
        Err(SendFailure::Connection(ConnectionError::Broker { operation: "publish", .. }))
    ));
    assert_eq!(broker.open_handles(), 0);

    broker.clear_failures();
    producer.send(&parcel(2)).await?;

    assert_eq!(broker.queue_depth(&queue).await, 1);

    Ok(())
}

#[tokio::test]
async fn failure_half_way_releases_what_was_opened() -> Result<()> {
    let broker = MemoryBroker::start();
    let producer = helper::producer(&broker, &helper::queue_name());

    for point in [
        FailurePoint::Connect,
        FailurePoint::CreateSession,
        FailurePoint::CreateQueue,
        FailurePoint::CreatePublisher,
    ] {
        broker.fail_on(point);

        assert!(producer.send(&parcel(1)).await.is_err(), "{point:?} should fail the send");
        assert_eq!(broker.open_handles(), 0, "handles left open after {point:?}");

        broker.clear_failures();
    }

    Ok(())
}

#[tokio::test]
async fn encoding_failure_publishes_nothing() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    // JSON object keys must be strings.
    let producer: Producer<BTreeMap<Vec<u8>, u32>> =
        Producer::new(Arc::new(broker.clone()), Arc::new(JsonCodec::new()), &queue);

    let entity = BTreeMap::from([(vec![1u8], 1u32)]);
    let result = producer.send(&entity).await;

    assert!(matches!(result, Err(SendFailure::Serialization(_))));
    assert_eq!(broker.open_handles(), 0);
    assert_eq!(broker.queue_depth(&queue).await, 0);

    Ok(())
}

#[tokio::test]
async fn failing_close_is_not_a_send_failure() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);

    broker.fail_on(FailurePoint::Close);

    producer.send(&parcel(1)).await?;

    assert_eq!(broker.open_handles(), 0);
    assert_eq!(broker.queue_depth(&queue).await, 1);

    Ok(())
}

#[tokio::test]
async fn concurrent_sends_use_their_own_connections() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);

    let parcels: Vec<_> = (0..10).map(parcel).collect();
    let results = futures::future::join_all(parcels.iter().map(|p| producer.send(p))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(broker.queue_depth(&queue).await, 10);
    assert_eq!(broker.open_handles(), 0);

    Ok(())
}
