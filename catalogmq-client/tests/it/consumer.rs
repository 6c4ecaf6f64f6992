use super::helper::{self, parcel, wait_for_state, wait_until, Parcel, Recorder};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use catalogmq_client::*;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[tokio::test]
async fn single_read_processes_one_message_and_stops() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);
    let recorder = Recorder::default();

    producer.send(&parcel(1)).await?;
    producer.send(&parcel(2)).await?;

    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::SingleRead),
        recorder.processor(),
    );

    consumer.start();
    wait_for_state(&consumer, ConsumerState::Stopped).await?;

    assert_eq!(recorder.seen(), vec![parcel(1)]);
    assert_eq!(broker.queue_depth(&queue).await, 1);
    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn single_read_stops_after_one_poll_interval_when_nothing_arrives() -> Result<()> {
    let broker = MemoryBroker::start();
    let recorder = Recorder::default();
    let poll_interval = Duration::from_millis(200);
    let config = QueueConfig::new(&helper::queue_name())
        .poll_interval(poll_interval)
        .behavior(ConsumerBehavior::SingleRead);
    let consumer = helper::consumer(&broker, config, recorder.processor());

    let started = tokio::time::Instant::now();

    consumer.start();
    wait_for_state(&consumer, ConsumerState::Stopped).await?;

    let elapsed = started.elapsed();

    assert!(elapsed >= poll_interval, "stopped after {elapsed:?}");
    assert!(elapsed < poll_interval * 2, "stopped after {elapsed:?}");
    assert!(recorder.seen().is_empty());
    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn persistent_processes_messages_in_order() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);
    let recorder = Recorder::default();
    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    consumer.start();

    for id in 1..=3 {
        producer.send(&parcel(id)).await?;
    }

    wait_until(|| recorder.seen().len() == 3).await?;

    assert_eq!(recorder.seen(), vec![parcel(1), parcel(2), parcel(3)]);
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.stop().await;

    assert_eq!(consumer.state(), ConsumerState::Stopped);
    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn persistent_keeps_the_order_of_messages_queued_before_start() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);
    let recorder = Recorder::default();

    producer.send(&parcel(1)).await?;
    producer.send(&parcel(2)).await?;

    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    consumer.start();
    wait_until(|| recorder.seen().len() == 2).await?;

    assert_eq!(recorder.seen(), vec![parcel(1), parcel(2)]);

    consumer.close().await;

    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn persistent_outlives_empty_polls() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let recorder = Recorder::default();
    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    consumer.start();

    // Several poll intervals pass without a message.
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(consumer.state(), ConsumerState::Running);

    helper::producer(&broker, &queue).send(&parcel(9)).await?;
    wait_until(|| recorder.seen() == vec![parcel(9)]).await?;

    consumer.close().await;

    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn malformed_payload_stops_single_read() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let recorder = Recorder::default();

    broker.publish(&queue, "<product/>".into()).await?;

    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::SingleRead),
        recorder.processor(),
    );

    consumer.start();
    wait_for_state(&consumer, ConsumerState::Stopped).await?;

    assert!(recorder.seen().is_empty());
    assert_eq!(broker.queue_depth(&queue).await, 0);
    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn malformed_payload_is_skipped_by_persistent() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let recorder = Recorder::default();

    broker.publish(&queue, r#"{"id":"one","label":"x"}"#.into()).await?;
    broker.publish(&queue, r#"{"id":1,"label":"x","weight":3}"#.into()).await?;
    helper::producer(&broker, &queue).send(&parcel(2)).await?;

    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    consumer.start();
    wait_until(|| !recorder.seen().is_empty()).await?;

    assert_eq!(recorder.seen(), vec![parcel(2)]);
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.close().await;

    Ok(())
}

#[tokio::test]
async fn binary_messages_are_ignored() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let recorder = Recorder::default();

    broker.publish(&queue, vec![0xca_u8, 0xfe].into()).await?;
    helper::producer(&broker, &queue).send(&parcel(3)).await?;

    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    consumer.start();
    wait_until(|| !recorder.seen().is_empty()).await?;

    assert_eq!(recorder.seen(), vec![parcel(3)]);
    assert_eq!(broker.queue_depth(&queue).await, 0);

    consumer.close().await;

    Ok(())
}

#[tokio::test]
async fn processor_errors_and_panics_do_not_stop_persistent() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);
    let processed = Arc::new(Mutex::new(vec![]));

    let seen = Arc::clone(&processed);
    let processor = processor_fn(move |p: Parcel| match p.id {
        1 => Err(anyhow!("cannot store parcel {}", p.id)),
        2 => panic!("parcel {} is cursed", p.id),
        _ => {
            seen.lock().unwrap().push(p.id);
            Ok(())
        }
    });

    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&queue, ConsumerBehavior::Persistent),
        processor,
    );

    for id in 1..=3 {
        producer.send(&parcel(id)).await?;
    }

    consumer.start();
    wait_until(|| !processed.lock().unwrap().is_empty()).await?;

    assert_eq!(*processed.lock().unwrap(), vec![3]);
    assert_eq!(consumer.state(), ConsumerState::Running);

    consumer.close().await;

    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

/// Takes forever with parcel 1.
struct Sluggish(Recorder);

#[async_trait]
impl Processor<Parcel> for Sluggish {
    async fn process(&self, entity: Parcel) -> Result<()> {
        if entity.id == 1 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }

        self.0.process(entity).await
    }
}

#[tokio::test]
async fn slow_processing_is_abandoned() -> Result<()> {
    let broker = MemoryBroker::start();
    let queue = helper::queue_name();
    let producer = helper::producer(&broker, &queue);
    let recorder = Recorder::default();

    producer.send(&parcel(1)).await?;
    producer.send(&parcel(2)).await?;

    let config = helper::fast_queue(&queue, ConsumerBehavior::Persistent)
        .process_timeout(Some(Duration::from_millis(100)));
    let consumer = helper::consumer(&broker, config, Arc::new(Sluggish(recorder.clone())));

    consumer.start();
    wait_until(|| !recorder.seen().is_empty()).await?;

    assert_eq!(recorder.seen(), vec![parcel(2)]);

    consumer.close().await;

    Ok(())
}

#[tokio::test]
async fn receive_failure_stops_persistent() -> Result<()> {
    let broker = MemoryBroker::start();
    let recorder = Recorder::default();
    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&helper::queue_name(), ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    broker.fail_on(FailurePoint::Receive);

    consumer.start();
    wait_for_state(&consumer, ConsumerState::Stopped).await?;

    assert_eq!(broker.open_handles(), 0);

    Ok(())
}

#[tokio::test]
async fn failed_subscription_releases_connection_and_session() -> Result<()> {
    let broker = MemoryBroker::start();
    let recorder = Recorder::default();
    let consumer = helper::consumer(
        &broker,
        helper::fast_queue(&helper::queue_name(), ConsumerBehavior::Persistent),
        recorder.processor(),
    );

    broker.fail_on(FailurePoint::CreateSubscription);

    consumer.start();
    wait_for_state(&consumer, ConsumerState::Stopped).await?;

    assert_eq!(broker.open_handles(), 0);

    consumer.close().await;

    assert_eq!(consumer.state(), ConsumerState::Stopped);

    Ok(())
}

#[tokio::test]
async fn refused_login_stops_the_consumer() -> Result<()> {
    let broker = MemoryBroker::start_with_credentials("catalog", "s3cret");
    let recorder = Recorder::default();
    let consumer = Consumer::new(
        Arc::new(broker.connector("intruder", "guess")),
        helper::codec(),
        recorder.processor(),
        helper::fast_queue(&helper::queue_name(), ConsumerBehavior::Persistent),
    );

    consumer.start();
    wait_for_state(&consumer, ConsumerState::Stopped).await?;

    assert_eq!(broker.open_connections(), 0);

    Ok(())
}
