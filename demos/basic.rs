use anyhow::Result;
use catalogmq_client::*;
use log::info;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize)]
struct Greeting {
    from: String,
    text: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    catalogmq_client::setup_logger();

    let broker = MemoryBroker::start();
    let codec: Arc<dyn Codec<Greeting>> = Arc::new(JsonCodec::pretty());

    let producer = Producer::new(Arc::new(broker.clone()), Arc::clone(&codec), "greetings");

    producer
        .send(&Greeting {
            from: "basic".to_owned(),
            text: "Hello, queue!".to_owned(),
        })
        .await?;

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        codec,
        processor_fn(|greeting: Greeting| {
            info!("{} says {:?}", greeting.from, greeting.text);

            Ok(())
        }),
        QueueConfig::new("greetings").behavior(ConsumerBehavior::SingleRead),
    );

    consumer.start();

    while consumer.state() == ConsumerState::Running {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    info!("Consumer is {:?}, {} handles open", consumer.state(), broker.open_handles());

    Ok(())
}
