use anyhow::Result;
use async_trait::async_trait;
use catalogmq_client::*;
use log::info;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

#[derive(Debug, Deserialize, Serialize)]
struct Tick {
    seq: u32,
    text: String,
}

/// Counts the ticks and reports once all of them arrived.
struct Counter {
    expected: u32,
    done: mpsc::Sender<u32>,
}

#[async_trait]
impl Processor<Tick> for Counter {
    async fn process(&self, tick: Tick) -> Result<()> {
        if tick.seq + 1 == self.expected {
            self.done.send(tick.seq + 1).await?;
        }

        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let queue = "q_pubsub";
    let message_count = 1024u32;

    catalogmq_client::setup_logger();

    let broker = MemoryBroker::start();
    let codec: Arc<dyn Codec<Tick>> = Arc::new(JsonCodec::new());
    let (done_tx, mut done_rx) = mpsc::channel(1);

    let consumer = Consumer::new(
        Arc::new(broker.clone()),
        Arc::clone(&codec),
        Arc::new(Counter {
            expected: message_count,
            done: done_tx,
        }),
        QueueConfig::new(queue).poll_interval(Duration::from_millis(100)),
    );

    consumer.start();

    let producer = Producer::new(Arc::new(broker.clone()), codec, queue);
    let text = "This will be the test message what we send over multiple times";

    let start = Instant::now();

    for seq in 0..message_count {
        producer
            .send(&Tick {
                seq,
                text: text.to_owned(),
            })
            .await?;
    }

    let received = done_rx.recv().await.unwrap_or_default();

    info!("{} messages went through in {:?}", received, start.elapsed());

    consumer.close().await;

    info!("{} handles left open", broker.open_handles());

    Ok(())
}
