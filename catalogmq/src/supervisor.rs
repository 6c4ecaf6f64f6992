//! Keeps the consumers of the service in hand: starts them, restarts the ones which stopped on
//! their own if their queue is configured so, reports their state and closes them at shutdown.
use catalogmq_client::{ConsumerBehavior, ConsumerState, ManagedConsumer};
use log::{info, warn};
use serde_derive::Serialize;
use std::sync::Arc;
use std::time::Duration;

struct Supervised {
    consumer: Arc<dyn ManagedConsumer>,
    restart: bool,
}

#[derive(Debug, PartialEq, Eq, Serialize)]
pub(crate) struct ConsumerStatus {
    pub(crate) queue: String,
    pub(crate) behavior: ConsumerBehavior,
    pub(crate) state: ConsumerState,
}

#[derive(Default)]
pub(crate) struct Supervisor {
    consumers: Vec<Supervised>,
}

impl Supervisor {
    pub(crate) fn add(&mut self, consumer: Arc<dyn ManagedConsumer>, restart: bool) {
        self.consumers.push(Supervised { consumer, restart });
    }

    pub(crate) fn start_all(&self) {
        for supervised in &self.consumers {
            supervised.consumer.start();
        }

        info!("{} consumers started", self.consumers.len());
    }

    /// Start again every stopped consumer which may be restarted, returns how many were.
    pub(crate) fn tick(&self) -> usize {
        let mut restarted = 0;

        for supervised in self.consumers.iter().filter(|s| s.restart) {
            if supervised.consumer.state() == ConsumerState::Stopped {
                warn!("Consumer of queue {} is stopped, restarting it", supervised.consumer.queue_name());

                supervised.consumer.start();
                restarted += 1;
            }
        }

        restarted
    }

    /// Run [`Supervisor::tick`] periodically. It never returns.
    pub(crate) async fn run(&self, period: Duration) {
        let mut interval = tokio::time::interval(period);

        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            self.tick();
        }
    }

    pub(crate) fn statuses(&self) -> Vec<ConsumerStatus> {
        self.consumers
            .iter()
            .map(|s| ConsumerStatus {
                queue: s.consumer.queue_name().to_owned(),
                behavior: s.consumer.behavior(),
                state: s.consumer.state(),
            })
            .collect()
    }

    pub(crate) async fn close_all(&self) {
        for supervised in &self.consumers {
            supervised.consumer.close().await;
        }

        info!("All consumers closed");
    }
}
